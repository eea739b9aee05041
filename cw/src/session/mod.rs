//! Session registry: worker identity and liveness

mod registry;

pub use registry::{ReapReport, SessionRegistry};
