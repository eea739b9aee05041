//! RecordStore - durable per-record storage on a shared filesystem
//!
//! Every record is one JSON file; every category is one directory. Several
//! processes may read and write the same store concurrently.
//!
//! # Layout
//!
//! ```text
//! .cowork/
//! ├── sessions/
//! │   └── 0199a3c2-....json
//! ├── locks/
//! │   ├── .guard
//! │   └── src%2Fapp.ts.json
//! └── messages/
//!     ├── pending/
//!     └── processed/
//! ```
//!
//! # Write primitives
//!
//! - [`RecordStore::put`] replaces a record atomically (temp file + rename)
//! - [`RecordStore::create`] is the only exclusive create-if-absent primitive
//! - [`RecordStore::remove_if`] / [`RecordStore::update_if`] run under an
//!   advisory lock on the category so they only touch what they inspected

mod error;
mod id;
mod store;

pub use error::{StoreError, StoreResult};
pub use id::{decode_id, encode_id};
pub use store::{Fingerprint, RecordStore, Stamp};
