//! Lease-based locking over named resources
//!
//! Write and exclusive leases share one slot record per resource, claimed
//! with the store's exclusive create. Read leases get one record per holder.
//! A writer announces itself in the slot and then looks for live readers; a
//! reader announces its record and then looks at the slot. Whichever side
//! sees the other withdraws, so a reader and a writer are never both granted.

mod manager;

pub use manager::LockManager;
