//! Lock leases over named shared resources

use std::time::Duration;

use chrono::{DateTime, Utc};
use recordstore::encode_id;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{chrono_duration, elapsed};

/// Access mode of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Read,
    #[default]
    Write,
    Exclusive,
}

impl LockMode {
    /// Read leases may be shared with other read leases
    pub fn is_shared(self) -> bool {
        self == Self::Read
    }

    /// Whether two different holders may hold these modes at once
    pub fn compatible_with(self, other: LockMode) -> bool {
        self.is_shared() && other.is_shared()
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

impl std::str::FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "exclusive" => Ok(Self::Exclusive),
            _ => Err(format!("Unknown lock mode: {}", s)),
        }
    }
}

/// Record id of the write/exclusive slot for a resource
///
/// Slot ids and reader ids live in disjoint namespaces, so no resource key
/// can name another resource's lease.
pub fn slot_id(resource_key: &str) -> String {
    format!("slot:{}", resource_key)
}

/// Record id of one holder's read lease on a resource
///
/// The key is escaped so it contains no `:`, which keeps the key/holder split
/// unambiguous.
pub fn reader_id(resource_key: &str, holder: &str) -> String {
    format!("read:{}:{}", encode_id(resource_key), holder)
}

/// A time-bounded claim on a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Unique per grant; distinguishes a renewed or re-taken lease from an old one
    pub lease_id: String,
    pub resource_key: String,
    pub holder: String,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub operation: Option<String>,
}

impl Lock {
    /// Create a lease starting now
    pub fn new(
        resource_key: impl Into<String>,
        mode: LockMode,
        holder: impl Into<String>,
        ttl: Duration,
        operation: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            lease_id: Uuid::now_v7().to_string(),
            resource_key: resource_key.into(),
            holder: holder.into(),
            mode,
            acquired_at: now,
            expires_at: now + chrono_duration(ttl),
            operation,
        }
    }

    /// Store record id for this lease
    pub fn record_id(&self) -> String {
        if self.mode.is_shared() {
            reader_id(&self.resource_key, &self.holder)
        } else {
            slot_id(&self.resource_key)
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time since the lease was granted
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.acquired_at, now)
    }

    /// Time left before expiry
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        elapsed(now, self.expires_at)
    }

    /// Would this lease block `holder` from taking `mode` on the same resource?
    pub fn blocks(&self, mode: LockMode, holder: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.holder != holder && !self.mode.compatible_with(mode)
    }

    /// The same lease with a fresh expiry
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: Utc::now() + chrono_duration(ttl),
            ..self.clone()
        }
    }

    /// Display summary
    pub fn summary(&self, now: DateTime<Utc>) -> LockSummary {
        LockSummary {
            resource_key: self.resource_key.clone(),
            holder: self.holder.clone(),
            mode: self.mode,
            operation: self.operation.clone(),
            age_secs: self.age(now).as_secs(),
            remaining_secs: self.remaining(now).as_secs(),
        }
    }
}

/// Why an acquire was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub resource_key: String,
    pub holder: String,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub operation: Option<String>,
}

impl LockConflict {
    /// How long the blocking lease has been held
    pub fn lease_age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.acquired_at, now)
    }
}

impl From<&Lock> for LockConflict {
    fn from(lock: &Lock) -> Self {
        Self {
            resource_key: lock.resource_key.clone(),
            holder: lock.holder.clone(),
            mode: lock.mode,
            acquired_at: lock.acquired_at,
            expires_at: lock.expires_at,
            operation: lock.operation.clone(),
        }
    }
}

impl std::fmt::Display for LockConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} is held ({}) by {} since {}",
            self.resource_key,
            self.mode,
            self.holder,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Outcome of an acquire attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Granted(Lock),
    Conflict(LockConflict),
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn lock(&self) -> Option<&Lock> {
        match self {
            Self::Granted(lock) => Some(lock),
            Self::Conflict(_) => None,
        }
    }

    pub fn conflict(&self) -> Option<&LockConflict> {
        match self {
            Self::Granted(_) => None,
            Self::Conflict(conflict) => Some(conflict),
        }
    }
}

/// Lock view for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSummary {
    pub resource_key: String,
    pub holder: String,
    pub mode: LockMode,
    pub operation: Option<String>,
    pub age_secs: u64,
    pub remaining_secs: u64,
}

impl std::fmt::Display for LockSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] held by {} for {}s, expires in {}s",
            self.resource_key, self.mode, self.holder, self.age_secs, self.remaining_secs
        )?;
        if let Some(op) = &self.operation {
            write!(f, " ({})", op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_mode() -> impl Strategy<Value = LockMode> {
        prop_oneof![Just(LockMode::Read), Just(LockMode::Write), Just(LockMode::Exclusive)]
    }

    #[test]
    fn test_record_ids() {
        let write = Lock::new("src/app.ts", LockMode::Write, "s1", Duration::from_secs(60), None);
        assert_eq!(write.record_id(), "slot:src/app.ts");

        let read = Lock::new("src/app.ts", LockMode::Read, "s1", Duration::from_secs(60), None);
        assert_eq!(read.record_id(), "read:src%2Fapp.ts:s1");
    }

    #[test]
    fn test_keys_cannot_alias_read_leases() {
        assert_ne!(slot_id(&reader_id("notes", "b")), reader_id("notes", "b"));
        assert_ne!(slot_id("read:notes:b"), reader_id("notes", "b"));
        assert_ne!(reader_id("a:b", "c"), reader_id("a", "b:c"));
    }

    #[test]
    fn test_expiry() {
        let lock = Lock::new("k", LockMode::Write, "s1", Duration::from_secs(5), None);
        let now = lock.acquired_at;
        assert!(!lock.is_expired(now));
        assert!(lock.is_expired(now + chrono::Duration::seconds(5)));
        assert_eq!(lock.remaining(now + chrono::Duration::seconds(6)), Duration::ZERO);
    }

    #[test]
    fn test_expired_lease_blocks_nobody() {
        let lock = Lock::new("k", LockMode::Exclusive, "s1", Duration::from_secs(5), None);
        let later = lock.expires_at + chrono::Duration::seconds(1);
        assert!(lock.blocks(LockMode::Write, "s2", lock.acquired_at));
        assert!(!lock.blocks(LockMode::Write, "s2", later));
    }

    #[test]
    fn test_renewed_keeps_identity() {
        let lock = Lock::new("k", LockMode::Write, "s1", Duration::from_secs(1), None);
        let renewed = lock.renewed(Duration::from_secs(60));
        assert_eq!(renewed.lease_id, lock.lease_id);
        assert_eq!(renewed.acquired_at, lock.acquired_at);
        assert!(renewed.expires_at > lock.expires_at);
    }

    #[test]
    fn test_conflict_display_names_holder() {
        let lock = Lock::new("src/app.ts", LockMode::Write, "worker-a", Duration::from_secs(60), None);
        let conflict = LockConflict::from(&lock);
        let text = conflict.to_string();
        assert!(text.contains("src/app.ts"));
        assert!(text.contains("worker-a"));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("READ".parse::<LockMode>().unwrap(), LockMode::Read);
        assert_eq!(serde_json::to_string(&LockMode::Exclusive).unwrap(), "\"exclusive\"");
        assert!("shared".parse::<LockMode>().is_err());
    }

    proptest! {
        #[test]
        fn prop_only_readers_share(a in any_mode(), b in any_mode()) {
            let shared = a.compatible_with(b);
            prop_assert_eq!(shared, a == LockMode::Read && b == LockMode::Read);
            prop_assert_eq!(shared, b.compatible_with(a));
        }

        #[test]
        fn prop_lease_ids_are_distinct(
            k1 in "[a-z:#/.]{1,8}", h1 in "[a-z:#]{1,6}",
            k2 in "[a-z:#/.]{1,8}", h2 in "[a-z:#]{1,6}",
        ) {
            prop_assert_ne!(slot_id(&k1), reader_id(&k2, &h2));
            if (&k1, &h1) != (&k2, &h2) {
                prop_assert_ne!(reader_id(&k1, &h1), reader_id(&k2, &h2));
            }
        }

        #[test]
        fn prop_holder_never_blocks_itself(a in any_mode(), b in any_mode()) {
            let lock = Lock::new("k", a, "same", Duration::from_secs(60), None);
            prop_assert!(!lock.blocks(b, "same", lock.acquired_at));
        }
    }
}
