//! Lock key derivation for session-scoped advisory locks.
//!
//! Advisory locks are addressed by a single 64-bit integer that is shared by
//! every user of the database. Case locks live in a reserved namespace so
//! they never collide with unrelated advisory lock users:
//!
//! ```text
//! key = namespace * scale + case_id        (0 <= case_id < scale)
//! ```
//!
//! Keys are computed on demand and never stored, except as an audit field on
//! the run record.

use crate::error::{ConfigError, ValidationError};
use crate::CaseId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default namespace reserved for case locks.
pub const DEFAULT_LOCK_NAMESPACE: i64 = 7_100;

/// Default number of case ids per namespace.
pub const DEFAULT_LOCK_SCALE: i64 = 1_000_000_000;

// ============================================================================
// LOCK KEY
// ============================================================================

/// A derived advisory lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(i64);

impl LockKey {
    /// Wrap a raw key (e.g. read back from a run record).
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw key as passed to the backend.
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Split into the (high, low) 32-bit halves Postgres reports in
    /// `pg_locks.classid` / `pg_locks.objid` for a bigint advisory lock.
    pub const fn split(self) -> (u32, u32) {
        let bits = self.0 as u64;
        ((bits >> 32) as u32, bits as u32)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// KEYSPACE
// ============================================================================

/// Namespace + scale pair that maps case ids onto lock keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockKeyspace {
    namespace: i64,
    scale: i64,
}

impl LockKeyspace {
    /// Keyspace with the default namespace and scale.
    pub const DEFAULT: LockKeyspace = LockKeyspace {
        namespace: DEFAULT_LOCK_NAMESPACE,
        scale: DEFAULT_LOCK_SCALE,
    };

    /// Create a keyspace, rejecting combinations whose largest key does not
    /// fit in a signed 64-bit integer.
    pub fn new(namespace: i64, scale: i64) -> Result<Self, ConfigError> {
        if namespace <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_namespace".to_string(),
                value: namespace.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if scale <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_scale".to_string(),
                value: scale.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        // Largest key is namespace * scale + (scale - 1).
        namespace
            .checked_mul(scale)
            .and_then(|base| base.checked_add(scale - 1))
            .ok_or(ConfigError::KeyspaceOverflow { namespace, scale })?;
        Ok(Self { namespace, scale })
    }

    pub fn namespace(&self) -> i64 {
        self.namespace
    }

    pub fn scale(&self) -> i64 {
        self.scale
    }

    /// Derive the lock key for a case.
    ///
    /// # Errors
    ///
    /// Returns `CaseIdOutOfRange` when `case_id >= scale`; such an id would
    /// alias a key in the next namespace.
    pub fn derive(&self, case_id: CaseId) -> Result<LockKey, ValidationError> {
        if case_id.get() >= self.scale {
            return Err(ValidationError::CaseIdOutOfRange {
                case_id,
                scale: self.scale,
            });
        }
        // Cannot overflow: bounds checked in `new`.
        Ok(LockKey(self.namespace * self.scale + case_id.get()))
    }

    /// Recover the case id from a key in this keyspace.
    pub fn case_for(&self, key: LockKey) -> Option<CaseId> {
        let base = self.namespace * self.scale;
        let offset = key.0.checked_sub(base)?;
        if (0..self.scale).contains(&offset) {
            CaseId::new(offset).ok()
        } else {
            None
        }
    }
}

impl Default for LockKeyspace {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Derive a lock key in the default keyspace.
pub fn derive_lock_key(case_id: CaseId) -> Result<LockKey, ValidationError> {
    LockKeyspace::DEFAULT.derive(case_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn case(id: i64) -> CaseId {
        CaseId::new(id).unwrap()
    }

    #[test]
    fn test_default_key_layout() {
        let key = derive_lock_key(case(42)).unwrap();
        assert_eq!(key.as_i64(), 7_100_000_000_042);
    }

    #[test]
    fn test_case_id_at_scale_is_rejected() {
        let keyspace = LockKeyspace::new(3, 100).unwrap();
        assert!(keyspace.derive(case(99)).is_ok());
        assert!(matches!(
            keyspace.derive(case(100)),
            Err(ValidationError::CaseIdOutOfRange { scale: 100, .. })
        ));
    }

    #[test]
    fn test_keyspace_overflow_is_rejected() {
        assert!(matches!(
            LockKeyspace::new(i64::MAX / 2, 4),
            Err(ConfigError::KeyspaceOverflow { .. })
        ));
        assert!(LockKeyspace::new(0, 10).is_err());
        assert!(LockKeyspace::new(10, 0).is_err());
    }

    #[test]
    fn test_split_matches_pg_locks_layout() {
        let key = LockKey::from_raw((5_i64 << 32) | 9);
        assert_eq!(key.split(), (5, 9));
    }

    #[test]
    fn test_case_for_outside_namespace() {
        let keyspace = LockKeyspace::new(3, 100).unwrap();
        assert_eq!(keyspace.case_for(LockKey::from_raw(299)), None);
        assert_eq!(keyspace.case_for(LockKey::from_raw(400)), None);
        assert_eq!(keyspace.case_for(LockKey::from_raw(342)), Some(case(42)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Distinct case ids in range never share a key.
        #[test]
        fn prop_derive_is_injective(a in 0..DEFAULT_LOCK_SCALE, b in 0..DEFAULT_LOCK_SCALE) {
            let ka = derive_lock_key(case(a)).unwrap();
            let kb = derive_lock_key(case(b)).unwrap();
            prop_assert_eq!(a == b, ka == kb);
        }

        /// Keys stay inside the reserved namespace and invert cleanly.
        #[test]
        fn prop_derive_roundtrips_through_case_for(id in 0..DEFAULT_LOCK_SCALE) {
            let keyspace = LockKeyspace::DEFAULT;
            let key = keyspace.derive(case(id)).unwrap();
            prop_assert_eq!(key.as_i64() / DEFAULT_LOCK_SCALE, DEFAULT_LOCK_NAMESPACE);
            prop_assert_eq!(keyspace.case_for(key), Some(case(id)));
        }
    }
}
