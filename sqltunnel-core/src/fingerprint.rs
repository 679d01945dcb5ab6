//! Stable fingerprints for pool routing and per-statement bookkeeping.

use std::fmt;
use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = SipHasher13::new_with_key(&[0u8; 16]);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Key of a shared connection pool, derived from the connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnHash(String);

impl ConnHash {
    pub fn new(url: &str, user: &str, password: &str, datasource_name: &str) -> Self {
        let hash = stable_hash(&(url, user, password, datasource_name));
        Self(format!("{hash:016x}"))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ConnHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ConnHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Circuit breaker and performance monitor key. The SQL is hashed exactly as
/// sent; literal values are not normalised away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationFingerprint(String);

impl OperationFingerprint {
    pub fn of_sql(sql: &str) -> Self {
        Self(format!("{:016x}", stable_hash(sql)))
    }
}

impl fmt::Display for OperationFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for OperationFingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_hash_is_deterministic_and_parameter_sensitive() {
        let a = ConnHash::new("duckdb::memory:", "u", "p", "");
        let b = ConnHash::new("duckdb::memory:", "u", "p", "");
        assert_eq!(a, b);
        assert_eq!(a.as_ref().len(), 16);

        assert_ne!(a, ConnHash::new("duckdb::memory:", "u", "other", ""));
        assert_ne!(a, ConnHash::new("duckdb::memory:", "u", "p", "reporting"));
        // Tuple hashing keeps field boundaries apart.
        assert_ne!(
            ConnHash::new("ab", "c", "", ""),
            ConnHash::new("a", "bc", "", "")
        );
    }

    #[test]
    fn fingerprint_hashes_literal_sql() {
        let one = OperationFingerprint::of_sql("SELECT 1");
        assert_eq!(one, OperationFingerprint::of_sql("SELECT 1"));
        assert_ne!(one, OperationFingerprint::of_sql("SELECT 2"));
        assert_ne!(one, OperationFingerprint::of_sql("select 1"));
    }
}
