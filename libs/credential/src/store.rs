//! Credential validation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::header::Header;

/// Judges candidate headers read off a connection.
pub trait Validator: Send + Sync {
    /// Returns true if `header` names a known credential.
    fn validate(&self, header: &Header) -> bool;

    /// Record traffic for a session that was opened with `header`.
    ///
    /// Called once per successfully forwarded session.
    fn consume(&self, _header: &Header, _read: u64, _written: u64) {}
}

impl<F> Validator for F
where
    F: Fn(&Header) -> bool + Send + Sync,
{
    fn validate(&self, header: &Header) -> bool {
        self(header)
    }
}

/// Traffic totals for a single credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    /// Bytes read from clients.
    pub read: u64,
    /// Bytes written to clients.
    pub written: u64,
}

#[derive(Debug, Default)]
struct Counters {
    read: AtomicU64,
    written: AtomicU64,
}

/// In-memory credential store.
///
/// The set of credentials is fixed once the store is shared; traffic
/// counters are updated lock-free.
#[derive(Debug, Default)]
pub struct MemoryValidator {
    credentials: HashMap<Header, Counters>,
}

impl MemoryValidator {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the headers for `passwords`.
    pub fn with_passwords<I, S>(passwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut store = Self::new();
        for password in passwords {
            store.add_password(password.as_ref());
        }
        store
    }

    /// Add a credential by password. Returns false if it was already present.
    pub fn add_password(&mut self, password: &str) -> bool {
        self.add_header(Header::from_password(password))
    }

    /// Add a credential by header. Returns false if it was already present.
    pub fn add_header(&mut self, header: Header) -> bool {
        if self.credentials.contains_key(&header) {
            return false;
        }
        self.credentials.insert(header, Counters::default());
        true
    }

    /// Number of known credentials.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Returns true if no credentials are known.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Traffic recorded for `header`, if it is a known credential.
    pub fn traffic(&self, header: &Header) -> Option<Traffic> {
        self.credentials.get(header).map(|c| Traffic {
            read: c.read.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
        })
    }
}

impl Validator for MemoryValidator {
    fn validate(&self, header: &Header) -> bool {
        self.credentials.contains_key(header)
    }

    fn consume(&self, header: &Header, read: u64, written: u64) {
        if let Some(counters) = self.credentials.get(header) {
            counters.read.fetch_add(read, Ordering::Relaxed);
            counters.written.fetch_add(written, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HEADER_LEN;
    use rstest::rstest;

    #[rstest]
    #[case("password", true)]
    #[case("hunter2", true)]
    #[case("Password", false)]
    #[case("", false)]
    fn test_validate_by_password(#[case] password: &str, #[case] expected: bool) {
        let store = MemoryValidator::with_passwords(["password", "hunter2"]);
        assert_eq!(store.validate(&Header::from_password(password)), expected);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut store = MemoryValidator::new();
        assert!(store.is_empty());
        assert!(store.add_password("password"));
        assert!(!store.add_password("password"));
        assert!(!store.add_header(Header::from_password("password")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rejects_arbitrary_bytes() {
        let store = MemoryValidator::with_passwords(["password"]);
        assert!(!store.validate(&Header::from_bytes([b'a'; HEADER_LEN])));
    }

    #[test]
    fn test_consume_accumulates() {
        let store = MemoryValidator::with_passwords(["password"]);
        let header = Header::from_password("password");

        store.consume(&header, 10, 20);
        store.consume(&header, 5, 1);

        assert_eq!(
            store.traffic(&header),
            Some(Traffic {
                read: 15,
                written: 21
            })
        );
    }

    #[test]
    fn test_consume_ignores_unknown() {
        let store = MemoryValidator::new();
        let header = Header::from_password("nobody");
        store.consume(&header, 1, 1);
        assert_eq!(store.traffic(&header), None);
    }

    #[test]
    fn test_closure_validator() {
        let expected = Header::from_password("password");
        let validator = move |h: &Header| *h == expected;
        assert!(validator.validate(&expected));
        assert!(!validator.validate(&Header::from_password("other")));
    }
}
