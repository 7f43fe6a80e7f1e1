//! Client-facing identities and naming rules.

use std::fmt;

use uuid::Uuid;

use crate::IdError;

/// Maximum length of a logical name.
pub const MAX_NAME_LENGTH: usize = 255;

/// A client-facing identity: either a UUID or a logical name.
///
/// Numeric record ids are deliberately not representable here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Uuid(Uuid),
    Name(String),
}

impl Identity {
    /// Parses a lookup identity.
    ///
    /// Integer-looking input is rejected before anything else so that a
    /// record id can never be mistaken for a name.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if is_int_like(s) {
            return Err(IdError::Numeric(s.to_string()));
        }
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Identity::Uuid(uuid));
        }
        if is_valid_logical_name(s) {
            return Ok(Identity::Name(s.to_string()));
        }
        Err(IdError::InvalidFormat {
            identity: s.to_string(),
        })
    }

    /// Returns the UUID if this identity is one.
    pub fn as_uuid(&self) -> Option<&Uuid> {
        match self {
            Identity::Uuid(uuid) => Some(uuid),
            Identity::Name(_) => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Uuid(uuid) => write!(f, "{uuid}"),
            Identity::Name(name) => f.write_str(name),
        }
    }
}

impl std::str::FromStr for Identity {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for Identity {
    fn from(uuid: Uuid) -> Self {
        Identity::Uuid(uuid)
    }
}

/// Returns true if `s` is the canonical decimal form of an integer.
///
/// `"42"` and `"-7"` are int-like; `"007"` and `"4 2"` are not.
pub fn is_int_like(s: &str) -> bool {
    s.parse::<i64>().map(|n| n.to_string() == s).unwrap_or(false)
}

/// Returns true if `s` parses as a UUID in any of its usual spellings.
pub fn is_uuid_like(s: &str) -> bool {
    Uuid::parse_str(s).is_ok()
}

/// Returns true if `s` is a valid logical name.
///
/// Names use the RFC 3986 unreserved characters only (`A-Z a-z 0-9 - . _ ~`)
/// and may not look like a UUID or an integer, which would make lookups
/// ambiguous.
pub fn is_valid_logical_name(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_NAME_LENGTH {
        return false;
    }
    let unreserved = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'));
    unreserved && !is_uuid_like(s) && !is_int_like(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(
            Identity::parse(&uuid.to_string()).unwrap(),
            Identity::Uuid(uuid)
        );
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(
            Identity::parse("node-1").unwrap(),
            Identity::Name("node-1".to_string())
        );
        assert_eq!(
            Identity::parse("pg.json").unwrap(),
            Identity::Name("pg.json".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_numeric() {
        assert!(matches!(
            Identity::parse("12345").unwrap_err(),
            IdError::Numeric(_)
        ));
    }

    #[test]
    fn test_parse_rejects_reserved_characters() {
        assert!(matches!(
            Identity::parse("ba!na!na!").unwrap_err(),
            IdError::InvalidFormat { .. }
        ));
        assert!(matches!(
            Identity::parse("invalid/name").unwrap_err(),
            IdError::InvalidFormat { .. }
        ));
    }

    #[test]
    fn test_parse_empty() {
        assert!(Identity::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_int_like() {
        assert!(is_int_like("0"));
        assert!(is_int_like("-7"));
        assert!(!is_int_like("007"));
        assert!(!is_int_like("1.5"));
        assert!(!is_int_like("node1"));
    }

    #[test]
    fn test_logical_names() {
        assert!(is_valid_logical_name("foo"));
        assert!(is_valid_logical_name("a~b_c-d.e"));
        assert!(!is_valid_logical_name("aa:bb_cc"));
        assert!(!is_valid_logical_name("this/is/not a/node/name"));
        assert!(!is_valid_logical_name(&"a".repeat(MAX_NAME_LENGTH + 1)));
        assert!(!is_valid_logical_name("1a1a1a1a-2b2b-3c3c-4d4d-5e5e5e5e5e5e"));
        assert!(!is_valid_logical_name("42"));
    }

    proptest! {
        #[test]
        fn prop_generated_uuids_parse_as_uuid(bytes in any::<[u8; 16]>()) {
            let uuid = Uuid::from_bytes(bytes);
            prop_assert_eq!(Identity::parse(&uuid.to_string()).unwrap(), Identity::Uuid(uuid));
        }

        #[test]
        fn prop_integers_are_rejected(n in any::<i64>()) {
            prop_assert!(matches!(Identity::parse(&n.to_string()), Err(IdError::Numeric(_))));
        }

        #[test]
        fn prop_lettered_names_parse_as_names(name in "[a-z][a-z0-9._~-]{0,40}") {
            prop_assert_eq!(Identity::parse(&name).unwrap(), Identity::Name(name.clone()));
        }
    }
}
