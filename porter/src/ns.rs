//! Interned XML namespaces.
//!
//! Handler registration happens once; dispatch happens on every inbound
//! stanza. Interning namespace strings at registration time turns the
//! namespace comparisons on the dispatch hot path into integer equality
//! instead of string comparison.

use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Mutex;
use string_interner::symbol::DefaultSymbol;
use string_interner::StringInterner;

static INTERNER: Lazy<Mutex<StringInterner<DefaultSymbol>>> =
    Lazy::new(|| Mutex::new(StringInterner::default()));

/// A namespace, interned to a small `Copy` handle.
///
/// Interning is append-only: two `NsTag`s are equal iff they were interned
/// from equal strings, regardless of which call interned them first, so
/// tests may intern namespaces in any order without affecting outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NsTag(DefaultSymbol);

impl NsTag {
    /// Interns `ns`, returning its tag.
    pub fn intern(ns: &str) -> NsTag {
        NsTag(INTERNER.lock().unwrap().get_or_intern(ns))
    }

    /// Resolves this tag back to its namespace string.
    pub fn as_str(&self) -> String {
        INTERNER
            .lock()
            .unwrap()
            .resolve(self.0)
            .expect("NsTag symbols are never removed from the interner")
            .to_string()
    }
}

impl fmt::Display for NsTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_intern_to_equal_tags() {
        let a = NsTag::intern("jabber:iq:roster");
        let b = NsTag::intern("jabber:iq:roster");
        assert_eq!(a, b);
    }

    #[test]
    fn different_strings_intern_to_different_tags() {
        let a = NsTag::intern("jabber:client");
        let b = NsTag::intern("jabber:server");
        assert_ne!(a, b);
    }

    #[test]
    fn round_trips_through_as_str() {
        let tag = NsTag::intern("urn:ietf:params:xml:ns:xmpp-sasl");
        assert_eq!(tag.as_str(), "urn:ietf:params:xml:ns:xmpp-sasl");
    }
}
