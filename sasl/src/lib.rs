//! Client-side SASL mechanisms.
//!
//! This crate has no XMPP knowledge: it only implements the SASL
//! challenge/response logic for a small, fixed set of mechanisms. The
//! porter crate decides which mechanism to use and owns the state machine
//! that drives it across stanza-layer `<auth>`/`<challenge>`/`<response>`
//! elements.

pub mod error;
pub mod mechanisms;

pub use error::MechanismError;

/// Credentials handed to a mechanism at construction time.
///
/// `authzid` is rarely used by XMPP clients but several mechanisms accept
/// it, so it is threaded through uniformly.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub authzid: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
            authzid: None,
        }
    }

    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }
}

/// A single client-side SASL mechanism run.
///
/// A fresh `SaslMechanism` is constructed per authentication attempt; it is
/// not reusable across runs since it accumulates per-run state (nonces,
/// step counters).
pub trait SaslMechanism: Send {
    /// IANA-registered mechanism name, e.g. `"PLAIN"` or `"DIGEST-MD5"`.
    fn name(&self) -> &'static str;

    /// Initial response bytes to send with `<auth>`.
    ///
    /// Mechanisms with no initial response (such as DIGEST-MD5) return an
    /// empty vector; an empty initial response is sent as `<auth/>` with no
    /// `data` child by the caller, not omitted, so that the server can tell
    /// "no initial response" from "not yet asked".
    fn initial(&mut self) -> Result<Vec<u8>, MechanismError> {
        Ok(Vec::new())
    }

    /// Computes the response to a server challenge.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError>;

    /// Verifies additional data carried by the server's `<success/>`, if
    /// the mechanism defines mutual authentication at that point.
    fn verify_success(&mut self, _data: &[u8]) -> Result<(), MechanismError> {
        Ok(())
    }
}
