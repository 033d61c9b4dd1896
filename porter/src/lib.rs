//! A full-duplex [XMPP](https://xmpp.org/) stanza porter: outbound
//! serialisation, priority-ordered inbound dispatch, IQ request/response
//! correlation, and graceful close, layered over an already-negotiated,
//! already-secured byte stream.
//!
//! SASL authentication (see [`auth`]) and the roster cache (in the sibling
//! `xmpp-roster` crate) are built on top of this porter rather than inside
//! it: authentication runs before the porter is started, directly against
//! the [`connection::FramedConnection`]; the roster is a stateful handler
//! registered through [`porter::Porter::register_handler`] like any other
//! application-level consumer.
//!
//! # Getting started
//!
//! Build a [`connection::FramedConnection`] implementation for your
//! transport (TLS negotiation, DNS/SRV resolution, and the XML
//! tokeniser/serialiser itself are all out of scope for this crate), run
//! [`auth::Sasl::authenticate`] against it once the server's stream
//! features are known, then hand the now-authenticated connection to
//! [`porter::Porter::new`] and call `start()`.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub mod auth;
pub mod cancel;
pub mod connection;
pub mod error;
pub mod ids;
pub mod ns;
pub mod porter;
pub mod stanza;

#[cfg(any(test, feature = "test-util"))]
pub mod test_connection;

/// The full-duplex stanza dispatcher. See [`porter::Porter`] for its documentation.
pub use crate::porter::Porter;
/// A Jabber ID. See [`jid::Jid`] for its documentation.
pub use jid::Jid;
/// A decomposed XMPP stanza. See [`stanza::Stanza`] for its documentation.
pub use stanza::Stanza;
