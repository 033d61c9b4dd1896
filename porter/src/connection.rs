//! The transport collaborator: a framed, already-negotiated XML stream.
//!
//! Opening the TCP/TLS connection, DNS SRV resolution, StartTLS negotiation,
//! and XML tokenisation are all out of scope for the porter: it consumes an
//! already-open, already-secured stream of stanza-shaped events through
//! this trait, mirroring the way [`Client`](https://docs.rs/tokio-xmpp)
//! consumes its inner `XmppStream` through `Stream`/`Sink`.

use futures::{Sink, Stream};
use jid::Jid;
use minidom::Element;

use crate::error::ConnectionError;
use crate::ids;
use crate::stanza::Stanza;

/// An event read off the wire.
#[derive(Debug)]
pub enum InboundEvent {
    /// The opening `<stream:stream>` tag (or its re-opening after a stream reset).
    StreamOpen {
        /// The `from` attribute the server put on the stream header, if any.
        from: Option<Jid>,
        /// The stream `id` attribute.
        id: Option<String>,
        /// The `xml:lang` attribute, if any.
        lang: Option<String>,
    },
    /// A top-level `message`, `presence`, or `iq` stanza.
    Stanza(Stanza),
    /// A top-level element that is not a stanza: `<stream:features/>` and
    /// the SASL wrapper elements (`<challenge/>`, `<success/>`, `<failure/>`)
    /// all arrive this way, since they are stream-negotiation children, not
    /// message/presence/iq stanzas.
    Raw(Element),
    /// The closing `</stream:stream>` tag.
    StreamClose,
}

/// An item written to the wire.
#[derive(Debug)]
pub enum OutboundItem {
    /// A top-level stanza.
    Stanza(Stanza),
    /// A non-stanza top-level element, e.g. `<auth/>`/`<response/>` during
    /// SASL negotiation.
    Raw(Element),
    /// The closing `</stream:stream>` tag.
    Close,
}

/// A framed, negotiated duplex XML stream.
///
/// Implementors drive the actual socket; the porter only needs a
/// `Stream` of [`InboundEvent`]s and a `Sink` of [`OutboundItem`]s, plus a
/// source of fresh stanza ids and a way to reset the stream after SASL
/// negotiation succeeds (RFC 6120 §6.4.6).
pub trait FramedConnection:
    Stream<Item = Result<InboundEvent, ConnectionError>> + Sink<OutboundItem, Error = ConnectionError> + Unpin
{
    /// Tears down the current XML framing and reopens the stream against
    /// `to` (the server name) at protocol version `1.0`, per RFC 6120
    /// §6.4.6. Called once, immediately after SASL `<success/>`; the
    /// caller's future resolves once the reopen has been issued.
    fn reset_stream(&mut self, to: &str);

    /// Mints a fresh id, unique among ids generated within this connection's
    /// lifetime. The default implementation is suitable for production use;
    /// test doubles may override it for deterministic ids.
    fn new_id(&mut self) -> String {
        ids::make_id()
    }
}
