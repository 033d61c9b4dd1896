//! Error types for the porter, the SASL authenticator, and the roster cache.

use std::error::Error as StdError;
use std::fmt;

use sasl::MechanismError;

/// An opaque error surfaced by the underlying [`FramedConnection`](crate::connection::FramedConnection).
///
/// The porter does not know or care what transport the connection is built
/// on; it only needs to propagate failures and attach them to the right
/// pending operation.
#[derive(Debug)]
pub struct ConnectionError(pub Box<dyn StdError + Send + Sync>);

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection error: {}", self.0)
    }
}

impl StdError for ConnectionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Top-level error returned by porter operations.
#[derive(Debug)]
pub enum PorterError {
    /// The porter is already closed; no further sends or registrations are possible.
    Closed,
    /// The porter is in the process of closing (`flushing` or `local_closed`);
    /// no new outbound sends are accepted, but already-queued ones will still complete.
    Closing,
    /// `close_async` was called before `start` and the peer has not closed either.
    NotStarted,
    /// `close_async` was called while another close is already in progress.
    Pending,
    /// `send_iq_async` was called with a stanza that is not `kind=iq` with
    /// `sub_kind` `get` or `set`.
    NotIq,
    /// The operation was cancelled via its [`CancelToken`](crate::cancel::CancelToken).
    Cancelled,
    /// The underlying connection failed.
    Connection(ConnectionError),
}

impl fmt::Display for PorterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PorterError::Closed => write!(f, "porter is closed"),
            PorterError::Closing => write!(f, "porter is closing"),
            PorterError::NotStarted => write!(f, "porter was never started"),
            PorterError::Pending => write!(f, "a close is already in progress"),
            PorterError::NotIq => write!(f, "stanza is not an iq get/set"),
            PorterError::Cancelled => write!(f, "operation cancelled"),
            PorterError::Connection(e) => write!(f, "{}", e),
        }
    }
}

impl StdError for PorterError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PorterError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for PorterError {
    fn from(e: ConnectionError) -> Self {
        PorterError::Connection(e)
    }
}

/// Error enumeration for IQ request failures.
///
/// Note that an `Ok(_)` result from awaiting an IQ request does **not** imply
/// a successful execution of the remote command: the stanza reply may carry
/// `sub_kind == Error`. `IqFailure` is only for failures to ever get a
/// well-formed, authorized reply at all.
#[derive(Debug)]
pub enum IqFailure {
    /// The porter was dropped, or closed, before a reply arrived.
    LostPorter,
    /// The request could not be sent.
    Send(PorterError),
    /// The request was cancelled via its [`CancelToken`](crate::cancel::CancelToken).
    Cancelled,
}

impl fmt::Display for IqFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IqFailure::LostPorter => write!(f, "porter dropped before the IQ response arrived"),
            IqFailure::Send(e) => write!(f, "failed to send IQ request: {}", e),
            IqFailure::Cancelled => write!(f, "IQ request cancelled"),
        }
    }
}

impl StdError for IqFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            IqFailure::Send(e) => Some(e),
            IqFailure::LostPorter | IqFailure::Cancelled => None,
        }
    }
}

/// Error produced by the SASL authenticator.
#[derive(Debug)]
pub enum AuthError {
    /// The intersection of server-advertised and client-implemented
    /// mechanisms, after the cleartext policy gate, was empty.
    NoSupportedMechanisms,
    /// The server did not advertise SASL support (no `<mechanisms/>` element) at all.
    SaslNotSupported,
    /// The local mechanism implementation failed, e.g. to parse a challenge,
    /// or rejected the server's mutual-auth proof (`rspauth` mismatch).
    Mechanism(MechanismError),
    /// The server returned a `<failure/>` with the given defined condition.
    ServerFailed(String),
    /// The server sent something other than `challenge`, `success`, or
    /// `failure` in response to an `auth`/`response` element.
    InvalidReply,
    /// The underlying connection or porter failed mid-exchange.
    ConnectionLost(PorterError),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::NoSupportedMechanisms => {
                write!(f, "no SASL mechanism supported by both client and server is allowed by policy")
            }
            AuthError::SaslNotSupported => write!(f, "server did not advertise SASL support"),
            AuthError::Mechanism(e) => write!(f, "local SASL implementation error: {}", e),
            AuthError::ServerFailed(condition) => write!(f, "authentication failed: {}", condition),
            AuthError::InvalidReply => write!(f, "unexpected reply during SASL negotiation"),
            AuthError::ConnectionLost(e) => write!(f, "{}", e),
        }
    }
}

impl StdError for AuthError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AuthError::Mechanism(e) => Some(e),
            AuthError::ConnectionLost(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MechanismError> for AuthError {
    fn from(e: MechanismError) -> Self {
        AuthError::Mechanism(e)
    }
}

impl From<PorterError> for AuthError {
    fn from(e: PorterError) -> Self {
        AuthError::ConnectionLost(e)
    }
}

impl From<ConnectionError> for AuthError {
    fn from(e: ConnectionError) -> Self {
        AuthError::ConnectionLost(PorterError::Connection(e))
    }
}

/// Error produced by the roster cache.
#[derive(Debug)]
pub enum RosterError {
    /// The initial `jabber:iq:roster` fetch failed to send or never got a reply.
    Fetch(IqFailure),
    /// The fetch got a reply, but it was a `sub_kind == Error` stanza rather
    /// than a roster `<query/>`.
    FetchRejected,
    /// A contact was requested before the initial fetch completed.
    NotReady,
}

impl fmt::Display for RosterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RosterError::Fetch(e) => write!(f, "roster fetch failed: {}", e),
            RosterError::FetchRejected => write!(f, "server rejected the roster fetch"),
            RosterError::NotReady => write!(f, "roster has not completed its initial fetch"),
        }
    }
}

impl StdError for RosterError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RosterError::Fetch(e) => Some(e),
            RosterError::FetchRejected | RosterError::NotReady => None,
        }
    }
}

impl From<IqFailure> for RosterError {
    fn from(e: IqFailure) -> Self {
        RosterError::Fetch(e)
    }
}
