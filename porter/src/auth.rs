//! The SASL authenticator: drives `<auth>`/`<challenge>`/`<response>`
//! negotiation over a raw connection, ahead of the porter's stanza-level
//! dispatch taking over.
//!
//! Mechanism implementations themselves (`PLAIN`, `DIGEST-MD5`) live in the
//! sibling `sasl` crate behind its `SaslMechanism` trait; this module only
//! owns mechanism *selection* and the stanza-layer state machine that
//! drives whichever mechanism was picked.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use minidom::rxml::NcName;
use minidom::Element;

use sasl::mechanisms::{DigestMd5, Plain};
use sasl::{Credentials, SaslMechanism};

use crate::connection::{FramedConnection, InboundEvent, OutboundItem};
use crate::error::AuthError;

const XMPP_SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

fn ncname(s: &str) -> NcName {
    NcName::try_from(s).unwrap_or_else(|_| panic!("invalid NCName: {s}"))
}

/// Mechanisms this crate implements, in preference order (first tried
/// first) once the cleartext policy gate has been applied.
const PREFERENCE_ORDER: &[&str] = &["DIGEST-MD5", "PLAIN"];

type UsernameCallback = Box<dyn FnMut() -> String + Send>;
type PasswordCallback = Box<dyn FnMut() -> String + Send>;

/// Drives a single SASL authentication attempt.
///
/// A `Sasl` is not reusable across attempts: [`authenticate`](Sasl::authenticate)
/// consumes `self`.
pub struct Sasl {
    on_username: Option<UsernameCallback>,
    on_password: Option<PasswordCallback>,
}

impl Default for Sasl {
    fn default() -> Self {
        Sasl { on_username: None, on_password: None }
    }
}

impl Sasl {
    /// Builds a fresh authenticator with no credential callbacks installed.
    pub fn new() -> Self {
        Sasl::default()
    }

    /// Installs the callback invoked, at most once, if the chosen mechanism
    /// needs a username.
    pub fn on_username_requested(mut self, callback: impl FnMut() -> String + Send + 'static) -> Self {
        self.on_username = Some(Box::new(callback));
        self
    }

    /// Installs the callback invoked, at most once, if the chosen mechanism
    /// needs a password.
    pub fn on_password_requested(mut self, callback: impl FnMut() -> String + Send + 'static) -> Self {
        self.on_password = Some(Box::new(callback));
        self
    }

    fn credentials(&mut self) -> Credentials {
        let username = self.on_username.as_mut().map(|f| f()).unwrap_or_default();
        let password = self.on_password.as_mut().map(|f| f()).unwrap_or_default();
        Credentials::new(username, password)
    }

    /// Selects a mechanism, runs the challenge/response exchange to
    /// completion, and on success reopens the connection's stream against
    /// `server_name` (RFC 6120 §6.4.6).
    ///
    /// `features_stanza` is the `<stream:features>` element (or equivalent)
    /// the connection most recently produced; it is inspected for a
    /// `<mechanisms>` child in the SASL namespace.
    pub async fn authenticate<C: FramedConnection>(
        mut self,
        server_name: &str,
        connection: &mut C,
        features_stanza: &Element,
        allow_cleartext: bool,
    ) -> Result<(), AuthError> {
        let offered = offered_mechanisms(features_stanza).ok_or(AuthError::SaslNotSupported)?;
        let chosen = select_mechanism(&offered, allow_cleartext).ok_or(AuthError::NoSupportedMechanisms)?;

        let credentials = self.credentials();
        let mut mechanism: Box<dyn SaslMechanism> = match chosen {
            "DIGEST-MD5" => Box::new(DigestMd5::new(credentials, server_name)),
            "PLAIN" => Box::new(Plain::new(credentials)),
            other => unreachable!("select_mechanism only returns implemented names, got {other}"),
        };

        let initial = mechanism.initial().map_err(AuthError::from)?;
        send_auth(connection, mechanism.name(), &initial).await?;

        loop {
            let event = connection
                .next()
                .await
                .ok_or(AuthError::InvalidReply)?
                .map_err(AuthError::from)?;
            let element = match event {
                InboundEvent::Raw(element) => element,
                _ => return Err(AuthError::InvalidReply),
            };
            match element.name() {
                "challenge" if element.ns() == XMPP_SASL_NS => {
                    let challenge = decode_body(&element)?;
                    let response = mechanism.respond(&challenge).map_err(AuthError::from)?;
                    send_response(connection, &response).await?;
                }
                "success" if element.ns() == XMPP_SASL_NS => {
                    let data = decode_body(&element)?;
                    mechanism.verify_success(&data).map_err(AuthError::from)?;
                    connection.reset_stream(server_name);
                    return Ok(());
                }
                "failure" if element.ns() == XMPP_SASL_NS => {
                    let condition = element
                        .children()
                        .next()
                        .map(|child| child.name().to_string())
                        .unwrap_or_else(|| "unknown-condition".to_string());
                    return Err(AuthError::ServerFailed(condition));
                }
                _ => return Err(AuthError::InvalidReply),
            }
        }
    }
}

fn offered_mechanisms(features_stanza: &Element) -> Option<Vec<String>> {
    let mechanisms_el = features_stanza
        .children()
        .find(|child| child.name() == "mechanisms" && child.ns() == XMPP_SASL_NS)?;
    Some(
        mechanisms_el
            .children()
            .filter(|child| child.name() == "mechanism")
            .map(|child| child.text())
            .collect(),
    )
}

fn select_mechanism(offered: &[String], allow_cleartext: bool) -> Option<&'static str> {
    PREFERENCE_ORDER.iter().copied().find(|candidate| {
        if *candidate == "PLAIN" && !allow_cleartext {
            return false;
        }
        offered.iter().any(|name| name == candidate)
    })
}

fn decode_body(element: &Element) -> Result<Vec<u8>, AuthError> {
    let text = element.text();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    BASE64
        .decode(text.trim())
        .map_err(|e| AuthError::Mechanism(sasl::MechanismError::MalformedChallenge(e.to_string())))
}

async fn send_auth<C: FramedConnection>(
    connection: &mut C,
    mechanism: &str,
    initial: &[u8],
) -> Result<(), AuthError> {
    let mut builder = Element::builder("auth", XMPP_SASL_NS).attr(ncname("mechanism"), mechanism);
    if !initial.is_empty() {
        builder = builder.append(BASE64.encode(initial));
    }
    connection
        .send(OutboundItem::Raw(builder.build()))
        .await
        .map_err(AuthError::from)
}

async fn send_response<C: FramedConnection>(connection: &mut C, response: &[u8]) -> Result<(), AuthError> {
    let mut builder = Element::builder("response", XMPP_SASL_NS);
    if !response.is_empty() {
        builder = builder.append(BASE64.encode(response));
    }
    connection
        .send(OutboundItem::Raw(builder.build()))
        .await
        .map_err(AuthError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_connection::TestConnection;

    fn features_with_mechanisms(names: &[&str]) -> Element {
        let mut mechanisms = Element::builder("mechanisms", XMPP_SASL_NS);
        for name in names {
            mechanisms =
                mechanisms.append(Element::builder("mechanism", XMPP_SASL_NS).append(name.to_string()).build());
        }
        Element::builder("features", "http://etherx.jabber.org/streams")
            .append(mechanisms.build())
            .build()
    }

    #[test]
    fn selects_digest_md5_over_plain_when_both_offered() {
        let offered = vec!["PLAIN".to_string(), "DIGEST-MD5".to_string()];
        assert_eq!(select_mechanism(&offered, true), Some("DIGEST-MD5"));
    }

    #[test]
    fn drops_plain_when_cleartext_forbidden() {
        let offered = vec!["PLAIN".to_string()];
        assert_eq!(select_mechanism(&offered, false), None);
    }

    #[test]
    fn falls_back_to_plain_when_digest_md5_not_offered() {
        let offered = vec!["PLAIN".to_string()];
        assert_eq!(select_mechanism(&offered, true), Some("PLAIN"));
    }

    #[tokio::test]
    async fn missing_mechanisms_element_is_sasl_not_supported() {
        let mut conn = TestConnection::new();
        let features = Element::builder("features", "http://etherx.jabber.org/streams").build();
        let sasl = Sasl::new();
        let err = sasl.authenticate("example.net", &mut conn, &features, true).await.unwrap_err();
        assert!(matches!(err, AuthError::SaslNotSupported));
    }

    #[tokio::test]
    async fn empty_intersection_is_no_supported_mechanisms() {
        let mut conn = TestConnection::new();
        let features = features_with_mechanisms(&["GSSAPI"]);
        let sasl = Sasl::new();
        let err = sasl.authenticate("example.net", &mut conn, &features, true).await.unwrap_err();
        assert!(matches!(err, AuthError::NoSupportedMechanisms));
    }

    #[tokio::test]
    async fn plain_success_round_trip_resets_stream() {
        let conn = TestConnection::new();
        conn.on_send(|item| match item {
            OutboundItem::Raw(el) if el.name() == "auth" => {
                vec![InboundEvent::Raw(Element::builder("success", XMPP_SASL_NS).build())]
            }
            _ => vec![],
        });
        let mut driver = conn.clone();
        let features = features_with_mechanisms(&["PLAIN"]);
        let sasl = Sasl::new()
            .on_username_requested(|| "juliet".to_string())
            .on_password_requested(|| "r0m30".to_string());
        sasl.authenticate("example.net", &mut driver, &features, true).await.unwrap();
        assert_eq!(conn.reset_count(), 1);
        assert_eq!(conn.reset_to().as_deref(), Some("example.net"));
        let sent = conn.sent();
        assert!(matches!(&sent[0], OutboundItem::Raw(el) if el.name() == "auth" && el.attr("mechanism") == Some("PLAIN")));
    }

    #[tokio::test]
    async fn server_failure_is_reported_with_condition() {
        let conn = TestConnection::new();
        conn.on_send(|item| match item {
            OutboundItem::Raw(el) if el.name() == "auth" => {
                let failure = Element::builder("failure", XMPP_SASL_NS)
                    .append(Element::builder("not-authorized", XMPP_SASL_NS).build())
                    .build();
                vec![InboundEvent::Raw(failure)]
            }
            _ => vec![],
        });
        let mut driver = conn.clone();
        let features = features_with_mechanisms(&["PLAIN"]);
        let sasl = Sasl::new().on_username_requested(|| "juliet".to_string()).on_password_requested(|| "bad".to_string());
        let err = sasl.authenticate("example.net", &mut driver, &features, true).await.unwrap_err();
        assert!(matches!(err, AuthError::ServerFailed(cond) if cond == "not-authorized"));
    }

    #[tokio::test]
    async fn digest_md5_drives_two_challenges_then_succeeds() {
        use md5::{Digest, Md5};

        let username = "chris";
        let password = "secret";
        let server = "elwood.innosoft.com";

        let conn = TestConnection::new();
        let conn_for_handler = conn.clone();
        conn.on_send(move |item| {
            let OutboundItem::Raw(el) = item else { return vec![] };
            match el.name() {
                "auth" => {
                    let challenge = r#"realm="elwood.innosoft.com",nonce="OA6MG9tEQGm2hh",qop="auth",charset=utf-8"#;
                    vec![challenge_event(challenge)]
                }
                "response" => {
                    let text = el.text();
                    if text.is_empty() {
                        // second response: client accepted rspauth, send success
                        vec![InboundEvent::Raw(Element::builder("success", XMPP_SASL_NS).build())]
                    } else {
                        let decoded = BASE64.decode(text.trim()).unwrap();
                        let decoded = String::from_utf8(decoded).unwrap();
                        let ha1 = {
                            let mut inner = Md5::new();
                            inner.update(username.as_bytes());
                            inner.update(b":elwood.innosoft.com:");
                            inner.update(password.as_bytes());
                            let inner_digest = inner.finalize();
                            let nonce = extract(&decoded, "nonce");
                            let cnonce = extract(&decoded, "cnonce");
                            let mut outer = Md5::new();
                            outer.update(inner_digest);
                            outer.update(b":");
                            outer.update(nonce.as_bytes());
                            outer.update(b":");
                            outer.update(cnonce.as_bytes());
                            outer.finalize()
                        };
                        let nonce = extract(&decoded, "nonce");
                        let cnonce = extract(&decoded, "cnonce");
                        let nc = extract(&decoded, "nc");
                        let qop = extract(&decoded, "qop");
                        let ha2 = {
                            let mut h = Md5::new();
                            h.update(b":");
                            h.update(format!("xmpp/{server}").as_bytes());
                            hex(&h.finalize())
                        };
                        let rspauth = {
                            let mut h = Md5::new();
                            h.update(hex(&ha1).as_bytes());
                            h.update(b":");
                            h.update(nonce.as_bytes());
                            h.update(b":");
                            h.update(nc.as_bytes());
                            h.update(b":");
                            h.update(cnonce.as_bytes());
                            h.update(b":");
                            h.update(qop.as_bytes());
                            h.update(b":");
                            h.update(ha2.as_bytes());
                            hex(&h.finalize())
                        };
                        vec![challenge_event(&format!("rspauth=\"{rspauth}\""))]
                    }
                }
                _ => vec![],
            }
        });
        let _ = conn_for_handler;

        fn hex(bytes: &[u8]) -> String {
            use std::fmt::Write;
            let mut s = String::new();
            for b in bytes {
                let _ = write!(s, "{:02x}", b);
            }
            s
        }
        fn extract<'a>(directives: &'a str, key: &str) -> String {
            for part in directives.split(',') {
                let part = part.trim();
                if let Some(rest) = part.strip_prefix(&format!("{key}=")) {
                    return rest.trim_matches('"').to_string();
                }
            }
            panic!("missing directive {key}");
        }
        fn challenge_event(body: &str) -> InboundEvent {
            InboundEvent::Raw(
                Element::builder("challenge", XMPP_SASL_NS).append(BASE64.encode(body)).build(),
            )
        }

        let mut driver = conn.clone();
        let features = features_with_mechanisms(&["DIGEST-MD5"]);
        let sasl = Sasl::new()
            .on_username_requested(|| username.to_string())
            .on_password_requested(|| password.to_string());
        sasl.authenticate(server, &mut driver, &features, true).await.unwrap();
        assert_eq!(conn.reset_count(), 1);
        assert_eq!(conn.reset_to().as_deref(), Some(server));
    }
}
