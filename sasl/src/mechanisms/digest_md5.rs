use md5::{Digest, Md5};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::{Credentials, MechanismError};
use crate::SaslMechanism;

/// The `DIGEST-MD5` mechanism (RFC 2831), as profiled for XMPP.
///
/// The exchange is two challenges deep: the first carries the server's
/// `nonce`/`realm`/`qop`, to which the client answers with its computed
/// `response`; the second carries the server's `rspauth` mutual-auth proof,
/// to which the client answers with an empty response once the proof has
/// been verified.
pub struct DigestMd5 {
    username: String,
    password: String,
    authzid: Option<String>,
    /// `serv-type "/" host` — for XMPP this is always `xmpp/<server_name>`.
    digest_uri: String,
    step: Step,
}

enum Step {
    AwaitingChallenge,
    AwaitingRspauth { ha1: [u8; 16], nonce: String, cnonce: String, nc: &'static str, qop: String },
    Done,
}

impl DigestMd5 {
    pub fn new(credentials: Credentials, server_name: &str) -> Self {
        DigestMd5 {
            username: credentials.username,
            password: credentials.password,
            authzid: credentials.authzid,
            digest_uri: format!("xmpp/{}", server_name),
            step: Step::AwaitingChallenge,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Parses a DIGEST-MD5 challenge/response directive list into a map.
///
/// Directives are comma-separated `key=value` pairs; values may be
/// double-quoted strings containing escaped `\"` and `\\`.
fn parse_directives(input: &[u8]) -> Result<HashMap<String, String>, MechanismError> {
    let input = std::str::from_utf8(input)
        .map_err(|_| MechanismError::MalformedChallenge("not valid UTF-8".into()))?;
    let mut map = HashMap::new();
    let mut chars = input.chars().peekable();
    loop {
        // Skip leading whitespace/commas.
        while matches!(chars.peek(), Some(',') | Some(' ')) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(MechanismError::MalformedChallenge(format!(
                "expected '=' after directive name '{}'",
                key
            )));
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(MechanismError::MalformedChallenge(
                            "unterminated quoted value".into(),
                        ))
                    }
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

impl SaslMechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial(&mut self) -> Result<Vec<u8>, MechanismError> {
        // DIGEST-MD5 has no initial response: the client waits for the
        // server's first challenge before it knows the nonce and realm.
        Ok(Vec::new())
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        match self.step {
            Step::AwaitingChallenge => {
                let directives = parse_directives(challenge)?;
                let nonce = directives
                    .get("nonce")
                    .ok_or(MechanismError::MissingDirective("nonce"))?
                    .clone();
                let realm = directives.get("realm").cloned().unwrap_or_default();
                let qop = directives
                    .get("qop")
                    .cloned()
                    .unwrap_or_else(|| "auth".to_string());

                let mut cnonce_bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut cnonce_bytes);
                let cnonce = hex(&cnonce_bytes);
                let nc = "00000001";

                let ha1 = {
                    let mut inner = Md5::new();
                    inner.update(self.username.as_bytes());
                    inner.update(b":");
                    inner.update(realm.as_bytes());
                    inner.update(b":");
                    inner.update(self.password.as_bytes());
                    let inner_digest = inner.finalize();

                    let mut outer = Md5::new();
                    outer.update(inner_digest);
                    outer.update(b":");
                    outer.update(nonce.as_bytes());
                    outer.update(b":");
                    outer.update(cnonce.as_bytes());
                    if let Some(authzid) = &self.authzid {
                        outer.update(b":");
                        outer.update(authzid.as_bytes());
                    }
                    let digest = outer.finalize();
                    let mut out = [0u8; 16];
                    out.copy_from_slice(&digest);
                    out
                };

                let ha2 = {
                    let mut h = Md5::new();
                    h.update(b"AUTHENTICATE:");
                    h.update(self.digest_uri.as_bytes());
                    hex(&h.finalize())
                };

                let response = {
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

                let mut out = format!(
                    "username=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop={},digest-uri=\"{}\",response={}",
                    self.username, nonce, cnonce, nc, qop, self.digest_uri, response
                );
                if !realm.is_empty() {
                    out = format!("realm=\"{}\",{}", realm, out);
                }
                if let Some(authzid) = &self.authzid {
                    let _ = write!(out, ",authzid=\"{}\"", authzid);
                }

                self.step = Step::AwaitingRspauth {
                    ha1,
                    nonce,
                    cnonce,
                    nc,
                    qop,
                };
                Ok(out.into_bytes())
            }
            Step::AwaitingRspauth {
                ha1,
                ref nonce,
                ref cnonce,
                nc,
                ref qop,
            } => {
                let directives = parse_directives(challenge)?;
                let rspauth = directives
                    .get("rspauth")
                    .ok_or(MechanismError::MissingDirective("rspauth"))?;

                let ha2 = {
                    let mut h = Md5::new();
                    h.update(b":");
                    h.update(self.digest_uri.as_bytes());
                    hex(&h.finalize())
                };
                let expected = {
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

                if &expected != rspauth {
                    return Err(MechanismError::InvalidProof);
                }
                self.step = Step::Done;
                Ok(Vec::new())
            }
            Step::Done => Err(MechanismError::MalformedChallenge(
                "received a third DIGEST-MD5 challenge".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc2831_example_challenge() {
        let challenge = br#"realm="elwood.innosoft.com",nonce="OA6MG9tEQGm2hh",qop="auth",algorithm=md5-sess,charset=utf-8"#;
        let directives = parse_directives(challenge).unwrap();
        assert_eq!(directives.get("realm").unwrap(), "elwood.innosoft.com");
        assert_eq!(directives.get("nonce").unwrap(), "OA6MG9tEQGm2hh");
        assert_eq!(directives.get("qop").unwrap(), "auth");
    }

    #[test]
    fn first_response_echoes_server_nonce() {
        let mut mech = DigestMd5::new(Credentials::new("chris", "secret"), "elwood.innosoft.com");
        let challenge = br#"realm="elwood.innosoft.com",nonce="OA6MG9tEQGm2hh",qop="auth",charset=utf-8,algorithm=md5-sess"#;
        let response = mech.respond(challenge).unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.contains("nonce=\"OA6MG9tEQGm2hh\""));
        assert!(response.contains("username=\"chris\""));
        assert!(response.contains("digest-uri=\"xmpp/elwood.innosoft.com\""));
        assert!(matches!(mech.step, Step::AwaitingRspauth { .. }));
    }

    #[test]
    fn mismatched_rspauth_is_rejected() {
        let mut mech = DigestMd5::new(Credentials::new("chris", "secret"), "elwood.innosoft.com");
        let challenge = br#"realm="elwood.innosoft.com",nonce="OA6MG9tEQGm2hh",qop="auth",charset=utf-8"#;
        mech.respond(challenge).unwrap();
        let err = mech.respond(br#"rspauth="0000000000000000000000000000000""#).unwrap_err();
        assert!(matches!(err, MechanismError::InvalidProof));
    }

    #[test]
    fn matching_rspauth_completes_the_exchange() {
        let mut mech = DigestMd5::new(Credentials::new("chris", "secret"), "elwood.innosoft.com");
        let challenge = br#"realm="elwood.innosoft.com",nonce="OA6MG9tEQGm2hh",qop="auth",charset=utf-8"#;
        mech.respond(challenge).unwrap();
        let (nonce, cnonce, nc, qop, ha1) = match &mech.step {
            Step::AwaitingRspauth { nonce, cnonce, nc, qop, ha1 } => {
                (nonce.clone(), cnonce.clone(), *nc, qop.clone(), *ha1)
            }
            _ => unreachable!(),
        };
        let ha2 = {
            let mut h = Md5::new();
            h.update(b":");
            h.update(mech.digest_uri.as_bytes());
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
        let final_challenge = format!("rspauth=\"{}\"", rspauth);
        let out = mech.respond(final_challenge.as_bytes()).unwrap();
        assert!(out.is_empty());
        assert!(matches!(mech.step, Step::Done));
    }
}
