use crate::{Credentials, MechanismError, SaslMechanism};

/// The `PLAIN` mechanism (RFC 4616).
///
/// Carries the username and password in the clear as the initial response;
/// any further challenge is a protocol violation on the server's part, so
/// [`respond`][SaslMechanism::respond] always fails.
pub struct Plain {
    authzid: String,
    username: String,
    password: String,
}

impl Plain {
    pub fn new(credentials: Credentials) -> Self {
        Plain {
            authzid: credentials.authzid.unwrap_or_default(),
            username: credentials.username,
            password: credentials.password,
        }
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial(&mut self) -> Result<Vec<u8>, MechanismError> {
        let mut buf = Vec::with_capacity(
            self.authzid.len() + self.username.len() + self.password.len() + 2,
        );
        buf.extend_from_slice(self.authzid.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.username.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.password.as_bytes());
        Ok(buf)
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::MalformedChallenge(format!(
            "PLAIN does not expect a challenge, got {} bytes",
            challenge.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_response_is_nul_separated() {
        let mut mech = Plain::new(Credentials::new("user", "pass"));
        let initial = mech.initial().unwrap();
        assert_eq!(initial, b"\0user\0pass");
    }

    #[test]
    fn initial_response_carries_authzid() {
        let mut mech = Plain::new(Credentials::new("user", "pass").with_authzid("admin"));
        let initial = mech.initial().unwrap();
        assert_eq!(initial, b"admin\0user\0pass");
    }

    #[test]
    fn any_challenge_is_rejected() {
        let mut mech = Plain::new(Credentials::new("user", "pass"));
        assert!(mech.respond(b"unexpected").is_err());
    }
}
