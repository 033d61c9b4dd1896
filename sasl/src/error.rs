use std::error::Error as StdError;
use std::fmt;

/// Error produced while running a SASL mechanism.
#[derive(Debug)]
pub enum MechanismError {
    /// The server challenge could not be parsed as this mechanism expects.
    MalformedChallenge(String),
    /// A required directive was missing from a DIGEST-MD5 challenge.
    MissingDirective(&'static str),
    /// The server's mutual-authentication proof did not match.
    InvalidProof,
}

impl fmt::Display for MechanismError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MechanismError::MalformedChallenge(reason) => {
                write!(f, "malformed SASL challenge: {}", reason)
            }
            MechanismError::MissingDirective(name) => {
                write!(f, "challenge is missing the '{}' directive", name)
            }
            MechanismError::InvalidProof => {
                write!(f, "server's mutual-authentication proof did not match")
            }
        }
    }
}

impl StdError for MechanismError {}
