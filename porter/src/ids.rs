//! Stanza id generation.

use rand::Rng;

/// Generates a fresh stanza id, unique with overwhelming probability among
/// ids generated within the same connection's lifetime.
pub fn make_id() -> String {
    let id: u64 = rand::thread_rng().gen();
    format!("{:x}", id)
}
