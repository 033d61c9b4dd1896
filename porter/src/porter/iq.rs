//! IQ request/response correlation.
//!
//! Every outstanding IQ request is tracked under its generated `id`, paired
//! with the JID it was addressed to (if any). A reply is only delivered to
//! the waiting request if its `from` satisfies the spoof-protection rule:
//! exact match against `to` if the request had one, otherwise `None` or the
//! logged-in account's own bare/full JID. A reply whose `id` matches but
//! whose `from` fails that check is left pending and **not** consumed here,
//! so dispatch falls through to ordinary handlers instead of resolving the
//! caller's future with someone else's answer.

use std::collections::HashMap;

use tokio::sync::oneshot;

use jid::Jid;

use crate::error::IqFailure;
use crate::stanza::Stanza;

/// Drops the resource (if any), returning the underlying bare JID.
fn to_bare(jid: &Jid) -> jid::BareJid {
    match jid {
        Jid::Bare(bare) => bare.clone(),
        Jid::Full(full) => full.to_bare(),
    }
}

struct Pending {
    to: Option<Jid>,
    sender: oneshot::Sender<Result<Stanza, IqFailure>>,
}

/// `true` if `from` is allowed to answer a request that named no explicit
/// `to`: either the reply carries no `from` at all, or `from` is the
/// logged-in account's own bare or full JID.
fn accepted_without_to(from: Option<&Jid>, account: Option<&Jid>) -> bool {
    let Some(from) = from else { return true };
    let Some(account) = account else { return false };
    if from == account {
        return true;
    }
    to_bare(from) == to_bare(account) && matches!(from, Jid::Bare(_))
}

/// Tracks outstanding IQ requests awaiting a reply.
///
/// Keyed by `id` alone: ids are minted per-connection (see
/// [`FramedConnection::new_id`](crate::connection::FramedConnection::new_id))
/// and are assumed unique among concurrently outstanding requests.
#[derive(Default)]
pub struct IqTable {
    pending: HashMap<String, Pending>,
    /// The logged-in account's JID, once known (set after bind). Used only
    /// to widen the spoof check for requests that named no explicit `to`.
    account: Option<Jid>,
}

impl IqTable {
    pub fn new() -> Self {
        IqTable::default()
    }

    /// Records the account's own JID, for the widened spoof check on
    /// requests that named no `to`. Called once binding completes.
    pub fn set_account(&mut self, account: Jid) {
        self.account = Some(account);
    }

    /// Registers a new outstanding request, returning the receiving half of
    /// its response channel.
    pub fn register(&mut self, to: Option<Jid>, id: String) -> oneshot::Receiver<Result<Stanza, IqFailure>> {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, Pending { to, sender });
        receiver
    }

    /// Drops a previously registered request without completing it (used on cancellation).
    pub fn forget(&mut self, id: &str) {
        self.pending.remove(id);
    }

    /// Fails every outstanding request with `outcome` (used when the porter
    /// closes or its connection dies with requests still pending).
    pub fn fail_all(&mut self, outcome: impl Fn() -> IqFailure) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.sender.send(Err(outcome()));
        }
    }

    /// Attempts to deliver an inbound stanza as the reply to a tracked request.
    ///
    /// Returns `true` if `stanza` was consumed as a reply; `false` means
    /// either it does not correlate to any outstanding request, or it does
    /// but fails the spoof check, in which case it is left for regular
    /// dispatch to see and the pending request stays open.
    pub fn try_complete(&mut self, stanza: &Stanza) -> bool {
        let Some(id) = stanza.id.as_deref() else { return false };
        let accepted = match self.pending.get(id) {
            Some(pending) => match &pending.to {
                Some(to) => stanza.from.as_ref() == Some(to),
                None => accepted_without_to(stanza.from.as_ref(), self.account.as_ref()),
            },
            None => return false,
        };
        if !accepted {
            return false;
        }
        let pending = self.pending.remove(id).expect("checked above");
        let _ = pending.sender.send(Ok(stanza.clone()));
        true
    }
}
