//! A cache of the server-side roster (`jabber:iq:roster`, RFC 6121 §2): an
//! initial full fetch plus server-pushed incremental updates, kept as an
//! in-memory `bare_jid -> Contact` map with change notifications.
//!
//! Unlike SASL authentication, which runs before the porter exists, the
//! roster is built on top of an already-[`start`](xmpp_porter::Porter::start)ed
//! [`Porter`]: it registers itself as a normal, if high-priority, inbound
//! handler and otherwise behaves like any other application-level consumer.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

mod contact;

/// The roster item data model. See [`contact::Contact`] and its neighbours for documentation.
pub use contact::{Contact, ContactField, Subscription};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jid::{BareJid, Jid};
use log::{debug, warn};
use minidom::Element;
use tokio::sync::Notify;

use xmpp_porter::connection::FramedConnection;
use xmpp_porter::error::RosterError;
use xmpp_porter::porter::{HandlerId, MatchTemplate};
use xmpp_porter::stanza::{Kind, Stanza, SubKind};
use xmpp_porter::Porter;

/// Drops the resource (if any), returning the underlying bare JID.
fn to_bare(jid: &Jid) -> BareJid {
    match jid {
        Jid::Bare(bare) => bare.clone(),
        Jid::Full(full) => full.to_bare(),
    }
}

const ROSTER_NS: &str = "jabber:iq:roster";

/// Converts a known-good static string into an `NcName` for use with
/// minidom's attribute-setting API.
#[cfg(test)]
fn ncname(s: &str) -> minidom::rxml::NcName {
    minidom::rxml::NcName::try_from(s).unwrap_or_else(|_| panic!("invalid NCName: {s}"))
}

/// Priority the roster's push handler registers at: higher than any
/// application handler is expected to use, so the roster always sees a
/// `jabber:iq:roster` push first.
const ROSTER_HANDLER_PRIORITY: i32 = i32::MAX;

/// A change to the cached roster, reported to every closure registered via
/// [`Roster::on_change`].
#[derive(Debug, Clone)]
pub enum Change {
    /// A new contact appeared (first push, or first time seen in a fetch).
    Added(Contact),
    /// A contact was removed (`subscription="remove"` push).
    Removed(Contact),
    /// An existing contact's fields changed.
    Modified {
        /// The contact's new state.
        contact: Contact,
        /// Which fields actually differed from the previous state.
        changed: Vec<ContactField>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Unfetched,
    Fetching,
    Ready,
}

struct Inner {
    contacts: Mutex<HashMap<BareJid, Contact>>,
    state: Mutex<FetchState>,
    fetch_done: Notify,
    account: Mutex<Option<BareJid>>,
    observers: Mutex<Vec<Box<dyn Fn(&Change) + Send>>>,
}

/// A cache of the account's server-side roster.
///
/// Cloning a `Roster` is cheap and shares the same underlying cache and
/// handler registration; the handler is unregistered when the last clone is
/// dropped.
pub struct Roster<C> {
    inner: Arc<Inner>,
    porter: Porter<C>,
    handler_id: HandlerId,
}

impl<C> Clone for Roster<C> {
    fn clone(&self) -> Self {
        Roster { inner: self.inner.clone(), porter: self.porter.clone(), handler_id: self.handler_id }
    }
}

impl<C: FramedConnection + Send + 'static> Roster<C> {
    /// Registers a `jabber:iq:roster` push handler on `porter` and returns
    /// the (as yet unfetched) roster cache.
    ///
    /// Fails only if `porter` is already closed.
    pub async fn new(porter: Porter<C>) -> Result<Roster<C>, xmpp_porter::error::PorterError> {
        let inner = Arc::new(Inner {
            contacts: Mutex::new(HashMap::new()),
            state: Mutex::new(FetchState::Unfetched),
            fetch_done: Notify::new(),
            account: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
        });

        let handler_inner = inner.clone();
        let handler_porter = porter.clone();
        let template = MatchTemplate::new("query", ROSTER_NS);
        let handler_id = porter
            .register_handler(
                Kind::Iq,
                Some(SubKind::Set),
                None,
                ROSTER_HANDLER_PRIORITY,
                Some(template),
                move |stanza| handle_push(&handler_inner, &handler_porter, stanza),
            )
            .await?;

        Ok(Roster { inner, porter, handler_id })
    }

    /// Records the account's own bare JID, so that pushes claiming to come
    /// from anyone else are ignored. Call this once the account is known
    /// (typically right after resource binding), before relying on pushes.
    pub fn set_account(&self, account: BareJid) {
        *self.inner.account.lock().unwrap() = Some(account);
    }

    /// Registers a closure invoked, synchronously and on the porter's run
    /// loop, for every [`Change`] to the cached roster.
    pub fn on_change(&self, observer: impl Fn(&Change) + Send + 'static) {
        self.inner.observers.lock().unwrap().push(Box::new(observer));
    }

    /// Unregisters this roster's push handler from the porter. After this
    /// call the cache is frozen: it stops seeing pushes, but `get_contact`
    /// and `all_contacts` keep serving their last known state.
    pub fn unregister(&self) {
        self.porter.unregister_handler(self.handler_id);
    }

    /// Performs (or joins) the initial full roster fetch.
    ///
    /// Concurrent callers all await the same in-flight `jabber:iq:roster`
    /// get; once the roster is `ready`, later calls return immediately
    /// without sending a new request.
    pub async fn fetch_async(&self) -> Result<(), RosterError> {
        loop {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                FetchState::Ready => return Ok(()),
                FetchState::Fetching => {
                    drop(state);
                    self.inner.fetch_done.notified().await;
                    continue;
                }
                FetchState::Unfetched => {
                    *state = FetchState::Fetching;
                    break;
                }
            }
        }

        let result = self.do_fetch().await;

        let mut state = self.inner.state.lock().unwrap();
        *state = match &result {
            Ok(()) => FetchState::Ready,
            Err(_) => FetchState::Unfetched,
        };
        drop(state);
        self.inner.fetch_done.notify_waiters();
        result
    }

    async fn do_fetch(&self) -> Result<(), RosterError> {
        let query = Element::builder("query", ROSTER_NS).build();
        // The id is overwritten by the porter when the request is actually sent.
        let request = Stanza::new_iq(SubKind::Get, "", query);
        let reply = self.porter.send_iq_async(request, None).await?;

        if reply.sub_kind == SubKind::Error {
            return Err(RosterError::FetchRejected);
        }

        let mut fresh = HashMap::new();
        for payload in reply.payload() {
            if payload.name() != "query" || payload.ns() != ROSTER_NS {
                continue;
            }
            for item in payload.children().filter(|c| c.name() == "item") {
                if let Some(contact) = Contact::from_item(item) {
                    fresh.insert(contact.bare_jid.clone(), contact);
                }
            }
        }

        *self.inner.contacts.lock().unwrap() = fresh;
        Ok(())
    }

    /// Looks up a single contact by bare JID.
    ///
    /// Fails with [`RosterError::NotReady`] if the initial fetch has not
    /// completed yet; otherwise returns `None` if no such contact is known.
    pub fn get_contact(&self, bare_jid: &BareJid) -> Result<Option<Contact>, RosterError> {
        self.require_ready()?;
        Ok(self.inner.contacts.lock().unwrap().get(bare_jid).cloned())
    }

    /// Returns every cached contact.
    ///
    /// Fails with [`RosterError::NotReady`] if the initial fetch has not
    /// completed yet.
    pub fn all_contacts(&self) -> Result<Vec<Contact>, RosterError> {
        self.require_ready()?;
        Ok(self.inner.contacts.lock().unwrap().values().cloned().collect())
    }

    /// A convenience accessor for just the subscription state of a contact,
    /// without requiring the initial fetch to have completed: returns
    /// `None` both when the fetch hasn't run yet and when the contact is
    /// simply unknown.
    pub fn subscription_state(&self, bare_jid: &BareJid) -> Option<Subscription> {
        self.inner.contacts.lock().unwrap().get(bare_jid).map(|c| c.subscription)
    }

    fn require_ready(&self) -> Result<(), RosterError> {
        if *self.inner.state.lock().unwrap() == FetchState::Ready {
            Ok(())
        } else {
            Err(RosterError::NotReady)
        }
    }
}

fn handle_push<C: FramedConnection + Send + 'static>(inner: &Arc<Inner>, porter: &Porter<C>, stanza: &Stanza) -> bool {
    let account = inner.account.lock().unwrap().clone();
    if let Some(from) = &stanza.from {
        let from_bare = to_bare(from);
        match &account {
            Some(account) if *account == from_bare => {}
            _ => {
                warn!("ignoring jabber:iq:roster push from unauthorized sender {}", from);
                return false;
            }
        }
    }

    let query = match stanza.payload().find(|e| e.name() == "query" && e.ns() == ROSTER_NS) {
        Some(query) => query,
        None => return false,
    };
    let items: Vec<&Element> = query.children().filter(|c| c.name() == "item").collect();
    if items.is_empty() {
        debug!("jabber:iq:roster push carried no <item/>, ignoring");
        return false;
    }

    let mut changes = Vec::new();

    for item in items {
        let jid: Option<BareJid> = item.attr("jid").and_then(|s| s.parse().ok());
        let Some(bare_jid) = jid else {
            warn!("jabber:iq:roster push item had no valid jid attribute, ignoring it");
            continue;
        };

        let is_remove = item.attr("subscription") == Some("remove");
        let mut contacts = inner.contacts.lock().unwrap();
        if is_remove {
            if let Some(old) = contacts.remove(&bare_jid) {
                changes.push(Change::Removed(old));
            }
        } else if let Some(contact) = Contact::from_item(item) {
            match contacts.insert(contact.bare_jid.clone(), contact.clone()) {
                Some(old) if old == contact => {}
                Some(old) => {
                    let changed = contact.diff(&old);
                    if !changed.is_empty() {
                        changes.push(Change::Modified { contact, changed });
                    }
                }
                None => changes.push(Change::Added(contact)),
            }
        }
    }

    {
        let observers = inner.observers.lock().unwrap();
        for change in &changes {
            for observer in observers.iter() {
                observer(change);
            }
        }
    }

    let result = Element::builder("query", ROSTER_NS).build();
    let reply = Stanza::new_iq(SubKind::Result, stanza.id.clone().unwrap_or_default(), result);
    let porter = porter.clone();
    tokio::spawn(async move {
        if let Err(e) = porter.send(reply).await {
            warn!("failed to send jabber:iq:roster push acknowledgement: {}", e);
        }
    });

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_porter::test_connection::TestConnection;

    /// Yields enough times to drain the porter's run loop plus any tasks it
    /// spawns in reaction (e.g. the roster push's IQ result acknowledgement).
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn push_stanza(from: Option<&str>, item_xml: &str) -> Element {
        let mut builder =
            Element::builder("iq", "jabber:client").attr(ncname("type"), "set").attr(ncname("id"), "push1");
        if let Some(from) = from {
            builder = builder.attr(ncname("from"), from);
        }
        let query = Element::builder("query", ROSTER_NS).append(item_xml.parse::<Element>().unwrap()).build();
        builder.append(query).build()
    }

    async fn roster_with_account() -> (Roster<TestConnection>, TestConnection) {
        let conn = TestConnection::new();
        let porter = Porter::new(conn.clone());
        porter.start();
        let roster = Roster::new(porter).await.unwrap();
        roster.set_account(BareJid::new("me@example.net").unwrap());
        (roster, conn)
    }

    #[tokio::test]
    async fn from_less_push_adds_a_contact() {
        let (roster, conn) = roster_with_account().await;
        conn.push_stanza(push_stanza(None, r#"<item jid="a@b.c" subscription="both"/>"#));
        settle().await;
        // Pushes populate the cache independently of the initial fetch.
        assert!(matches!(roster.get_contact(&BareJid::new("a@b.c").unwrap()), Err(RosterError::NotReady)));
        assert_eq!(roster.subscription_state(&BareJid::new("a@b.c").unwrap()), Some(Subscription::Both));
    }

    #[tokio::test]
    async fn spoofed_push_is_ignored() {
        let (roster, conn) = roster_with_account().await;
        conn.push_stanza(push_stanza(Some("evil@attacker.net"), r#"<item jid="a@b.c" subscription="both"/>"#));
        settle().await;
        assert_eq!(roster.subscription_state(&BareJid::new("a@b.c").unwrap()), None);
    }

    #[tokio::test]
    async fn push_from_account_updates_and_acks() {
        let (roster, conn) = roster_with_account().await;
        conn.push_stanza(push_stanza(Some("me@example.net"), r#"<item jid="a@b.c" subscription="to"/>"#));
        settle().await;
        assert_eq!(roster.subscription_state(&BareJid::new("a@b.c").unwrap()), Some(Subscription::To));
        assert!(conn.sent().iter().any(|item| matches!(
            item,
            xmpp_porter::connection::OutboundItem::Stanza(s) if s.sub_kind == SubKind::Result
        )));
    }

    #[tokio::test]
    async fn remove_push_deletes_the_contact() {
        let (roster, conn) = roster_with_account().await;
        conn.push_stanza(push_stanza(None, r#"<item jid="a@b.c" subscription="both"/>"#));
        settle().await;
        conn.push_stanza(push_stanza(None, r#"<item jid="a@b.c" subscription="remove"/>"#));
        settle().await;
        assert_eq!(roster.subscription_state(&BareJid::new("a@b.c").unwrap()), None);
    }

    #[tokio::test]
    async fn change_observer_sees_added_then_modified() {
        let (roster, conn) = roster_with_account().await;
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        roster.on_change(move |change| {
            let label = match change {
                Change::Added(_) => "added",
                Change::Removed(_) => "removed",
                Change::Modified { .. } => "modified",
            };
            events2.lock().unwrap().push(label.to_string());
        });

        conn.push_stanza(push_stanza(None, r#"<item jid="a@b.c" subscription="none"/>"#));
        settle().await;
        conn.push_stanza(push_stanza(None, r#"<item jid="a@b.c" subscription="to"/>"#));
        settle().await;

        assert_eq!(*events.lock().unwrap(), vec!["added", "modified"]);
    }

    #[tokio::test]
    async fn unchanged_push_emits_no_event() {
        let (roster, conn) = roster_with_account().await;
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();
        roster.on_change(move |_| {
            hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let stanza = push_stanza(None, r#"<item jid="a@b.c" subscription="both"><group>Friends</group></item>"#);
        conn.push_stanza(stanza.clone());
        settle().await;
        conn.push_stanza(stanza);
        settle().await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_async_populates_all_contacts() {
        let conn = TestConnection::new();
        conn.on_send(|item| {
            if let xmpp_porter::connection::OutboundItem::Stanza(s) = item {
                if s.kind == Kind::Iq && s.sub_kind == SubKind::Get {
                    let result_query = Element::builder("query", ROSTER_NS)
                        .append(
                            Element::builder("item", ROSTER_NS)
                                .attr(ncname("jid"), "a@b.c")
                                .attr(ncname("subscription"), "both")
                                .build(),
                        )
                        .build();
                    let reply = Stanza::new_iq(SubKind::Result, s.id.clone().unwrap(), result_query);
                    return vec![xmpp_porter::connection::InboundEvent::Stanza(reply)];
                }
            }
            Vec::new()
        });
        let porter = Porter::new(conn);
        porter.start();
        let roster = Roster::new(porter).await.unwrap();

        assert!(matches!(roster.all_contacts(), Err(RosterError::NotReady)));
        roster.fetch_async().await.unwrap();
        let contacts = roster.all_contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].bare_jid, BareJid::new("a@b.c").unwrap());
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_request() {
        let conn = TestConnection::new();
        let sends = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sends2 = sends.clone();
        conn.on_send(move |item| {
            if let xmpp_porter::connection::OutboundItem::Stanza(s) = item {
                if s.kind == Kind::Iq {
                    sends2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    let reply = Stanza::new_iq(
                        SubKind::Result,
                        s.id.clone().unwrap(),
                        Element::builder("query", ROSTER_NS).build(),
                    );
                    return vec![xmpp_porter::connection::InboundEvent::Stanza(reply)];
                }
            }
            Vec::new()
        });
        let porter = Porter::new(conn);
        porter.start();
        let roster = Roster::new(porter).await.unwrap();

        let a = roster.clone();
        let b = roster.clone();
        let (r1, r2) = tokio::join!(a.fetch_async(), b.fetch_async());
        r1.unwrap();
        r2.unwrap();
        assert_eq!(sends.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_fetch_is_reported_and_retried() {
        let conn = TestConnection::new();
        let attempt = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempt2 = attempt.clone();
        conn.on_send(move |item| {
            if let xmpp_porter::connection::OutboundItem::Stanza(s) = item {
                if s.kind == Kind::Iq {
                    let n = attempt2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    let reply = if n == 0 {
                        Stanza::new_iq(SubKind::Error, s.id.clone().unwrap(), Element::builder("error", "jabber:client").build())
                    } else {
                        Stanza::new_iq(SubKind::Result, s.id.clone().unwrap(), Element::builder("query", ROSTER_NS).build())
                    };
                    return vec![xmpp_porter::connection::InboundEvent::Stanza(reply)];
                }
            }
            Vec::new()
        });
        let porter = Porter::new(conn);
        porter.start();
        let roster = Roster::new(porter).await.unwrap();

        assert!(matches!(roster.fetch_async().await, Err(RosterError::FetchRejected)));
        roster.fetch_async().await.unwrap();
        assert!(roster.all_contacts().is_ok());
    }
}
