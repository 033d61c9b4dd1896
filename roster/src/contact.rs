//! The roster item data model: `Contact` and its `Subscription` state.

use std::collections::BTreeSet;

use jid::BareJid;

/// The subscription state of a single roster item, per RFC 6121 §2.1.2.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// Neither side is subscribed to the other's presence.
    None,
    /// The local account is subscribed to the contact's presence.
    To,
    /// The contact is subscribed to the local account's presence.
    From,
    /// Both sides are subscribed to each other's presence.
    Both,
}

impl Subscription {
    fn from_attr(attr: Option<&str>) -> Subscription {
        match attr {
            Some("to") => Subscription::To,
            Some("from") => Subscription::From,
            Some("both") => Subscription::Both,
            _ => Subscription::None,
        }
    }
}

/// A single entry in the server-side roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// The contact's bare JID; the roster's key.
    pub bare_jid: BareJid,
    /// The client-assigned display name, if the server has one on file.
    pub name: Option<String>,
    /// The presence subscription state between the account and this contact.
    pub subscription: Subscription,
    /// The set of roster groups this contact has been filed under.
    pub groups: BTreeSet<String>,
}

/// The fields that changed between two revisions of the same `Contact`,
/// reported alongside a `modified` change signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactField {
    /// The `name` field changed.
    Name,
    /// The `subscription` field changed.
    Subscription,
    /// The `groups` set changed.
    Groups,
}

impl Contact {
    pub(crate) fn from_item(item: &minidom::Element) -> Option<Contact> {
        let jid = item.attr("jid")?;
        let bare_jid: BareJid = jid.parse().ok()?;
        let name = item.attr("name").map(str::to_string);
        let subscription = Subscription::from_attr(item.attr("subscription"));
        let groups = item
            .children()
            .filter(|c| c.name() == "group")
            .map(|c| c.text())
            .collect();
        Some(Contact { bare_jid, name, subscription, groups })
    }

    /// Compares `self` against a previous revision `old` of the same
    /// contact, returning every field that differs.
    pub(crate) fn diff(&self, old: &Contact) -> Vec<ContactField> {
        let mut changed = Vec::new();
        if self.name != old.name {
            changed.push(ContactField::Name);
        }
        if self.subscription != old.subscription {
            changed.push(ContactField::Subscription);
        }
        if self.groups != old.groups {
            changed.push(ContactField::Groups);
        }
        changed
    }
}
