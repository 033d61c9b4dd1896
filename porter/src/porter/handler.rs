//! The priority-ordered handler registry.

use jid::Jid;

use crate::porter::dispatch::MatchTemplate;
use crate::stanza::{Kind, Stanza, SubKind};

/// Opaque handle to a registered handler, returned by
/// [`Porter::register_handler`](crate::porter::Porter::register_handler).
///
/// Carries a generation counter alongside its slot index so that
/// unregistering a stale handle (e.g. a double-unregister, or one kept
/// around after the slot was reused) is a harmless no-op rather than an
/// accidental unregistration of an unrelated, later handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    index: usize,
    generation: u64,
}

/// An inbound-stanza matching rule, its priority, and the callback that
/// claims matching stanzas.
///
/// The callback runs synchronously, on the porter's single run loop (see the
/// crate's concurrency model): it returns `true` if it claims the stanza
/// (dispatch stops) or `false` to let lower-priority handlers try. A
/// callback that needs to do further async work (e.g. sending a reply)
/// should spawn a task for that and return its claim decision immediately.
pub struct HandlerSpec {
    /// Stanzas other than this kind never match.
    pub kind: Kind,
    /// `None` matches any `sub_kind`.
    pub sub_kind: Option<SubKind>,
    /// `None` matches any sender; `Some` matches per-component, with any
    /// unset component of the pattern JID acting as a wildcard.
    pub from: Option<FromPattern>,
    /// `None` matches regardless of payload; `Some` is matched per [`MatchTemplate`]'s rules.
    pub match_template: Option<MatchTemplate>,
    /// Higher numbers are checked first; ties are broken by registration order.
    pub priority: i32,
    /// Invoked for stanzas that pass the `kind`/`sub_kind`/`from`/`match_template` checks.
    pub callback: Box<dyn FnMut(&Stanza) -> bool + Send>,
}

/// A `from` pattern: bare domain, `node@domain`, or full JID. Any component
/// left unset matches any value of that component on the inbound stanza.
#[derive(Debug, Clone)]
pub struct FromPattern {
    /// Required node (localpart); `None` matches any node, including none.
    pub node: Option<String>,
    /// Required domain.
    pub domain: String,
    /// Required resource; `None` matches any resource, including none.
    pub resource: Option<String>,
}

impl FromPattern {
    /// Builds a pattern matching only the given domain, with node and
    /// resource left as wildcards.
    pub fn domain(domain: impl Into<String>) -> Self {
        FromPattern { node: None, domain: domain.into(), resource: None }
    }

    /// Builds a pattern from a concrete [`Jid`]: every component the JID
    /// carries becomes a required match; a bare JID leaves `resource` a
    /// wildcard.
    pub fn from_jid(jid: &Jid) -> Self {
        match jid {
            Jid::Bare(bare) => FromPattern {
                node: bare.node().map(str::to_string),
                domain: bare.domain().to_string(),
                resource: None,
            },
            Jid::Full(full) => FromPattern {
                node: full.node().map(str::to_string),
                domain: full.domain().to_string(),
                resource: Some(full.resource().to_string()),
            },
        }
    }

    fn matches(&self, from: Option<&Jid>) -> bool {
        let Some(from) = from else { return false };
        let (node, domain, resource): (Option<&str>, String, Option<&str>) = match from {
            Jid::Bare(bare) => (bare.node(), bare.domain().to_string(), None),
            Jid::Full(full) => (full.node(), full.domain().to_string(), Some(full.resource())),
        };
        if domain != self.domain {
            return false;
        }
        if let Some(want) = &self.node {
            if node != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.resource {
            if resource != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

impl HandlerSpec {
    fn rule_matches(&self, stanza: &Stanza) -> bool {
        if stanza.kind != self.kind {
            return false;
        }
        if let Some(want) = &self.sub_kind {
            if &stanza.sub_kind != want {
                return false;
            }
        }
        if let Some(want) = &self.from {
            if !want.matches(stanza.from.as_ref()) {
                return false;
            }
        }
        if let Some(template) = &self.match_template {
            if !template.matches_any(stanza.payload()) {
                return false;
            }
        }
        true
    }
}

struct Slot {
    generation: u64,
    spec: Option<HandlerSpec>,
}

/// Priority-ordered registry of handlers, with O(log n) insertion and O(1)
/// removal by [`HandlerId`].
#[derive(Default)]
pub struct HandlerRegistry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Indices into `slots`, kept sorted by descending `priority`, ties
    /// broken by ascending `insertion_seq`.
    order: Vec<(i32, u64, usize)>,
    next_seq: u64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers a handler, returning a handle that can later be passed to
    /// [`unregister`](HandlerRegistry::unregister).
    pub fn register(&mut self, spec: HandlerSpec) -> HandlerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let priority = spec.priority;

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation += 1;
                slot.spec = Some(spec);
                index
            }
            None => {
                self.slots.push(Slot { generation: 0, spec: Some(spec) });
                self.slots.len() - 1
            }
        };
        let generation = self.slots[index].generation;

        let pos = self
            .order
            .partition_point(|(p, s, _)| *p > priority || (*p == priority && *s < seq));
        self.order.insert(pos, (priority, seq, index));

        HandlerId { index, generation }
    }

    /// Removes a handler. A stale or already-removed `id` is a no-op.
    pub fn unregister(&mut self, id: HandlerId) {
        let Some(slot) = self.slots.get_mut(id.index) else { return };
        if slot.generation != id.generation || slot.spec.is_none() {
            return;
        }
        slot.spec = None;
        self.order.retain(|(_, _, index)| *index != id.index);
        self.free.push(id.index);
    }

    /// Walks handlers in priority order, invoking the callback of every
    /// handler whose rule matches `stanza` until one returns `true`
    /// (claims it) or the list is exhausted.
    ///
    /// Returns `true` if some handler claimed the stanza.
    pub fn dispatch(&mut self, stanza: &Stanza) -> bool {
        let indices: Vec<usize> = self.order.iter().map(|(_, _, index)| *index).collect();
        for index in indices {
            let matches = match &self.slots[index].spec {
                Some(spec) => spec.rule_matches(stanza),
                None => false,
            };
            if !matches {
                continue;
            }
            let claimed = {
                let spec = self.slots[index].spec.as_mut().expect("checked above");
                (spec.callback)(stanza)
            };
            if claimed {
                return true;
            }
        }
        false
    }
}
