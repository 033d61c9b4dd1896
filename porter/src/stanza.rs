//! The stanza data model: a decomposed view over a `minidom::Element`.

use minidom::rxml::NcName;
use minidom::Element;

use jid::Jid;

/// Converts a known-good static string into an [`NcName`] for use with
/// minidom's attribute-setting API.
fn ncname(s: &str) -> NcName {
    NcName::try_from(s).unwrap_or_else(|_| panic!("invalid NCName: {s}"))
}

pub(crate) const JABBER_CLIENT: &str = "jabber:client";

/// The three top-level XMPP stanza kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// `<iq/>`
    Iq,
}

impl Kind {
    /// The element name this kind is serialised under.
    pub fn element_name(&self) -> &'static str {
        match self {
            Kind::Message => "message",
            Kind::Presence => "presence",
            Kind::Iq => "iq",
        }
    }

    fn from_element_name(name: &str) -> Option<Kind> {
        match name {
            "message" => Some(Kind::Message),
            "presence" => Some(Kind::Presence),
            "iq" => Some(Kind::Iq),
            _ => None,
        }
    }
}

/// The stanza's `type` attribute.
///
/// This is open-ended by design: XMPP extensions are free to mint new
/// `type` values, so an unrecognised one is kept around rather than
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubKind {
    /// No `type` attribute present.
    None,
    /// `type="get"`
    Get,
    /// `type="set"`
    Set,
    /// `type="result"`
    Result,
    /// `type="error"`
    Error,
    /// `type="chat"`, `type="unavailable"`, or any other value not listed above.
    Other(String),
}

impl SubKind {
    fn from_attr(attr: Option<&str>) -> SubKind {
        match attr {
            None => SubKind::None,
            Some("get") => SubKind::Get,
            Some("set") => SubKind::Set,
            Some("result") => SubKind::Result,
            Some("error") => SubKind::Error,
            Some(other) => SubKind::Other(other.to_string()),
        }
    }

    fn as_attr(&self) -> Option<&str> {
        match self {
            SubKind::None => None,
            SubKind::Get => Some("get"),
            SubKind::Set => Some("set"),
            SubKind::Result => Some("result"),
            SubKind::Error => Some("error"),
            SubKind::Other(s) => Some(s.as_str()),
        }
    }
}

/// Error decomposing a `minidom::Element` into a [`Stanza`].
#[derive(Debug)]
pub enum StanzaError {
    /// The element's name was not `message`, `presence`, or `iq`.
    NotAStanza(String),
    /// The `from` or `to` attribute was not a valid JID.
    JidParse(jid::Error),
}

impl std::fmt::Display for StanzaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaError::NotAStanza(name) => write!(f, "<{}> is not a message, presence, or iq", name),
            StanzaError::JidParse(e) => write!(f, "invalid JID on stanza: {}", e),
        }
    }
}

impl std::error::Error for StanzaError {}

impl From<jid::Error> for StanzaError {
    fn from(e: jid::Error) -> Self {
        StanzaError::JidParse(e)
    }
}

/// A decomposed XMPP stanza.
///
/// `element` is the full, authoritative `minidom::Element` this stanza was
/// built from (or will be serialised to); the other fields are a cache of
/// its `kind`, `type`, `from`, `to`, `id`, and `xml:lang` for quick access
/// without re-walking attributes on every handler check.
#[derive(Debug, Clone)]
pub struct Stanza {
    /// `message`, `presence`, or `iq`.
    pub kind: Kind,
    /// The `type` attribute.
    pub sub_kind: SubKind,
    /// The `from` attribute, if present.
    pub from: Option<Jid>,
    /// The `to` attribute, if present.
    pub to: Option<Jid>,
    /// The `id` attribute, if present.
    pub id: Option<String>,
    /// The `xml:lang` attribute, if present.
    pub lang: Option<String>,
    /// The full, authoritative element this stanza was parsed from or will serialise to.
    pub element: Element,
}

impl Stanza {
    /// Decomposes a raw element into a `Stanza`, failing if it is not a
    /// `message`, `presence`, or `iq`, or if `from`/`to` are not valid JIDs.
    pub fn from_element(element: Element) -> Result<Stanza, StanzaError> {
        let kind = Kind::from_element_name(element.name())
            .ok_or_else(|| StanzaError::NotAStanza(element.name().to_string()))?;
        let sub_kind = SubKind::from_attr(element.attr("type"));
        let from = element.attr("from").map(str::parse).transpose()?;
        let to = element.attr("to").map(str::parse).transpose()?;
        let id = element.attr("id").map(str::to_string);
        let lang = element.attr("xml:lang").map(str::to_string);
        Ok(Stanza { kind, sub_kind, from, to, id, lang, element })
    }

    /// Builds the element this stanza serialises to, reflecting the current
    /// `kind`/`sub_kind`/`from`/`to`/`id`/`lang` fields (which take priority
    /// over whatever `self.element` already carries for those attributes).
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder(self.kind.element_name(), self.element.ns());
        if let Some(sub_kind) = self.sub_kind.as_attr() {
            builder = builder.attr(ncname("type"), sub_kind);
        }
        if let Some(from) = &self.from {
            builder = builder.attr(ncname("from"), from.to_string());
        }
        if let Some(to) = &self.to {
            builder = builder.attr(ncname("to"), to.to_string());
        }
        if let Some(id) = &self.id {
            builder = builder.attr(ncname("id"), id.as_str());
        }
        if let Some(lang) = &self.lang {
            builder = builder.attr(ncname("xml:lang"), lang.as_str());
        }
        for child in self.element.children() {
            builder = builder.append(child.clone());
        }
        builder.build()
    }

    /// Builds a bare `<iq type="get|set" id="..">` stanza carrying `payload` as its sole child.
    pub fn new_iq(sub_kind: SubKind, id: impl Into<String>, payload: Element) -> Stanza {
        let mut builder = Element::builder("iq", JABBER_CLIENT).attr(ncname("id"), id.into());
        if let Some(type_attr) = sub_kind.as_attr() {
            builder = builder.attr(ncname("type"), type_attr);
        }
        let element = builder.append(payload).build();
        Stanza::from_element_with_overrides(element, Kind::Iq, sub_kind)
    }

    fn from_element_with_overrides(element: Element, kind: Kind, sub_kind: SubKind) -> Stanza {
        let from = element.attr("from").and_then(|s| s.parse().ok());
        let to = element.attr("to").and_then(|s| s.parse().ok());
        let id = element.attr("id").map(str::to_string);
        let lang = element.attr("xml:lang").map(str::to_string);
        Stanza { kind, sub_kind, from, to, id, lang, element }
    }

    /// Returns this stanza's top-level payload children (everything other
    /// than the `message`/`presence`/`iq` wrapper).
    pub fn payload(&self) -> impl Iterator<Item = &Element> {
        self.element.children()
    }
}
