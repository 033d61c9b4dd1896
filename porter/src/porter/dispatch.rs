//! Subset matching of a handler's registered template against a stanza's payload.

use minidom::Element;

use crate::ns::NsTag;

/// A template matched against a stanza's top-level payload children.
///
/// A template matches a body element `b` when:
/// - `b`'s name and namespace equal the template's,
/// - every attribute in the template is present with an equal value on `b`,
/// - if the template carries text, `b`'s text equals it exactly, and
/// - every templated child matches, **positionally**, the body's child at
///   the same index (the template may have fewer children than the body,
///   but not more).
///
/// [`matches_any`](MatchTemplate::matches_any) asks whether *any one* of the
/// stanza's top-level payload children matches the template this way; the
/// positional rule only applies to descendants once that anchor child is found.
#[derive(Debug, Clone)]
pub struct MatchTemplate {
    name: String,
    ns: NsTag,
    attrs: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<MatchTemplate>,
}

impl MatchTemplate {
    /// Builds a template matching elements named `name` in namespace `ns`.
    pub fn new(name: impl Into<String>, ns: &str) -> Self {
        MatchTemplate {
            name: name.into(),
            ns: NsTag::intern(ns),
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    /// Requires the matched element to carry attribute `key = value`.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    /// Requires the matched element's text content to equal `text` exactly.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Appends a positional child template.
    pub fn child(mut self, child: MatchTemplate) -> Self {
        self.children.push(child);
        self
    }

    fn matches_element(&self, body: &Element) -> bool {
        if body.name() != self.name || body.ns() != self.ns.as_str() {
            return false;
        }
        for (key, value) in &self.attrs {
            if body.attr(key) != Some(value.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.text {
            if &body.text() != want {
                return false;
            }
        }
        let body_children: Vec<&Element> = body.children().collect();
        if self.children.len() > body_children.len() {
            return false;
        }
        self.children
            .iter()
            .zip(body_children.iter())
            .all(|(template, child)| template.matches_element(child))
    }

    /// Returns `true` if any element in `payload` matches this template.
    pub fn matches_any<'a>(&self, payload: impl Iterator<Item = &'a Element>) -> bool {
        payload.into_iter().any(|el| self.matches_element(el))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    #[test]
    fn matches_name_and_namespace() {
        let template = MatchTemplate::new("query", "jabber:iq:roster");
        let body = element(r#"<query xmlns="jabber:iq:roster"/>"#);
        assert!(template.matches_any(std::iter::once(&body)));
    }

    #[test]
    fn rejects_wrong_namespace() {
        let template = MatchTemplate::new("query", "jabber:iq:roster");
        let body = element(r#"<query xmlns="jabber:iq:private"/>"#);
        assert!(!template.matches_any(std::iter::once(&body)));
    }

    #[test]
    fn attribute_subset_must_be_present() {
        let template = MatchTemplate::new("x", "urn:test").attr("a", "1");
        let missing = element(r#"<x xmlns="urn:test" b="2"/>"#);
        let present = element(r#"<x xmlns="urn:test" a="1" b="2"/>"#);
        assert!(!template.matches_any(std::iter::once(&missing)));
        assert!(template.matches_any(std::iter::once(&present)));
    }

    #[test]
    fn positional_children_must_match_in_order() {
        let template =
            MatchTemplate::new("x", "urn:test").child(MatchTemplate::new("b", "urn:test"));
        let wrong_order = element(r#"<x xmlns="urn:test"><a xmlns="urn:test"/><b xmlns="urn:test"/></x>"#);
        let right_order = element(r#"<x xmlns="urn:test"><b xmlns="urn:test"/><a xmlns="urn:test"/></x>"#);
        assert!(!template.matches_any(std::iter::once(&wrong_order)));
        assert!(template.matches_any(std::iter::once(&right_order)));
    }

    #[test]
    fn matches_any_top_level_child() {
        let template = MatchTemplate::new("query", "jabber:iq:roster");
        let first = element(r#"<query xmlns="jabber:iq:roster"/>"#);
        let second = element(r#"<ignored xmlns="urn:test"/>"#);
        assert!(template.matches_any(vec![&second, &first].into_iter()));
    }
}
