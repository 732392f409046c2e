//! Small helpers over the kuchikiki DOM.

use html5ever::{namespace_url, ns, LocalName, QualName};
use kuchikiki::traits::*;
use kuchikiki::{Attribute, ExpandedName, NodeRef};

/// Parses HTML leniently; never fails, malformed input yields a best-effort
/// tree.
#[must_use]
pub fn parse(html: &str) -> NodeRef {
    kuchikiki::parse_html().one(html)
}

/// Serializes a document back to an HTML string.
#[must_use]
pub fn serialize(doc: &NodeRef) -> String {
    let mut out = Vec::new();
    if doc.serialize(&mut out).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// All nodes matching a CSS selector, in document order.
///
/// Matches are collected eagerly so callers may detach nodes while walking
/// the result.
#[must_use]
pub fn select_all(scope: &NodeRef, selector: &str) -> Vec<NodeRef> {
    scope
        .select(selector)
        .map(|matches| matches.map(|m| m.as_node().clone()).collect())
        .unwrap_or_default()
}

/// First node matching a CSS selector.
#[must_use]
pub fn select_first(scope: &NodeRef, selector: &str) -> Option<NodeRef> {
    scope
        .select_first(selector)
        .ok()
        .map(|m| m.as_node().clone())
}

/// Creates an HTML element with the given attributes.
#[must_use]
pub fn make_element(name: &str, attrs: &[(&str, &str)]) -> NodeRef {
    NodeRef::new_element(
        QualName::new(None, ns!(html), LocalName::from(name)),
        attrs.iter().map(|(key, value)| {
            (
                ExpandedName::new(ns!(), LocalName::from(*key)),
                Attribute {
                    prefix: None,
                    value: (*value).to_string(),
                },
            )
        }),
    )
}

/// Lowercased local element name, `None` for non-elements.
#[must_use]
pub fn element_name(node: &NodeRef) -> Option<String> {
    node.as_element().map(|el| el.name.local.to_string())
}

#[must_use]
pub fn attr(node: &NodeRef, name: &str) -> Option<String> {
    let el = node.as_element()?;
    let attrs = el.attributes.borrow();
    attrs.get(name).map(ToString::to_string)
}

pub fn set_attr(node: &NodeRef, name: &str, value: &str) {
    if let Some(el) = node.as_element() {
        el.attributes
            .borrow_mut()
            .insert(name, value.to_string());
    }
}

/// Whether the element's `class` attribute contains `needle` as a substring.
#[must_use]
pub fn class_contains(node: &NodeRef, needle: &str) -> bool {
    attr(node, "class").is_some_and(|c| c.contains(needle))
}

/// Detaches and returns all children, preserving order.
#[must_use]
pub fn take_children(node: &NodeRef) -> Vec<NodeRef> {
    let children: Vec<NodeRef> = node.children().collect();
    for child in &children {
        child.detach();
    }
    children
}

/// Text content with runs of whitespace collapsed to single spaces.
#[must_use]
pub fn normalized_text(node: &NodeRef) -> String {
    let mut out = String::new();
    let mut last_ws = true;
    for ch in node.text_contents().chars() {
        if ch.is_whitespace() {
            if !last_ws {
                out.push(' ');
                last_ws = true;
            }
        } else {
            out.push(ch);
            last_ws = false;
        }
    }
    out.trim_end().to_string()
}

/// Whether this node is itself a math atom: MathML, a MathJax container, or
/// a class-marked math span/div. Both renderer families funnel through here.
#[must_use]
pub fn is_math_node(node: &NodeRef) -> bool {
    let Some(name) = element_name(node) else {
        return false;
    };
    match name.as_str() {
        "math" | "m:math" | "mjx-container" | "mjx-math" => true,
        "span" | "div" => {
            attr(node, "class").is_some_and(|c| {
                c.split_whitespace()
                    .any(|cls| cls == "math" || cls == "math-display")
            })
        }
        _ => false,
    }
}

/// Whether the subtree rooted here contains any math atom.
#[must_use]
pub fn has_math_descendant(node: &NodeRef) -> bool {
    node.inclusive_descendants().any(|n| is_math_node(&n))
}

/// Next sibling that is not a whitespace-only text node.
#[must_use]
pub fn next_meaningful_sibling(node: &NodeRef) -> Option<NodeRef> {
    let mut current = node.next_sibling();
    while let Some(sibling) = current {
        if let Some(text) = sibling.as_text() {
            if text.borrow().trim().is_empty() {
                current = sibling.next_sibling();
                continue;
            }
        }
        return Some(sibling);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_and_text() {
        let doc = parse("<p>one <b>two</b>\n three</p>");
        let p = select_first(&doc, "p").unwrap();
        assert_eq!(normalized_text(&p), "one two three");
        assert_eq!(select_all(&doc, "b").len(), 1);
    }

    #[test]
    fn make_element_carries_attributes() {
        let a = make_element("a", &[("href", "#b1"), ("class", "ltx_ref")]);
        assert_eq!(attr(&a, "href").as_deref(), Some("#b1"));
        assert_eq!(element_name(&a).as_deref(), Some("a"));
    }

    #[test]
    fn math_detection_covers_both_renderer_families() {
        let doc = parse(
            "<p><math></math><mjx-container></mjx-container>\
             <span class=\"math\">$x$</span><span class=\"plain\">x</span></p>",
        );
        let mathy: Vec<_> = select_first(&doc, "p")
            .unwrap()
            .children()
            .filter(is_math_node)
            .collect();
        assert_eq!(mathy.len(), 3);
    }

    #[test]
    fn next_meaningful_sibling_skips_whitespace() {
        let doc = parse("<p><i>a</i>  \n <i>b</i></p>");
        let first = select_first(&doc, "i").unwrap();
        let next = next_meaningful_sibling(&first).unwrap();
        assert_eq!(normalized_text(&next), "b");
    }
}
