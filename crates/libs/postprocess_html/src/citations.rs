//! Citation repair.
//!
//! The converter often emits citations where only the year carries the
//! bibliography link:
//!
//! ```html
//! <cite><span>Mora, </span><span>(</span><a href="#b1">1989</a><span>)</span></cite>
//! ```
//!
//! Readers expect the whole `Author, (Year)` run to be clickable, so the
//! repair rewraps it in a single link to the same anchor. Semicolon-separated
//! multi-citation groups are left untouched.

use kuchikiki::NodeRef;
use regex::Regex;

use crate::dom;

/// Regexes shared by the citation pass, compiled once per processor.
#[derive(Debug)]
pub struct CitationPatterns {
    pub year: Regex,
    pub author_paren: Regex,
    pub author_comma: Regex,
    pub embedded_citation: Regex,
}

impl CitationPatterns {
    #[must_use]
    pub fn compile() -> Self {
        Self {
            year: Regex::new(r"(\d{4}[a-z]?)").expect("static regex"),
            author_paren: Regex::new(r"([A-Z][A-Za-z\s]+?(?:et\s+al\.)?)\s*,\s*\(\s*\)?\s*$")
                .expect("static regex"),
            author_comma: Regex::new(r"([A-Z][A-Za-z\s]+?(?:et\s+al\.)?)\s*,\s*$")
                .expect("static regex"),
            embedded_citation: Regex::new(r"\([^()]{0,50}?,\s*\d{4}[a-z]?\)")
                .expect("static regex"),
        }
    }
}

/// Maximum plausible length for a single citation's text.
const OVERSIZED_CITE_CHARS: usize = 100;

/// Applies citation repair over the whole document. Returns how many
/// citations were rewritten.
pub fn repair_citations(doc: &NodeRef, patterns: &CitationPatterns) -> usize {
    let mut repaired = 0;
    for cite in dom::select_all(doc, "cite") {
        let text = dom::normalized_text(&cite);

        // Multi-citation groups are a known gap; skip them whole.
        if text.contains(';') {
            continue;
        }

        if text.chars().count() > OVERSIZED_CITE_CHARS {
            shrink_oversized(&cite, &text, patterns);
            continue;
        }

        if rewrap_split_citation(&cite, patterns) {
            repaired += 1;
        }
    }
    repaired
}

/// The `Author, ( ) <a>Year</a>` shape: author text nodes before a lone
/// year link. Rebuilds the cite as one link covering author plus year.
fn rewrap_split_citation(cite: &NodeRef, patterns: &CitationPatterns) -> bool {
    let links = dom::select_all(cite, "a");
    let [link] = links.as_slice() else {
        return false;
    };

    let link_text = dom::normalized_text(link);
    let Some(year) = patterns
        .year
        .captures(&link_text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
    else {
        return false;
    };

    // Direct child of the cite that holds (or is) the link.
    let link_holder = cite
        .children()
        .find(|child| child == link || link.ancestors().any(|a| &a == child));
    let Some(link_holder) = link_holder else {
        return false;
    };

    let mut before = String::new();
    for child in cite.children() {
        if child == link_holder {
            break;
        }
        before.push_str(&child.text_contents());
        before.push(' ');
    }
    let before = before.split_whitespace().collect::<Vec<_>>().join(" ");

    let author = patterns
        .author_paren
        .captures(&before)
        .or_else(|| patterns.author_comma.captures(&before))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());
    let Some(author) = author else {
        return false;
    };

    let href = dom::attr(link, "href").unwrap_or_default();
    let title = dom::attr(link, "title");

    let _ = dom::take_children(cite);
    let mut attrs: Vec<(&str, &str)> = vec![("class", "ltx_ref"), ("href", &href)];
    if let Some(title) = &title {
        attrs.push(("title", title.as_str()));
    }
    let rewrapped = dom::make_element("a", &attrs);
    rewrapped.append(NodeRef::new_text(format!("{author}, ({year})")));
    cite.append(rewrapped);

    tracing::debug!(author, year, "rewrapped citation");
    true
}

/// A `cite` that swallowed surrounding prose: keep only the recognizable
/// `(Author, Year)` span inside, or unwrap entirely when none is found.
fn shrink_oversized(cite: &NodeRef, text: &str, patterns: &CitationPatterns) {
    if let Some(found) = patterns.embedded_citation.find(text) {
        let before = text[..found.start()].trim_end();
        let after = text[found.end()..].trim_start();

        let _ = dom::take_children(cite);
        if !before.is_empty() {
            cite.insert_before(NodeRef::new_text(format!("{before} ")));
        }
        cite.append(NodeRef::new_text(found.as_str().to_string()));
        if !after.is_empty() {
            cite.insert_after(NodeRef::new_text(format!(" {after}")));
        }
    } else {
        // No citation inside at all: the tag itself is the artifact.
        for child in dom::take_children(cite) {
            cite.insert_before(child);
        }
        cite.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{normalized_text, parse, select_all, select_first, serialize};

    fn repair(html: &str) -> NodeRef {
        let doc = parse(html);
        repair_citations(&doc, &CitationPatterns::compile());
        doc
    }

    #[test]
    fn rewraps_author_and_year_into_one_link() {
        let doc = repair(
            "<p><cite><span>Mora, </span><span>(</span>\
             <a href=\"#b1\">1989</a><span>)</span></cite></p>",
        );
        let cite = select_first(&doc, "cite").unwrap();
        let links = select_all(&cite, "a");
        assert_eq!(links.len(), 1);
        assert_eq!(crate::dom::attr(&links[0], "href").as_deref(), Some("#b1"));
        assert_eq!(normalized_text(&cite), "Mora, (1989)");
    }

    #[test]
    fn handles_et_al_authors() {
        let doc = repair(
            "<p><cite>Smith et al., ( <a href=\"#bib.bib7\">2021a</a> )</cite></p>",
        );
        let cite = select_first(&doc, "cite").unwrap();
        assert_eq!(normalized_text(&cite), "Smith et al., (2021a)");
        let link = select_first(&cite, "a").unwrap();
        assert_eq!(crate::dom::attr(&link, "href").as_deref(), Some("#bib.bib7"));
    }

    #[test]
    fn repair_is_idempotent() {
        let input = "<p><cite><span>Mora, </span><span>(</span>\
                     <a href=\"#b1\">1989</a><span>)</span></cite></p>";
        let once = serialize(&repair(input));
        let twice = serialize(&repair(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn multi_citation_groups_are_left_alone() {
        let input = "<p><cite>Mora, (<a href=\"#b1\">1989</a>); \
                     Li, (<a href=\"#b2\">1990</a>)</cite></p>";
        let doc = repair(input);
        let cite = select_first(&doc, "cite").unwrap();
        assert_eq!(select_all(&cite, "a").len(), 2);
    }

    #[test]
    fn oversized_cite_is_reduced_to_its_citation() {
        let filler = "word ".repeat(25);
        let doc = repair(&format!(
            "<p><cite>{filler}(Keller, 2004) {filler}</cite></p>"
        ));
        let cite = select_first(&doc, "cite").unwrap();
        assert_eq!(normalized_text(&cite), "(Keller, 2004)");
    }

    #[test]
    fn oversized_cite_without_citation_is_unwrapped() {
        let filler = "word ".repeat(30);
        let doc = repair(&format!("<p><cite>{filler}</cite></p>"));
        assert!(select_first(&doc, "cite").is_none());
        assert!(normalized_text(&select_first(&doc, "p").unwrap()).contains("word"));
    }

    #[test]
    fn plain_year_only_link_is_untouched() {
        let input = "<p>see <cite><a href=\"#b3\">2001</a></cite></p>";
        let doc = repair(input);
        let cite = select_first(&doc, "cite").unwrap();
        assert_eq!(normalized_text(&cite), "2001");
    }
}
