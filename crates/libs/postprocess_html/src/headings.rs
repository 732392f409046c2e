//! Heading cleanup.
//!
//! Unprocessed `\fontsize` commands leave `12pt`-style residue at the start
//! of headings. The residue lives in the heading's direct text nodes, so the
//! strip works there and leaves nested markup alone.

use std::borrow::Cow;

use kuchikiki::NodeRef;
use regex::Regex;

use crate::dom;

/// Matches one or more leading `NNpt` runs, so a single application removes
/// stacked residue completely.
#[must_use]
pub fn font_size_pattern() -> Regex {
    Regex::new(r"^(?:\d+pt\s*)+").expect("static regex")
}

/// Strips font-size residue from every `h1`–`h6`. Returns how many headings
/// changed.
pub fn strip_font_size_residue(doc: &NodeRef, pattern: &Regex) -> usize {
    let mut cleaned = 0;
    for heading in dom::select_all(doc, "h1, h2, h3, h4, h5, h6") {
        let mut changed = false;
        for child in heading.children() {
            let Some(text) = child.as_text() else {
                continue;
            };
            let current = text.borrow().clone();
            if let Cow::Owned(stripped) = pattern.replace(&current, "") {
                *text.borrow_mut() = stripped;
                changed = true;
            }
        }
        if changed {
            cleaned += 1;
        }
    }
    cleaned
}
