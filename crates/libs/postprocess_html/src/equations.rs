//! Display-equation merging.
//!
//! Two producer shapes need coalescing:
//!
//! - **Tabular form**: the converter hosts one logical equation in a `table`
//!   (class `ltx_equation` / `ltx_eqn_table`) but sometimes splits it across
//!   rows or cells. The whole equation must end up in a single 1×1 cell.
//! - **Script-container form**: the client-side renderer emits
//!   `mjx-container` elements; a split equation appears as contiguous
//!   containers that must be merged, concatenating their math subtrees in
//!   document order.

use kuchikiki::NodeRef;

use crate::dom;

/// Coalesces every equation table down to a single row holding a single
/// cell. Returns the number of merge operations applied: one per coalesced
/// table plus one per table whose script containers were merged.
pub fn merge_equation_tables(doc: &NodeRef) -> usize {
    let mut merged = 0;
    for table in dom::select_all(doc, "table") {
        if !is_equation_table(&table) {
            continue;
        }
        if coalesce_table(&table) {
            merged += 1;
        }
        // Containers inside the (possibly untouched) cell may still need a
        // merge pass of their own. In-table containers rarely carry the
        // `display` attribute, so the document-wide pass never sees them;
        // count their merges here.
        merged += usize::from(merge_math_containers(&table) > 0);
    }
    merged
}

fn is_equation_table(table: &NodeRef) -> bool {
    dom::class_contains(table, "ltx_equation") || dom::class_contains(table, "ltx_eqn_table")
}

fn coalesce_table(table: &NodeRef) -> bool {
    let rows = dom::select_all(table, "tr");
    let cells = dom::select_all(table, "td");
    if rows.len() <= 1 && cells.len() <= 1 {
        return false;
    }

    // The cell already carrying math anchors the merge; otherwise the first
    // cell does.
    let Some(main_cell) = cells
        .iter()
        .find(|cell| dom::has_math_descendant(cell))
        .or_else(|| cells.first())
        .cloned()
    else {
        return false;
    };

    // Move content from every other cell, in document order, then drop the
    // emptied cells and rows.
    for cell in &cells {
        if cell == &main_cell {
            continue;
        }
        for child in dom::take_children(cell) {
            main_cell.append(child);
        }
        cell.detach();
    }

    let main_row = main_cell
        .ancestors()
        .find(|a| dom::element_name(a).as_deref() == Some("tr"));
    if main_row.is_some() {
        for row in &rows {
            if Some(row) != main_row.as_ref() {
                row.detach();
            }
        }
    }

    tracing::debug!(
        rows = rows.len(),
        cells = cells.len(),
        "coalesced equation table into a single cell"
    );
    true
}

/// Merges runs of contiguous `mjx-container` siblings into the first
/// container of each run. Whitespace-only text between containers does not
/// break a run. Returns the number of containers removed.
pub fn merge_math_containers(scope: &NodeRef) -> usize {
    let mut removed = 0;
    for container in dom::select_all(scope, "mjx-container") {
        // A container consumed by an earlier run is already detached.
        if container.parent().is_none() {
            continue;
        }
        while let Some(next) = dom::next_meaningful_sibling(&container) {
            if dom::element_name(&next).as_deref() != Some("mjx-container") {
                break;
            }
            absorb_container(&container, &next);
            next.detach();
            removed += 1;
        }
    }
    removed
}

/// Merges runs of contiguous display-mode containers document-wide. Inline
/// containers are excluded: prose between inline formulas is meaningful, a
/// run of bare display containers is one split equation.
pub fn merge_display_containers(doc: &NodeRef) -> usize {
    let mut removed = 0;
    for container in dom::select_all(doc, "mjx-container[display]") {
        if container.parent().is_none() {
            continue;
        }
        while let Some(next) = dom::next_meaningful_sibling(&container) {
            if dom::element_name(&next).as_deref() != Some("mjx-container")
                || dom::attr(&next, "display").is_none()
            {
                break;
            }
            absorb_container(&container, &next);
            next.detach();
            removed += 1;
        }
    }
    removed
}

/// Moves `next`'s math subtree (and any stray children) into `first`.
fn absorb_container(first: &NodeRef, next: &NodeRef) {
    let first_math = dom::select_first(first, "mjx-math");
    let next_math = dom::select_first(next, "mjx-math");

    match (&first_math, &next_math) {
        (Some(first_math), Some(next_math)) => {
            for child in dom::take_children(next_math) {
                first_math.append(child);
            }
            next_math.detach();
            for child in dom::take_children(next) {
                first.append(child);
            }
        }
        _ => {
            for child in dom::take_children(next) {
                first.append(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{normalized_text, parse, select_all, select_first, serialize};

    #[test]
    fn two_rows_merge_into_one_cell_preserving_order() {
        let doc = parse(
            "<table class=\"ltx_equation\"><tbody>\
             <tr class=\"ltx_eqn_row\"><td class=\"ltx_eqn_cell\"><math>a</math></td></tr>\
             <tr class=\"ltx_eqn_row\"><td class=\"ltx_eqn_cell\"><math>b</math></td></tr>\
             </tbody></table>",
        );
        assert_eq!(merge_equation_tables(&doc), 1);

        let table = select_first(&doc, "table").unwrap();
        assert_eq!(select_all(&table, "tr").len(), 1);
        assert_eq!(select_all(&table, "td").len(), 1);
        let cell = select_first(&table, "td").unwrap();
        assert_eq!(normalized_text(&cell), "ab");
        assert_eq!(select_all(&cell, "math").len(), 2);
    }

    #[test]
    fn split_cells_collapse_around_the_math_cell() {
        let doc = parse(
            "<table class=\"ltx_eqn_table\"><tbody><tr>\
             <td>(1)</td><td><math>x=y</math></td><td>pad</td>\
             </tr></tbody></table>",
        );
        merge_equation_tables(&doc);
        let cells = select_all(&doc, "td");
        assert_eq!(cells.len(), 1);
        let text = normalized_text(&cells[0]);
        assert!(text.contains("x=y"));
        assert!(text.contains("(1)"));
    }

    #[test]
    fn non_equation_tables_are_untouched() {
        let input = "<table><tbody><tr><td>a</td><td>b</td></tr></tbody></table>";
        let doc = parse(input);
        assert_eq!(merge_equation_tables(&doc), 0);
        assert_eq!(select_all(&doc, "td").len(), 2);
    }

    #[test]
    fn contiguous_mjx_containers_merge_in_document_order() {
        let doc = parse(
            "<div><mjx-container><mjx-math><mjx-mi>a</mjx-mi></mjx-math></mjx-container>\
             <mjx-container><mjx-math><mjx-mi>b</mjx-mi></mjx-math></mjx-container></div>",
        );
        assert_eq!(merge_math_containers(&doc), 1);
        let containers = select_all(&doc, "mjx-container");
        assert_eq!(containers.len(), 1);
        assert_eq!(normalized_text(&containers[0]), "ab");
        assert_eq!(select_all(&containers[0], "mjx-math").len(), 1);
    }

    #[test]
    fn containers_separated_by_text_stay_apart() {
        let doc = parse(
            "<p><mjx-container><mjx-math>a</mjx-math></mjx-container> and \
             <mjx-container><mjx-math>b</mjx-math></mjx-container></p>",
        );
        assert_eq!(merge_math_containers(&doc), 0);
        assert_eq!(select_all(&doc, "mjx-container").len(), 2);
    }

    #[test]
    fn in_table_container_merges_are_counted() {
        // Already 1×1, but the one cell holds a split script-form equation.
        let doc = parse(
            "<table class=\"ltx_equation\"><tbody><tr><td>\
             <mjx-container><mjx-math>a</mjx-math></mjx-container>\
             <mjx-container><mjx-math>b</mjx-math></mjx-container>\
             </td></tr></tbody></table>",
        );
        assert_eq!(merge_equation_tables(&doc), 1);
        let containers = select_all(&doc, "mjx-container");
        assert_eq!(containers.len(), 1);
        assert_eq!(normalized_text(&containers[0]), "ab");
    }

    #[test]
    fn display_container_runs_merge_but_inline_pairs_do_not() {
        let doc = parse(
            "<div><mjx-container display=\"true\"><mjx-math>a</mjx-math></mjx-container>\
             <mjx-container display=\"true\"><mjx-math>b</mjx-math></mjx-container></div>\
             <p><mjx-container><mjx-math>x</mjx-math></mjx-container>\
             <mjx-container><mjx-math>y</mjx-math></mjx-container></p>",
        );
        assert_eq!(merge_display_containers(&doc), 1);
        assert_eq!(select_all(&doc, "div mjx-container").len(), 1);
        assert_eq!(select_all(&doc, "p mjx-container").len(), 2);
    }

    #[test]
    fn merging_is_idempotent() {
        let input = "<table class=\"ltx_equation\"><tbody>\
             <tr><td><mjx-container><mjx-math>a</mjx-math></mjx-container></td></tr>\
             <tr><td><mjx-container><mjx-math>b</mjx-math></mjx-container></td></tr>\
             </tbody></table>";
        let doc = parse(input);
        merge_equation_tables(&doc);
        let once = serialize(&doc);
        let doc2 = parse(&once);
        merge_equation_tables(&doc2);
        assert_eq!(once, serialize(&doc2));
    }
}
