//! Token budget allocation for pack sections, independent of the output
//! format. Sections are filled in priority order; items are dropped from
//! the tail of a section first, and a section that cannot fit a single
//! item is omitted outright.

use crate::models::estimate_tokens;

/// Rendering overhead reserved per item (tags and attributes).
pub(crate) const ITEM_OVERHEAD_TOKENS: u32 = 16;
/// Rendering overhead reserved for the document envelope.
pub(crate) const ENVELOPE_OVERHEAD_TOKENS: u32 = 48;

/// One renderable entry of a pack section, with its source identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionItem {
    pub id: String,
    pub source_type: String,
    pub session: String,
    pub body: String,
    /// Optional short label (e.g. a task status or plan slug).
    pub label: Option<String>,
}

impl SectionItem {
    pub(crate) fn cost(&self) -> u32 {
        estimate_tokens(&self.body) + ITEM_OVERHEAD_TOKENS
    }
}

/// A filled section ready for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: &'static str,
    pub items: Vec<SectionItem>,
}

/// Fill a section from candidate items (already in the desired order) until
/// the allocation or the global remainder runs out. Returns `None` when not
/// a single item fits, which omits the section entirely.
pub(crate) fn fill_section(
    name: &'static str,
    candidates: Vec<SectionItem>,
    allocation: u32,
    global_remaining: &mut u32,
) -> Option<Section> {
    let mut used = 0u32;
    let mut items = Vec::new();

    for item in candidates {
        let cost = item.cost();
        if used + cost > allocation || cost > *global_remaining {
            // Tail-first truncation: the first item that does not fit ends
            // the section.
            break;
        }
        used += cost;
        *global_remaining -= cost;
        items.push(item);
    }

    if items.is_empty() {
        return None;
    }
    Some(Section { name, items })
}
