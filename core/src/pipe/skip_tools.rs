//! Skip-tool resolution.
//!
//! Config names generic categories (`file_read`, `file_edit`); this table
//! maps them to concrete tool names per provider. Only anthropic and
//! bedrock rows are verified against real agent traffic; every other
//! provider falls back to the union of all known names for the category,
//! which widens the skip set for unverified providers.

use std::collections::HashSet;

struct CategoryRow {
    category: &'static str,
    provider: &'static str,
    names: &'static [&'static str],
}

const SKIP_TABLE: &[CategoryRow] = &[
    CategoryRow {
        category: "file_read",
        provider: "anthropic",
        names: &["Read", "NotebookRead"],
    },
    CategoryRow {
        category: "file_read",
        provider: "bedrock",
        names: &["Read"],
    },
    CategoryRow {
        category: "file_edit",
        provider: "anthropic",
        names: &["Edit", "Write", "NotebookEdit"],
    },
    CategoryRow {
        category: "file_edit",
        provider: "bedrock",
        names: &["Edit", "Write"],
    },
];

/// Concrete tool names to skip for a (category list, provider) pair.
///
/// Unknown categories resolve to the category name itself, so operators can
/// list literal tool names alongside categories.
pub fn resolve_skip_set(categories: &[String], provider: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    for category in categories {
        let rows: Vec<&CategoryRow> = SKIP_TABLE
            .iter()
            .filter(|row| row.category == category)
            .collect();
        if rows.is_empty() {
            names.insert(category.clone());
            continue;
        }
        let verified: Vec<&CategoryRow> = rows
            .iter()
            .filter(|row| row.provider == provider)
            .copied()
            .collect();
        let chosen = if verified.is_empty() { &rows } else { &verified };
        for row in chosen {
            for name in row.names {
                names.insert((*name).to_string());
            }
        }
    }
    names
}
