// src/engine/prompt.rs

//! Prompt template rendering.
//!
//! Templates reference row columns as `{column}`. Unknown columns render as
//! an empty string; `{{` and `}}` produce literal braces.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::types::RowSnapshot;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{\s*([^{}]+?)\s*\}").expect("placeholder regex is valid")
});

/// Render `template` against the row's values.
pub fn render_prompt(template: &str, snapshot: &RowSnapshot) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match caps.get(1) {
            Some(column) => snapshot
                .get(column.as_str())
                .cloned()
                .unwrap_or_default(),
            None if &caps[0] == "{{" => "{".to_string(),
            None => "}".to_string(),
        })
        .into_owned()
}

/// Column names referenced by `template`, in order of appearance.
pub fn referenced_columns(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}
