//! Collision-free local names for bridged tools.

use std::collections::HashSet;

/// Upper bound on bridged tool names, suffix included.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Lowercase, collapse every run of characters outside `[a-z0-9_]` into a
/// single `_`, trim underscores at both ends. Empty results become `tool`.
pub fn normalize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;

    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "tool".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Names handed out during one discovery session. Reservation order is the
/// order of `reserve` calls, so the same inputs always produce the same names.
#[derive(Debug, Default)]
pub struct ToolNameRegistry {
    reserved: HashSet<String>,
}

impl ToolNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.reserved.contains(&name.to_ascii_lowercase())
    }

    /// Reserve and return a unique name for `tool` on `server`.
    pub fn reserve(&mut self, server: &str, tool: &str) -> String {
        let base = format!("mcp_{}_{}", normalize_segment(server), normalize_segment(tool));
        let base = truncate(&base, MAX_TOOL_NAME_LEN);

        if self.try_reserve(base) {
            return base.to_string();
        }

        let mut n: u64 = 2;
        loop {
            let suffix = format!("_{}", n);
            let candidate = format!(
                "{}{}",
                truncate(base, MAX_TOOL_NAME_LEN - suffix.len()),
                suffix
            );
            if self.try_reserve(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn try_reserve(&mut self, name: &str) -> bool {
        self.reserved.insert(name.to_ascii_lowercase())
    }
}

// Normalized names are ASCII, so byte and char boundaries coincide.
fn truncate(name: &str, max: usize) -> &str {
    &name[..name.len().min(max)]
}
