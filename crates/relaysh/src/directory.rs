//! Read-only listing and search over agent metadata

use crate::metadata::SystemInfo;
use crate::session::{SessionId, SessionRegistry};
use regex::{Regex, RegexBuilder};
use std::fmt::Write as _;

/// Terminal emphasis wrapped around search hits
pub const HIGHLIGHT_START: &str = "\x1b[1;31m";
/// Resets terminal emphasis
pub const HIGHLIGHT_END: &str = "\x1b[0m";
/// Shown for fields an agent did not report
pub const MISSING: &str = "N/A";

struct Field {
    label: &'static str,
    section: Option<&'static str>,
    key: &'static str,
}

const fn field(label: &'static str, section: Option<&'static str>, key: &'static str) -> Field {
    Field { label, section, key }
}

/// Fields shown for every agent, in display order
const FIELDS: &[Field] = &[
    field("Vendor", None, "Vendor"),
    field("Product", Some("Product"), "Name"),
    field("Family", None, "Family"),
    field("SKU", None, "SKU"),
    field("Serial Number", None, "Serial Number"),
    field("UUID", None, "UUID"),
    field("CPU Model", None, "Model"),
    field("Physical CPUs", None, "Physical CPUs"),
    field("Logical CPUs", None, "Logical CPUs"),
    field("Total Cores", None, "Total Cores"),
    field("Memory", None, "Memory"),
    field("Disk", None, "Disk"),
];

impl Field {
    fn lookup<'a>(&self, info: &'a SystemInfo) -> Option<&'a str> {
        match self.section {
            Some(section) => info.get_in(section, self.key),
            None => info.get(self.key),
        }
    }
}

/// Display fields for one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    /// Session id
    pub id: SessionId,
    /// Remote address
    pub peer: String,
    /// Last heartbeat outcome
    pub alive: bool,
    /// `(label, value)` pairs, already highlighted for searches
    pub fields: Vec<(&'static str, String)>,
    /// Raw metadata lines containing the keyword, highlighted
    pub matches: Vec<String>,
}

impl AgentSummary {
    fn build(id: SessionId, peer: &str, alive: bool, info: &SystemInfo, keyword: Option<&Regex>) -> Self {
        let fields = FIELDS
            .iter()
            .map(|field| {
                let value = match (field.lookup(info), keyword) {
                    (None, _) => MISSING.to_string(),
                    (Some(value), None) => value.to_string(),
                    (Some(value), Some(keyword)) if keyword.is_match(field.label) => {
                        format!("{}{}{}", HIGHLIGHT_START, value, HIGHLIGHT_END)
                    }
                    (Some(value), Some(keyword)) => highlight(value, keyword),
                };
                (field.label, value)
            })
            .collect();

        let matches = match keyword {
            Some(keyword) => info
                .raw()
                .lines()
                .map(str::trim)
                .filter(|line| keyword.is_match(line))
                .map(|line| highlight(line, keyword))
                .collect(),
            None => Vec::new(),
        };

        Self {
            id,
            peer: peer.to_string(),
            alive,
            fields,
            matches,
        }
    }

    /// Value shown for `label`, if it is a known field
    pub fn field(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, v)| v.as_str())
    }
}

/// Summaries of every live agent, ordered by id
pub async fn list(registry: &SessionRegistry) -> Vec<AgentSummary> {
    let mut summaries = Vec::new();
    for session in registry.list().await {
        let info = session.metadata().await;
        summaries.push(AgentSummary::build(
            session.id(),
            session.peer(),
            session.is_alive(),
            &info,
            None,
        ));
    }
    summaries
}

/// Agents whose metadata contains `keyword`, ignoring case.
///
/// An empty keyword matches nothing.
pub async fn search(registry: &SessionRegistry, keyword: &str) -> Vec<AgentSummary> {
    let keyword = match keyword_regex(keyword) {
        Some(keyword) => keyword,
        None => return Vec::new(),
    };

    let mut summaries = Vec::new();
    for session in registry.list().await {
        let info = session.metadata().await;
        if !keyword.is_match(info.raw()) {
            continue;
        }
        summaries.push(AgentSummary::build(
            session.id(),
            session.peer(),
            session.is_alive(),
            &info,
            Some(&keyword),
        ));
    }
    summaries
}

fn render_summary(out: &mut String, summary: &AgentSummary) {
    let status = if summary.alive { "alive" } else { "unresponsive" };
    let _ = writeln!(out, "  Agent {} ({}) [{}]", summary.id, summary.peer, status);
    for (label, value) in &summary.fields {
        let _ = writeln!(out, "    {}: {}", label, value);
    }
    if !summary.matches.is_empty() {
        let _ = writeln!(out, "    Matches:");
        for line in &summary.matches {
            let _ = writeln!(out, "      {}", line);
        }
    }
}

/// Render the `list` view
pub fn render_list(summaries: &[AgentSummary]) -> String {
    if summaries.is_empty() {
        return "No agents connected\n".to_string();
    }
    let mut out = String::from("Connected agents:\n");
    for summary in summaries {
        render_summary(&mut out, summary);
    }
    out
}

/// Render the `search` view
pub fn render_search(keyword: &str, summaries: &[AgentSummary]) -> String {
    if summaries.is_empty() {
        return format!("No agents match '{}'\n", keyword.trim());
    }
    let mut out = format!("Agents matching '{}':\n", keyword.trim());
    for summary in summaries {
        render_summary(&mut out, summary);
    }
    out
}

/// Literal, case-insensitive matcher for a search keyword; `None` when the
/// keyword is blank
pub fn keyword_regex(keyword: &str) -> Option<Regex> {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return None;
    }
    RegexBuilder::new(&regex::escape(keyword))
        .case_insensitive(true)
        .build()
        .ok()
}

/// Wrap every occurrence of `keyword` in emphasis
pub fn highlight(text: &str, keyword: &Regex) -> String {
    let replacement = format!("{}${{0}}{}", HIGHLIGHT_START, HIGHLIGHT_END);
    keyword.replace_all(text, replacement.as_str()).into_owned()
}
