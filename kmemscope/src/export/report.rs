use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;

use crate::domain::{Category, Finding};

const CATEGORIES: [Category; 5] = [
    Category::NotFound,
    Category::Corruption,
    Category::UnsupportedLayout,
    Category::UnreadableMemory,
    Category::ConfigurationUnavailable,
];

/// Findings of one check, with the setup fallbacks that shaped it
#[derive(Debug, Clone)]
pub struct Report {
    pub subject: String,
    pub setup: Vec<Finding>,
    pub findings: Vec<Finding>,
}

#[derive(Serialize)]
struct Entry<'a> {
    category: Category,
    message: String,
    #[serde(flatten)]
    finding: &'a Finding,
}

impl<'a> Entry<'a> {
    fn new(finding: &'a Finding) -> Self {
        Self { category: finding.category(), message: finding.to_string(), finding }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    subject: &'a str,
    clean: bool,
    summary: Vec<(Category, usize)>,
    setup: Vec<Entry<'a>>,
    findings: Vec<Entry<'a>>,
}

impl Report {
    #[must_use]
    pub fn new(subject: impl Into<String>, setup: Vec<Finding>, findings: Vec<Finding>) -> Self {
        Self { subject: subject.into(), setup, findings }
    }

    /// No findings from the check itself; setup fallbacks do not count
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Number of findings per category, in a fixed order, zeros omitted
    #[must_use]
    pub fn summary(&self) -> Vec<(Category, usize)> {
        CATEGORIES
            .iter()
            .map(|&c| (c, self.findings.iter().filter(|f| f.category() == c).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// One line per finding, grouped under a header
    ///
    /// # Errors
    /// Returns an error if writing fails
    pub fn write_text<W: Write>(&self, out: &mut W) -> Result<()> {
        for note in &self.setup {
            writeln!(out, "note: {note}")?;
        }
        if self.is_clean() {
            writeln!(out, "{}: no problems found", self.subject)?;
            return Ok(());
        }

        let summary: Vec<String> = self.summary().iter().map(|(c, n)| format!("{n} {c}")).collect();
        writeln!(out, "{}: {} finding(s) ({})", self.subject, self.findings.len(), summary.join(", "))?;
        for finding in &self.findings {
            writeln!(out, "  [{}] {finding}", finding.category())?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error if serialization or writing fails
    pub fn write_json<W: Write>(&self, out: &mut W) -> Result<()> {
        let report = JsonReport {
            subject: &self.subject,
            clean: self.is_clean(),
            summary: self.summary(),
            setup: self.setup.iter().map(Entry::new).collect(),
            findings: self.findings.iter().map(Entry::new).collect(),
        };
        serde_json::to_writer_pretty(&mut *out, &report).context("Failed to serialize report")?;
        writeln!(out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FreeArea, NodeId, ZoneId};

    fn report() -> Report {
        Report::new(
            "zones",
            vec![Finding::ConfigurationUnavailable { item: "NODES_SHIFT".into(), default: "6".into() }],
            vec![Finding::FreeCountMismatch {
                node: NodeId(0),
                zone: ZoneId(1),
                area: FreeArea::Buddy { order: 2 },
                counted: 4,
                declared: 5,
            }],
        )
    }

    #[test]
    fn test_text_report() {
        let mut out = Vec::new();
        report().write_text(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("note: NODES_SHIFT unavailable, using 6"));
        assert!(text.contains("zones: 1 finding(s) (1 corruption)"));
        assert!(text.contains("counted 4 pages, declared 5"));
    }

    #[test]
    fn test_json_report() {
        let mut out = Vec::new();
        report().write_json(&mut out).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["clean"], false);
        assert_eq!(json["findings"][0]["category"], "corruption");
        assert_eq!(json["findings"][0]["kind"], "free_count_mismatch");
        assert_eq!(json["setup"][0]["category"], "configuration_unavailable");
    }

    #[test]
    fn test_clean_report() {
        let r = Report::new("slab dentry", Vec::new(), Vec::new());
        assert!(r.is_clean());
        let mut out = Vec::new();
        r.write_text(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "slab dentry: no problems found\n");
    }
}
