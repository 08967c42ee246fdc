//! Blacklist filter: forbidden commands and patterns. Never overridable.

use super::{normalize_whitespace, split_statements, Layer, Severity, Verdict};
use crate::config::BlacklistConfig;
use anyhow::{Context, Result};
use regex::Regex;

/// Exact-match and regex blacklist.
#[derive(Debug, Clone)]
pub struct BlacklistFilter {
    exact: Vec<String>,
    patterns: Vec<(String, Regex)>,
}

impl BlacklistFilter {
    /// Compile the configured patterns. A pattern that fails to compile is a configuration error.
    pub fn new(config: &BlacklistConfig) -> Result<Self> {
        let exact = config
            .exact
            .iter()
            .map(|e| normalize_whitespace(e))
            .filter(|e| !e.is_empty())
            .collect();
        let patterns = config
            .patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .with_context(|| format!("invalid blacklist pattern: {p}"))
                    .map(|re| (p.clone(), re))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { exact, patterns })
    }

    /// Check a command. First match wins.
    pub fn check(&self, command: &str) -> Verdict {
        let normalized = normalize_whitespace(command);

        let mut candidates = vec![normalized.clone()];
        candidates.extend(split_statements(&normalized).into_iter().map(|s| normalize_whitespace(&s)));
        for candidate in &candidates {
            if let Some(hit) = self.exact.iter().find(|e| *e == candidate) {
                return Verdict::block(
                    Layer::Blacklist,
                    Severity::Critical,
                    format!("command '{candidate}' is blacklisted"),
                )
                .with_rule(hit.clone());
            }
        }

        for (source, re) in &self.patterns {
            if re.is_match(&normalized) {
                return Verdict::block(
                    Layer::Blacklist,
                    Severity::Critical,
                    format!("command matches blacklisted pattern {source}"),
                )
                .with_rule(source.clone());
            }
        }

        Verdict::pass(Layer::Blacklist, "no blacklist match")
    }
}
