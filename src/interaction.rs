//! Detects output of a process blocked on interactive input.

use anyhow::Context;
use regex::Regex;
use serde::Serialize;

/// A matched prompt signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionMatch {
    pub signature: String,
    /// The output line that matched.
    pub excerpt: String,
}

pub struct InteractionDetector {
    signatures: Vec<Regex>,
}

impl InteractionDetector {
    pub fn new(signatures: &[String]) -> anyhow::Result<Self> {
        let signatures = signatures
            .iter()
            .map(|s| Regex::new(s).with_context(|| format!("interaction signature '{s}'")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { signatures })
    }

    /// First signature found in `output`, if any.
    pub fn scan(&self, output: &str) -> Option<InteractionMatch> {
        self.signatures.iter().find_map(|re| {
            let found = re.find(output)?;
            let line_start = output[..found.start()].rfind('\n').map_or(0, |i| i + 1);
            let line_end = output[found.end()..]
                .find('\n')
                .map_or(output.len(), |i| found.end() + i);
            Some(InteractionMatch {
                signature: re.as_str().to_string(),
                excerpt: output[line_start..line_end].trim().to_string(),
            })
        })
    }
}
