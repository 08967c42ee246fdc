//! Command validation layers: blacklist, whitelist/graylist, security level, structural analysis.
//!
//! Every layer is a pure function over the command string that yields a [`Verdict`].
//! [`SecurityPipeline`] composes them in the fixed order a tier enables.

mod allowlist;
mod ast;
mod blacklist;
mod pipeline;
mod security_level;

pub use allowlist::{AllowlistValidator, ListKind, ParsedCommand, Redirect};
pub use ast::{AstAnalyzer, AstReport, Risk};
pub use blacklist::BlacklistFilter;
pub use pipeline::{Clearance, PipelineOutcome, PipelineReport, SecurityPipeline};
pub use security_level::{SecurityLevelReport, SecurityLevelValidator, SegmentLevel};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named bundle of enabled validator and executor layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Blacklist, special operators and audit only.
    Basic,
    /// Full validator pipeline, direct execution.
    #[default]
    Standard,
    /// Full pipeline plus sandboxed local execution.
    High,
    /// Like high, with container isolation required and confirmation escalated.
    Maximum,
}

impl Tier {
    /// Layers enabled for this tier, in execution order.
    pub fn layers(self) -> &'static [Layer] {
        match self {
            Tier::Basic => &[Layer::Blacklist, Layer::SpecialOperators, Layer::Audit],
            Tier::Standard => &[
                Layer::Blacklist,
                Layer::SpecialOperators,
                Layer::Whitelist,
                Layer::SecurityLevel,
                Layer::Ast,
                Layer::Audit,
            ],
            Tier::High | Tier::Maximum => &[
                Layer::Blacklist,
                Layer::SpecialOperators,
                Layer::Whitelist,
                Layer::SecurityLevel,
                Layer::Ast,
                Layer::Sandbox,
                Layer::Audit,
            ],
        }
    }

    /// Whether `layer` runs at this tier. Graylist rides on the whitelist slot.
    pub fn enables(self, layer: Layer) -> bool {
        let layer = match layer {
            Layer::Graylist => Layer::Whitelist,
            other => other,
        };
        self.layers().contains(&layer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Standard => "standard",
            Tier::High => "high",
            Tier::Maximum => "maximum",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Tier::Basic),
            "standard" => Ok(Tier::Standard),
            "high" => Ok(Tier::High),
            "maximum" | "max" => Ok(Tier::Maximum),
            other => Err(format!(
                "unknown security level '{other}' (expected basic, standard, high, maximum)"
            )),
        }
    }
}

/// Layer that produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Blacklist,
    SpecialOperators,
    Whitelist,
    Graylist,
    SecurityLevel,
    Ast,
    Authorization,
    Confirmation,
    Sandbox,
    Audit,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Blacklist => "blacklist",
            Layer::SpecialOperators => "special_operators",
            Layer::Whitelist => "whitelist",
            Layer::Graylist => "graylist",
            Layer::SecurityLevel => "security_level",
            Layer::Ast => "ast",
            Layer::Authorization => "authorization",
            Layer::Confirmation => "confirmation",
            Layer::Sandbox => "sandbox",
            Layer::Audit => "audit",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Risk level of a command, ordered for worst-case aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Read,
    Safe,
    Write,
    Danger,
    Unknown,
}

impl RiskLevel {
    /// Confirmation this level needs before execution.
    pub fn confirmation(self) -> Confirmation {
        match self {
            RiskLevel::Read | RiskLevel::Safe => Confirmation::None,
            RiskLevel::Write | RiskLevel::Unknown => Confirmation::Single,
            RiskLevel::Danger => Confirmation::Double,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Read => "read",
            RiskLevel::Safe => "safe",
            RiskLevel::Write => "write",
            RiskLevel::Danger => "danger",
            RiskLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much confirmation a command needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confirmation {
    #[default]
    None,
    Single,
    Double,
}

impl Confirmation {
    /// One notch stricter, saturating at double.
    pub fn escalate(self) -> Self {
        match self {
            Confirmation::None => Confirmation::Single,
            Confirmation::Single | Confirmation::Double => Confirmation::Double,
        }
    }
}

/// Result of one validation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub layer: Layer,
    pub passed: bool,
    pub reason: String,
    pub severity: Severity,
    /// Whether a verified authorization code may forgive this failure.
    #[serde(default)]
    pub overridable: bool,
    /// Rule or pattern that matched, for block reasons.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl Verdict {
    pub fn pass(layer: Layer, reason: impl Into<String>) -> Self {
        Self {
            layer,
            passed: true,
            reason: reason.into(),
            severity: Severity::Info,
            overridable: false,
            rule: None,
        }
    }

    pub fn block(layer: Layer, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            layer,
            passed: false,
            reason: reason.into(),
            severity,
            overridable: false,
            rule: None,
        }
    }

    /// Mark this failure as forgivable by the authorization escape.
    pub fn overridable(mut self) -> Self {
        self.overridable = !self.passed;
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }
}

// ── Shell lexing helpers ─────────────────────────────────────────

/// Skip leading environment variable assignments (e.g. `FOO=bar cmd args`).
pub(crate) fn skip_env_assignments(s: &str) -> &str {
    let mut rest = s.trim_start();
    loop {
        let Some(word) = rest.split_whitespace().next() else {
            return rest;
        };
        let is_assignment = word.contains('=')
            && word
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if is_assignment {
            rest = rest[word.len()..].trim_start();
        } else {
            return rest;
        }
    }
}

/// Detect a single `&` (background). `&&`, `>&`, `<&` and `&>` are not background.
pub(crate) fn contains_single_ampersand(s: &str) -> bool {
    let bytes = unquoted_mask(s);
    let raw = s.as_bytes();
    for (i, b) in raw.iter().enumerate() {
        if *b != b'&' || !bytes[i] {
            continue;
        }
        let prev = i.checked_sub(1).map(|p| raw[p]);
        let next = raw.get(i + 1).copied();
        let doubled = prev == Some(b'&') || next == Some(b'&');
        let redirect = matches!(prev, Some(b'>') | Some(b'<')) || next == Some(b'>');
        if !doubled && !redirect {
            return true;
        }
    }
    false
}

/// Per-byte flag: true where the byte sits outside single or double quotes.
pub(crate) fn unquoted_mask(s: &str) -> Vec<bool> {
    let mut mask = Vec::with_capacity(s.len());
    let mut single = false;
    let mut double = false;
    let mut escaped = false;
    for b in s.bytes() {
        if escaped {
            escaped = false;
            mask.push(false);
            continue;
        }
        match b {
            b'\\' if !single => {
                escaped = true;
                mask.push(false);
            }
            b'\'' if !double => {
                single = !single;
                mask.push(false);
            }
            b'"' if !single => {
                double = !double;
                mask.push(false);
            }
            _ => mask.push(!single && !double),
        }
    }
    mask
}

/// First character the shell would expand before the command sees its arguments: `$`
/// outside single quotes; globs `*`, `?`, `[`, brace lists and `~user` outside any quotes.
/// A trailing or space-followed `$` is literal.
pub(crate) fn shell_expansion(segment: &str) -> Option<char> {
    let mut single = false;
    let mut double = false;
    let mut escaped = false;
    let mut prev: Option<char> = None;
    let mut chars = segment.chars().peekable();
    while let Some(ch) = chars.next() {
        let token_start = prev.map_or(true, char::is_whitespace);
        prev = Some(ch);
        if escaped {
            escaped = false;
            continue;
        }
        let next = chars.peek().copied();
        let quoted = single || double;
        match ch {
            '\\' if !single => escaped = true,
            '\'' if !double => single = !single,
            '"' if !single => double = !double,
            '$' if !single && next.is_some_and(|c| !c.is_whitespace()) => return Some('$'),
            '*' | '?' | '[' if !quoted => return Some(ch),
            '{' if !quoted && next != Some('}') => return Some('{'),
            '~' if !quoted
                && token_start
                && next.is_some_and(|c| c != '/' && !c.is_whitespace()) =>
            {
                return Some('~')
            }
            _ => {}
        }
    }
    None
}

/// Split on unquoted single `|` (not `||`) into trimmed pipe segments.
pub(crate) fn split_pipeline(command: &str) -> Vec<String> {
    let mask = unquoted_mask(command);
    let raw = command.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'|' && mask[i] {
            if raw.get(i + 1) == Some(&b'|') {
                i += 2;
                continue;
            }
            segments.push(command[start..i].trim().to_string());
            start = i + 1;
        }
        i += 1;
    }
    segments.push(command[start..].trim().to_string());
    segments
}

/// Split on every unquoted command separator: `|`, `||`, `&&`, `&`, `;`, newline.
pub(crate) fn split_statements(command: &str) -> Vec<String> {
    let mask = unquoted_mask(command);
    let mut out = Vec::new();
    let mut current = String::new();
    for (i, ch) in command.char_indices() {
        let separator = mask.get(i).copied().unwrap_or(false)
            && matches!(ch, '|' | '&' | ';' | '\n');
        if separator {
            let piece = current.trim();
            if !piece.is_empty() {
                out.push(piece.to_string());
            }
            current.clear();
        } else {
            current.push(ch);
        }
    }
    let piece = current.trim();
    if !piece.is_empty() {
        out.push(piece.to_string());
    }
    out
}

/// Whitespace tokenizer that keeps quoted runs together and strips the quotes.
pub(crate) fn tokenize(segment: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut single = false;
    let mut double = false;
    let mut escaped = false;
    for ch in segment.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !single => {
                escaped = true;
                in_token = true;
            }
            '\'' if !double => {
                single = !single;
                in_token = true;
            }
            '"' if !single => {
                double = !double;
                in_token = true;
            }
            c if c.is_whitespace() && !single && !double => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Base command name of a segment: first word after env assignments, without its directory.
pub(crate) fn base_command(segment: &str) -> String {
    skip_env_assignments(segment)
        .split_whitespace()
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Collapse runs of whitespace into single spaces.
pub(crate) fn normalize_whitespace(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}
