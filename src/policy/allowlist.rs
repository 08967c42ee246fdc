//! Whitelist and graylist validators.
//!
//! Both share the same structural checks (flag prefixes, path rules, pipe chains); a graylist
//! hit additionally carries a risk tag that demands an authorization code before execution.

use super::{
    shell_expansion, skip_env_assignments, split_pipeline, tokenize, Confirmation, Layer,
    RiskLevel, Severity, Verdict,
};
use crate::config::{CommandRule, CommandTable, PathRule, PipeConfig};
use serde::{Deserialize, Serialize};

/// Which table a validator enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Whitelist,
    Graylist,
}

/// Output redirection found in a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub operator: String,
    pub target: String,
}

impl Redirect {
    /// Descriptor duplication (`2>&1`, `>&-`) does not touch the filesystem.
    pub fn is_fd_duplication(&self) -> bool {
        self.operator.ends_with('&')
            && (self.target == "-" || self.target.chars().all(|c| c.is_ascii_digit()))
    }

    /// Whether the redirect writes to its target.
    pub fn is_output(&self) -> bool {
        self.operator.contains('>')
    }
}

/// One pipe segment broken into its parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub name: String,
    /// Every argument after the name, excluding redirections.
    pub args: Vec<String>,
    pub flags: Vec<String>,
    pub paths: Vec<String>,
    pub redirects: Vec<Redirect>,
}

const REDIRECT_OPERATORS: &[&str] = &["&>>", "&>", ">>", ">|", ">&", "<&", ">", "<"];

fn split_redirect(token: &str) -> Option<(String, String)> {
    let digits = token.chars().take_while(|c| c.is_ascii_digit()).count();
    let rest = &token[digits..];
    REDIRECT_OPERATORS
        .iter()
        .find(|op| rest.starts_with(**op))
        .map(|op| (format!("{}{}", &token[..digits], op), rest[op.len()..].to_string()))
}

fn looks_like_path(token: &str) -> bool {
    token.starts_with('/') || token.starts_with('~') || token.starts_with('.') || token.contains('/')
}

fn looks_like_flag(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-')
}

/// True when `path` equals `prefix` or lies beneath it.
pub(crate) fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub(crate) fn has_parent_traversal(path: &str) -> bool {
    path.split('/').any(|c| c == "..") || path.to_ascii_lowercase().contains("%2e%2e")
}

/// Path-shaped pieces of an argument: the token itself, the tail from its first `/` or `~`,
/// and the value of a `key=value` option.
fn path_candidates(token: &str) -> Vec<&str> {
    let mut out = vec![token];
    if let Some(idx) = token.find(['/', '~']) {
        out.push(&token[idx..]);
    }
    if let Some((_, value)) = token.split_once('=') {
        out.push(value);
    }
    out
}

/// Whitelist or graylist validator over a typed command table.
#[derive(Debug, Clone)]
pub struct AllowlistValidator {
    kind: ListKind,
    table: CommandTable,
    pipes: PipeConfig,
    sensitive_paths: Vec<String>,
}

impl AllowlistValidator {
    pub fn whitelist(table: CommandTable, pipes: PipeConfig) -> Self {
        Self {
            kind: ListKind::Whitelist,
            table,
            pipes,
            sensitive_paths: Vec::new(),
        }
    }

    pub fn graylist(table: CommandTable, pipes: PipeConfig) -> Self {
        Self {
            kind: ListKind::Graylist,
            table,
            pipes,
            sensitive_paths: Vec::new(),
        }
    }

    /// Paths no segment may touch, listed or not.
    pub fn with_sensitive_paths(mut self, paths: Vec<String>) -> Self {
        self.sensitive_paths = paths;
        self
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn layer(&self) -> Layer {
        match self.kind {
            ListKind::Whitelist => Layer::Whitelist,
            ListKind::Graylist => Layer::Graylist,
        }
    }

    fn label(&self) -> &'static str {
        self.layer().as_str()
    }

    /// Whether the table lists `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.table.contains(name)
    }

    /// Split one segment into name, flags, paths and redirections.
    pub fn parse_command(segment: &str) -> ParsedCommand {
        let tokens = tokenize(skip_env_assignments(segment));
        let mut iter = tokens.into_iter();
        let Some(first) = iter.next() else {
            return ParsedCommand::default();
        };
        let mut parsed = ParsedCommand {
            name: first.rsplit('/').next().unwrap_or("").to_string(),
            ..ParsedCommand::default()
        };

        while let Some(token) = iter.next() {
            if let Some((operator, attached)) = split_redirect(&token) {
                let target = if attached.is_empty() {
                    iter.next().unwrap_or_default()
                } else {
                    attached
                };
                parsed.redirects.push(Redirect { operator, target });
                continue;
            }
            if looks_like_flag(&token) {
                parsed.flags.push(token.clone());
            } else if looks_like_path(&token) {
                parsed.paths.push(token.clone());
            }
            parsed.args.push(token);
        }
        parsed
    }

    /// Validate a single command or a pipe chain.
    pub fn validate(&self, command: &str) -> Verdict {
        let segments = split_pipeline(command);
        let layer = self.layer();

        if segments.len() > self.pipes.max_depth {
            return Verdict::block(
                layer,
                Severity::High,
                format!(
                    "pipe depth {} exceeds maximum {}",
                    segments.len(),
                    self.pipes.max_depth
                ),
            )
            .with_rule("pipes.max_depth");
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Verdict::block(layer, Severity::High, "empty pipe segment");
        }

        let parsed: Vec<ParsedCommand> = segments.iter().map(|s| Self::parse_command(s)).collect();

        for (segment, p) in segments.iter().zip(&parsed) {
            if let Some(verdict) = self.check_structure(segment, p) {
                return verdict;
            }
        }

        if segments.len() > 1 {
            if let Some(p) = parsed
                .iter()
                .find(|p| self.pipes.forbidden_commands.iter().any(|f| *f == p.name))
            {
                return Verdict::block(
                    layer,
                    Severity::Critical,
                    format!("'{}' is forbidden inside a pipe chain", p.name),
                )
                .with_rule(format!("pipes.forbidden_commands: {}", p.name));
            }
        }

        let first = self.validate_single(&parsed[0]);
        if !first.passed {
            return first;
        }

        for later in &parsed[1..] {
            if !self.pipes.allowed_commands.iter().any(|a| *a == later.name) {
                return Verdict::block(
                    layer,
                    Severity::Medium,
                    format!("'{}' is not an allowed pipe command", later.name),
                )
                .with_rule("pipes.allowed_commands")
                .overridable();
            }
        }

        if segments.len() > 1 {
            Verdict::pass(
                layer,
                format!("pipe chain of {} segments allowed", segments.len()),
            )
        } else {
            first
        }
    }

    fn validate_single(&self, parsed: &ParsedCommand) -> Verdict {
        let layer = self.layer();
        if parsed.name.is_empty() {
            return Verdict::block(layer, Severity::Medium, "empty command");
        }
        let Some(rule) = self.table.get(&parsed.name) else {
            return Verdict::block(
                layer,
                Severity::Medium,
                format!("command '{}' is not in the {}", parsed.name, self.label()),
            )
            .with_rule(parsed.name.clone())
            .overridable();
        };

        if let Some(flag) = parsed.flags.iter().find(|f| !flag_allowed(rule, f)) {
            return Verdict::block(
                layer,
                Severity::Medium,
                format!("flag '{flag}' is not allowed for '{}'", parsed.name),
            )
            .with_rule(format!("{}.allowed_flags", parsed.name))
            .overridable();
        }

        let redirect_targets = parsed
            .redirects
            .iter()
            .filter(|r| !r.is_fd_duplication())
            .map(|r| &r.target);
        for path in parsed.paths.iter().chain(redirect_targets) {
            if let Some(verdict) = self.check_path(&parsed.name, &rule.paths, path) {
                return verdict;
            }
        }

        match (self.kind, rule.risk) {
            (ListKind::Graylist, risk) => {
                let risk = risk.unwrap_or(RiskLevel::Write);
                Verdict::pass(
                    layer,
                    format!(
                        "'{}' is graylisted ({risk}); authorization required",
                        parsed.name
                    ),
                )
                .with_rule(parsed.name.clone())
            }
            (ListKind::Whitelist, _) => {
                Verdict::pass(layer, format!("'{}' is whitelisted", parsed.name))
            }
        }
    }

    /// Checks no authorization code can waive: shell expansion, parent traversal and denied
    /// paths. Runs for every segment whether or not its command is listed.
    fn check_structure(&self, segment: &str, parsed: &ParsedCommand) -> Option<Verdict> {
        let layer = self.layer();
        if let Some(ch) = shell_expansion(segment) {
            return Some(
                Verdict::block(
                    layer,
                    Severity::High,
                    format!("unquoted shell expansion '{ch}' in '{}'", parsed.name),
                )
                .with_rule("paths.no_expansion"),
            );
        }

        let targets: Vec<&String> = parsed
            .redirects
            .iter()
            .filter(|r| !r.is_fd_duplication())
            .map(|r| &r.target)
            .collect();
        if let Some(p) = parsed
            .paths
            .iter()
            .chain(targets.iter().copied())
            .find(|p| has_parent_traversal(p))
        {
            return Some(
                Verdict::block(
                    layer,
                    Severity::High,
                    format!("path '{p}' contains a parent-directory traversal"),
                )
                .with_rule("paths.no_traversal"),
            );
        }

        let listed = self.table.get(&parsed.name).map(|r| r.paths.deny.as_slice());
        let deny = listed.unwrap_or_default().iter().chain(&self.sensitive_paths);
        for denied in deny {
            let hit = parsed
                .args
                .iter()
                .chain(targets.iter().copied())
                .find(|arg| {
                    path_candidates(arg)
                        .into_iter()
                        .any(|c| path_has_prefix(c, denied))
                });
            if let Some(arg) = hit {
                return Some(
                    Verdict::block(
                        layer,
                        Severity::High,
                        format!("path '{arg}' is denied for '{}'", parsed.name),
                    )
                    .with_rule(format!("{}.paths.deny: {denied}", parsed.name)),
                );
            }
        }
        None
    }

    fn check_path(&self, name: &str, rule: &PathRule, path: &str) -> Option<Verdict> {
        if !rule.allow.is_empty() && !rule.allow.iter().any(|a| path_has_prefix(path, a)) {
            return Some(
                Verdict::block(
                    self.layer(),
                    Severity::Medium,
                    format!("path '{path}' is outside the allowed paths for '{name}'"),
                )
                .with_rule(format!("{name}.paths.allow"))
                .overridable(),
            );
        }
        None
    }

    /// Risk tag of the chain's first command when it is graylisted.
    pub fn risk_tag(&self, command: &str) -> Option<RiskLevel> {
        if self.kind != ListKind::Graylist {
            return None;
        }
        let first = split_pipeline(command).into_iter().next()?;
        let parsed = Self::parse_command(&first);
        self.table
            .get(&parsed.name)
            .map(|r| r.risk.unwrap_or(RiskLevel::Write))
    }

    /// Confirmation a graylist hit demands (none for whitelist entries).
    pub fn required_confirmation(&self, command: &str) -> Confirmation {
        match self.risk_tag(command) {
            Some(RiskLevel::Danger) | Some(RiskLevel::Unknown) => Confirmation::Double,
            Some(_) => Confirmation::Single,
            None => Confirmation::None,
        }
    }
}

fn flag_allowed(rule: &CommandRule, flag: &str) -> bool {
    rule.allowed_flags
        .iter()
        .any(|p| p == "*" || flag.starts_with(p.as_str()))
}
