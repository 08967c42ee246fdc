//! Risk classification, pipe transitions, redirect permissions and special operators.

use super::allowlist::{path_has_prefix, Redirect};
use super::{
    contains_single_ampersand, split_pipeline, tokenize, unquoted_mask, AllowlistValidator,
    Confirmation, Layer, RiskLevel, Severity, Verdict,
};
use crate::config::SecurityLevelConfig;
use serde::{Deserialize, Serialize};

/// Classified pipe segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLevel {
    pub command: String,
    pub level: RiskLevel,
    /// Table prefix that decided the level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
}

/// Outcome of classifying a whole command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLevelReport {
    pub passed: bool,
    /// Worst level across segments.
    pub highest: RiskLevel,
    pub require_confirm: Confirmation,
    pub segments: Vec<SegmentLevel>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone)]
struct Prefix {
    words: Vec<String>,
    level: RiskLevel,
}

/// Classifies commands against the read/safe/write/danger tables.
#[derive(Debug, Clone)]
pub struct SecurityLevelValidator {
    prefixes: Vec<Prefix>,
    config: SecurityLevelConfig,
}

impl SecurityLevelValidator {
    pub fn new(config: &SecurityLevelConfig) -> Self {
        let tables = [
            (RiskLevel::Read, &config.read),
            (RiskLevel::Safe, &config.safe),
            (RiskLevel::Write, &config.write),
            (RiskLevel::Danger, &config.danger),
        ];
        let prefixes = tables
            .into_iter()
            .flat_map(|(level, entries)| {
                entries.iter().map(move |e| Prefix {
                    words: e.split_whitespace().map(String::from).collect(),
                    level,
                })
            })
            .filter(|p| !p.words.is_empty())
            .collect();
        Self {
            prefixes,
            config: config.clone(),
        }
    }

    /// Reject `;`, `&`, `&&`, `||` and subshells unless the operator rules allow them.
    /// Failures here are never overridable.
    pub fn check_operators(&self, command: &str) -> Verdict {
        let rules = &self.config.operators;
        let block = |what: &str| {
            Verdict::block(
                Layer::SpecialOperators,
                Severity::Critical,
                format!("{what} is not permitted"),
            )
            .with_rule(what.to_string())
        };

        if !rules.allow_subshell && has_substitution(command) {
            return block("command substitution or subshell");
        }

        let mask = unquoted_mask(command);
        let raw = command.as_bytes();
        let unquoted = |i: usize| mask.get(i).copied().unwrap_or(false);
        for (i, b) in raw.iter().enumerate() {
            if !unquoted(i) {
                continue;
            }
            let next = raw.get(i + 1).copied();
            match b {
                b';' | b'\n' if !rules.allow_semicolon => return block("command separator ';'"),
                b'&' if next == Some(b'&') && !rules.allow_chaining => {
                    return block("command chaining '&&'")
                }
                b'|' if next == Some(b'|') && !rules.allow_chaining => {
                    return block("command chaining '||'")
                }
                b'(' | b')' if !rules.allow_subshell => return block("command substitution or subshell"),
                _ => {}
            }
        }

        if !rules.allow_background && contains_single_ampersand(command) {
            return block("background operator '&'");
        }

        Verdict::pass(Layer::SpecialOperators, "no special operators")
    }

    /// Classify one pipe segment by longest matching prefix after alias resolution.
    pub fn classify(&self, segment: &str) -> SegmentLevel {
        let words = self.resolve_words(segment);
        let best = self
            .prefixes
            .iter()
            .filter(|p| words.len() >= p.words.len() && words[..p.words.len()] == p.words[..])
            .max_by_key(|p| (p.words.len(), p.level));
        SegmentLevel {
            command: segment.to_string(),
            level: best.map_or(RiskLevel::Unknown, |p| p.level),
            matched: best.map(|p| p.words.join(" ")),
        }
    }

    fn resolve_words(&self, segment: &str) -> Vec<String> {
        let parsed = AllowlistValidator::parse_command(segment);
        if parsed.name.is_empty() {
            return Vec::new();
        }
        let mut words: Vec<String> = match self.config.aliases.get(&parsed.name) {
            Some(expansion) => tokenize(expansion),
            None => vec![parsed.name.clone()],
        };
        words.extend(parsed.args);
        words
    }

    /// Worst level across the chain, without judging it.
    pub fn highest(&self, command: &str) -> RiskLevel {
        split_pipeline(command)
            .iter()
            .map(|s| self.classify(s).level)
            .max()
            .unwrap_or(RiskLevel::Unknown)
    }

    /// Classify every segment and check transitions and redirects.
    pub fn validate(&self, command: &str) -> SecurityLevelReport {
        let segments: Vec<SegmentLevel> = split_pipeline(command)
            .iter()
            .map(|s| self.classify(s))
            .collect();
        let highest = segments
            .iter()
            .map(|s| s.level)
            .max()
            .unwrap_or(RiskLevel::Unknown);
        let verdict = self.judge(&segments);
        SecurityLevelReport {
            passed: verdict.passed,
            highest,
            require_confirm: highest.confirmation(),
            segments,
            verdict,
        }
    }

    fn judge(&self, segments: &[SegmentLevel]) -> Verdict {
        let redirects: Vec<(&SegmentLevel, Redirect)> = segments
            .iter()
            .flat_map(|segment| {
                AllowlistValidator::parse_command(&segment.command)
                    .redirects
                    .into_iter()
                    .filter(|r| r.is_output() && !r.is_fd_duplication() && r.target != "/dev/null")
                    .map(move |r| (segment, r))
            })
            .collect();

        // Denied targets block before anything an authorization code could forgive.
        for (_, redirect) in &redirects {
            if let Some(verdict) = self.check_redirect_target(redirect) {
                return verdict;
            }
        }

        if let Some(unknown) = segments.iter().find(|s| s.level == RiskLevel::Unknown) {
            return Verdict::block(
                Layer::SecurityLevel,
                Severity::Medium,
                format!("command '{}' has no known risk level", unknown.command),
            )
            .overridable();
        }

        for pair in segments.windows(2) {
            let transition = format!("{}->{}", pair[0].level, pair[1].level);
            if !self.config.pipe_transitions.iter().any(|t| *t == transition) {
                return Verdict::block(
                    Layer::SecurityLevel,
                    Severity::High,
                    format!("pipe transition {transition} is not allowed"),
                )
                .with_rule(transition)
                .overridable();
            }
        }

        let rule = &self.config.redirect;
        if let Some((segment, _)) = redirects
            .iter()
            .find(|(segment, _)| !rule.allowed_levels.contains(&segment.level))
        {
            return Verdict::block(
                Layer::SecurityLevel,
                Severity::Medium,
                format!(
                    "redirect is not allowed for {}-level command '{}'",
                    segment.level, segment.command
                ),
            )
            .with_rule("redirect.allowed_levels")
            .overridable();
        }

        let highest = segments
            .iter()
            .map(|s| s.level)
            .max()
            .unwrap_or(RiskLevel::Unknown);
        Verdict::pass(Layer::SecurityLevel, format!("risk level {highest}"))
    }

    fn check_redirect_target(&self, redirect: &Redirect) -> Option<Verdict> {
        self.config
            .redirect
            .denied_paths
            .iter()
            .find(|d| path_has_prefix(&redirect.target, d))
            .map(|denied| {
                Verdict::block(
                    Layer::SecurityLevel,
                    Severity::High,
                    format!("redirect to '{}' is denied", redirect.target),
                )
                .with_rule(format!("redirect.denied_paths: {denied}"))
            })
    }
}

/// `$(`, backticks, `<(` or `>(` outside single quotes. Double quotes do not stop substitution.
fn has_substitution(command: &str) -> bool {
    let raw = command.as_bytes();
    let mut single = false;
    let mut escaped = false;
    for (i, b) in raw.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if !single => escaped = true,
            b'\'' => single = !single,
            b'`' if !single => return true,
            b'(' if !single && i > 0 && matches!(raw[i - 1], b'$' | b'<' | b'>') => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorRules;

    fn validator() -> SecurityLevelValidator {
        SecurityLevelValidator::new(&SecurityLevelConfig::default())
    }

    #[test]
    fn longest_prefix_wins() {
        let v = validator();
        assert_eq!(v.classify("systemctl status nginx").level, RiskLevel::Read);
        assert_eq!(v.classify("systemctl restart nginx").level, RiskLevel::Write);
        assert_eq!(v.classify("systemctl disable nginx").level, RiskLevel::Danger);
        assert_eq!(
            v.classify("systemctl restart nginx").matched.as_deref(),
            Some("systemctl restart")
        );
    }

    #[test]
    fn aliases_and_absolute_paths_resolve() {
        let v = validator();
        assert_eq!(v.classify("ll /var/log").level, RiskLevel::Read);
        assert_eq!(v.classify("/bin/ls -la").level, RiskLevel::Read);
    }

    #[test]
    fn unlisted_command_is_unknown_and_overridable() {
        let report = validator().validate("nmap localhost");
        assert!(!report.passed);
        assert_eq!(report.highest, RiskLevel::Unknown);
        assert!(report.verdict.overridable);
    }

    #[test]
    fn write_command_requires_single_confirmation() {
        let report = validator().validate("systemctl restart nginx");
        assert!(report.passed);
        assert_eq!(report.highest, RiskLevel::Write);
        assert_eq!(report.require_confirm, Confirmation::Single);
    }

    #[test]
    fn read_pipe_chain_passes() {
        let report = validator().validate("ps aux | grep nginx");
        assert!(report.passed, "{:?}", report.verdict);
        assert_eq!(report.segments.len(), 2);
        assert_eq!(report.highest, RiskLevel::Read);
        assert_eq!(report.require_confirm, Confirmation::None);
    }

    #[test]
    fn escalating_pipe_transition_blocks() {
        let report = validator().validate("ls /tmp | rm -f");
        assert!(!report.passed);
        assert!(report.verdict.reason.contains("read->danger"));
    }

    #[test]
    fn redirect_rules() {
        let v = validator();
        assert!(v.validate("echo hello > /tmp/out.txt").passed);
        assert!(v.validate("ls /nope 2>/dev/null").passed);

        let denied = v.validate("echo x > /etc/passwd");
        assert!(!denied.passed);
        assert!(!denied.verdict.overridable);

        let by_level = v.validate("cp /tmp/a /tmp/b > /tmp/log");
        assert!(!by_level.passed);
        assert!(by_level.verdict.overridable);
    }

    #[test]
    fn denied_redirect_outranks_unknown_command() {
        let v = validator();
        let report = v.validate("nmap localhost > /etc/passwd");
        assert!(!report.passed);
        assert!(!report.verdict.overridable);
        assert!(report.verdict.reason.contains("/etc/passwd"));

        let report = v.validate("ls /tmp | tee /tmp/x > /etc/cron.d/job");
        assert!(!report.verdict.overridable);
    }

    #[test]
    fn highest_matches_full_validation() {
        let v = validator();
        for cmd in ["ls -la", "systemctl restart nginx", "ps aux | grep nginx", "nmap localhost"] {
            assert_eq!(v.highest(cmd), v.validate(cmd).highest, "{cmd}");
        }
    }

    #[test]
    fn special_operators_block_by_default() {
        let v = validator();
        for cmd in [
            "ls; whoami",
            "sleep 10 &",
            "ls && rm -f x",
            "false || reboot",
            "echo $(id)",
            "echo \"`id`\"",
            "diff <(ls a) <(ls b)",
            "(cd /tmp && ls)",
        ] {
            let verdict = v.check_operators(cmd);
            assert!(!verdict.passed, "{cmd} should be rejected");
            assert_eq!(verdict.layer, Layer::SpecialOperators);
            assert!(!verdict.overridable);
        }
    }

    #[test]
    fn quoted_operators_are_inert() {
        let v = validator();
        assert!(v.check_operators("grep 'a;b' /tmp/x").passed);
        assert!(v.check_operators("echo '$(id)'").passed);
        assert!(v.check_operators("make 2>&1").passed);
        assert!(v.check_operators("ps aux | grep nginx").passed);
    }

    #[test]
    fn operator_rules_can_enable_chaining() {
        let config = SecurityLevelConfig {
            operators: OperatorRules {
                allow_chaining: true,
                ..OperatorRules::default()
            },
            ..SecurityLevelConfig::default()
        };
        let v = SecurityLevelValidator::new(&config);
        assert!(v.check_operators("ls && pwd").passed);
        assert!(!v.check_operators("ls; pwd").passed);
    }
}
