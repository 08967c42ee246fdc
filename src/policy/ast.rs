//! Structural analysis for obfuscation and injection patterns.
//!
//! Runs last in the validator chain and again after an authorization override, so nothing
//! it reports can be forgiven.

use super::{split_pipeline, Layer, Severity, Verdict};
use crate::config::AstConfig;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Risk {
    pub pattern: String,
    pub severity: Severity,
    pub description: String,
}

/// All findings for a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstReport {
    pub passed: bool,
    pub risks: Vec<Risk>,
    pub nesting_depth: usize,
    pub pipe_count: usize,
    pub verdict: Verdict,
}

impl AstReport {
    pub fn worst(&self) -> Option<Severity> {
        self.risks.iter().map(|r| r.severity).max()
    }
}

const RULES: &[(&str, &str, Severity, &str)] = &[
    ("command_substitution", r"\$\(", Severity::Critical, "command substitution"),
    ("backtick", r"`", Severity::Critical, "backtick command substitution"),
    ("path_traversal", r"(^|[\s=/'])\.\.(/|\s|$)", Severity::High, "parent-directory traversal"),
    ("sensitive_file", r"/etc/(shadow|gshadow|sudoers)\b", Severity::Critical, "access to credential files"),
    ("base64_to_shell", r"base64\s+(-d|--decode|-D)\b.*\|\s*(sudo\s+)?(ba|z|da|k)?sh\b", Severity::Critical, "decoded payload piped to a shell"),
    ("hex_escape", r"\\x[0-9a-fA-F]{2}", Severity::High, "hex-escaped characters"),
    ("octal_escape", r"\\[0-7]{3}", Severity::High, "octal-escaped characters"),
    ("ansi_c_quote", r"\$'[^']*\\", Severity::High, "ANSI-C quoted escape sequence"),
    ("dev_tcp", r"/dev/(tcp|udp)/", Severity::Critical, "network socket via /dev/tcp"),
    ("pipe_to_netcat", r"\|\s*(nc|ncat|netcat|socat)\b", Severity::Critical, "output piped to a network tool"),
    ("download_to_shell", r"\b(curl|wget)\b.*\|\s*(sudo\s+)?(ba|z|da|k)?sh\b", Severity::Critical, "downloaded script piped to a shell"),
    ("data_upload", r"\bcurl\b.*\s(-d|--data(-binary|-raw|-urlencode)?|-F|--form|-T|--upload-file)(\s|=|$)", Severity::Critical, "data upload"),
    ("privilege_escalation", r"(^|[;&|(]\s*)(sudo|doas|pkexec|su)\b", Severity::High, "privilege escalation"),
    ("root_shell", r"\bsudo\s+(-[a-zA-Z]*[si]\b|su\b|(ba|z|da|k)?sh\b)", Severity::Critical, "interactive root shell"),
    ("setuid_chmod", r"\bchmod\s+(-[a-zA-Z]+\s+)*([ugoa]*\+[rwx]*s|[2467][0-7]{3})\b", Severity::Critical, "setuid or setgid bit"),
    ("fd_abuse", r"\bexec\s+\d*\s*[<>]|\d<>|<>\s*/dev/", Severity::Critical, "file descriptor manipulation"),
    ("env_hijack", r"(^|[\s;&|])(LD_PRELOAD|LD_LIBRARY_PATH|LD_AUDIT|IFS|BASH_ENV|ENV|PROMPT_COMMAND)=", Severity::Critical, "dynamic loader or shell environment hijack"),
    ("path_override", r"(^|[\s;&|])PATH=", Severity::High, "PATH override"),
    ("eval", r"(^|[\s;&|])eval\b", Severity::High, "eval of constructed input"),
];

/// Regex-based analyzer with structural thresholds.
#[derive(Debug, Clone)]
pub struct AstAnalyzer {
    rules: Vec<(Regex, Risk)>,
    max_nesting_depth: usize,
    max_pipes: usize,
}

impl AstAnalyzer {
    pub fn new(config: &AstConfig) -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|(name, pattern, severity, description)| {
                let re = Regex::new(pattern)
                    .with_context(|| format!("invalid analyzer pattern {name}"))?;
                Ok((
                    re,
                    Risk {
                        pattern: (*name).to_string(),
                        severity: *severity,
                        description: (*description).to_string(),
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            max_nesting_depth: config.max_nesting_depth,
            max_pipes: config.max_pipes,
        })
    }

    /// Analyze a command. Only critical findings fail it; the rest are reported.
    pub fn analyze(&self, command: &str) -> AstReport {
        let mut risks: Vec<Risk> = self
            .rules
            .iter()
            .filter(|(re, _)| re.is_match(command))
            .map(|(_, risk)| risk.clone())
            .collect();

        let nesting_depth = nesting_depth(command);
        if nesting_depth > self.max_nesting_depth {
            risks.push(Risk {
                pattern: "nesting_depth".into(),
                severity: Severity::Critical,
                description: format!(
                    "nesting depth {nesting_depth} exceeds {}",
                    self.max_nesting_depth
                ),
            });
        }

        let pipe_count = split_pipeline(command).len().saturating_sub(1);
        if pipe_count > self.max_pipes {
            risks.push(Risk {
                pattern: "pipe_count".into(),
                severity: Severity::Critical,
                description: format!("{pipe_count} pipes exceed {}", self.max_pipes),
            });
        }

        let blocking: Vec<&Risk> = risks
            .iter()
            .filter(|r| r.severity == Severity::Critical)
            .collect();
        let verdict = match blocking.iter().max_by_key(|r| r.severity) {
            Some(worst) => Verdict::block(
                Layer::Ast,
                worst.severity,
                format!(
                    "structural analysis found: {}",
                    blocking
                        .iter()
                        .map(|r| r.description.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
            .with_rule(worst.pattern.clone()),
            None => Verdict::pass(Layer::Ast, "no structural risks"),
        };

        AstReport {
            passed: verdict.passed,
            risks,
            nesting_depth,
            pipe_count,
            verdict,
        }
    }
}

/// Deepest bracket nesting of `(`, `{` and `[`.
fn nesting_depth(command: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for ch in command.chars() {
        match ch {
            '(' | '{' | '[' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' | '}' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}
