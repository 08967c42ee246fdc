//! Named command templates with validated `{{param}}` substitution.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::config::PresetTemplate;

/// Values must be shell-inert unless a preset declares its own pattern.
pub const DEFAULT_PARAM_PATTERN: &str = r"^[A-Za-z0-9._/:@=,+-]+$";

const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresetError {
    #[error("unknown preset '{0}'")]
    Unknown(String),
    #[error("preset '{preset}' requires parameter '{param}'")]
    MissingParam { preset: String, param: String },
    #[error("preset '{preset}' has no parameter '{param}'")]
    UnexpectedParam { preset: String, param: String },
    #[error("value for '{param}' does not match {pattern}")]
    InvalidParam { param: String, pattern: String },
}

struct Compiled {
    template: PresetTemplate,
    patterns: BTreeMap<String, Regex>,
}

/// Summary shown by `listPresets`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetInfo {
    pub name: String,
    pub description: String,
    pub commands: Vec<String>,
    pub params: Vec<String>,
    pub required: Vec<String>,
}

pub struct PresetExpander {
    presets: BTreeMap<String, Compiled>,
    placeholder: Regex,
}

impl PresetExpander {
    /// Compile every template. Undeclared placeholders and bad patterns are load errors.
    pub fn new(templates: &[PresetTemplate]) -> anyhow::Result<Self> {
        let placeholder = Regex::new(PLACEHOLDER).context("placeholder pattern")?;
        let mut presets = BTreeMap::new();
        for template in templates {
            let mut patterns = BTreeMap::new();
            for param in &template.params {
                let source = match &param.pattern {
                    Some(p) if p.starts_with('^') && p.ends_with('$') => p.clone(),
                    Some(p) => format!("^(?:{p})$"),
                    None => DEFAULT_PARAM_PATTERN.to_string(),
                };
                let re = Regex::new(&source).with_context(|| {
                    format!("preset '{}' parameter '{}' pattern", template.name, param.name)
                })?;
                patterns.insert(param.name.clone(), re);
            }
            for command in &template.commands {
                for cap in placeholder.captures_iter(command) {
                    let name = &cap[1];
                    if !patterns.contains_key(name) {
                        bail!("preset '{}' uses undeclared placeholder '{{{{{name}}}}}'", template.name);
                    }
                }
            }
            if presets.contains_key(&template.name) {
                bail!("duplicate preset '{}'", template.name);
            }
            presets.insert(
                template.name.clone(),
                Compiled {
                    template: template.clone(),
                    patterns,
                },
            );
        }
        Ok(Self {
            presets,
            placeholder,
        })
    }

    pub fn list(&self) -> Vec<PresetInfo> {
        self.presets
            .values()
            .map(|c| PresetInfo {
                name: c.template.name.clone(),
                description: c.template.description.clone(),
                commands: c.template.commands.clone(),
                params: c.template.params.iter().map(|p| p.name.clone()).collect(),
                required: c
                    .template
                    .params
                    .iter()
                    .filter(|p| p.required && p.default.is_none())
                    .map(|p| p.name.clone())
                    .collect(),
            })
            .collect()
    }

    /// Substitute `params` into every command of `name`.
    pub fn expand(&self, name: &str, params: &BTreeMap<String, String>) -> Result<Vec<String>, PresetError> {
        let compiled = self
            .presets
            .get(name)
            .ok_or_else(|| PresetError::Unknown(name.to_string()))?;

        if let Some(extra) = params.keys().find(|k| !compiled.patterns.contains_key(*k)) {
            return Err(PresetError::UnexpectedParam {
                preset: name.to_string(),
                param: extra.clone(),
            });
        }

        let mut values = BTreeMap::new();
        for param in &compiled.template.params {
            let value = match params.get(&param.name).or(param.default.as_ref()) {
                Some(v) => v.clone(),
                None if param.required => {
                    return Err(PresetError::MissingParam {
                        preset: name.to_string(),
                        param: param.name.clone(),
                    })
                }
                None => String::new(),
            };
            let re = &compiled.patterns[&param.name];
            if !(value.is_empty() && !param.required) && !re.is_match(&value) {
                return Err(PresetError::InvalidParam {
                    param: param.name.clone(),
                    pattern: re.as_str().to_string(),
                });
            }
            values.insert(param.name.as_str(), value);
        }

        Ok(compiled
            .template
            .commands
            .iter()
            .map(|command| {
                let filled = self.placeholder.replace_all(command, |cap: &regex::Captures<'_>| {
                    values.get(&cap[1]).cloned().unwrap_or_default()
                });
                crate::policy::normalize_whitespace(&filled)
            })
            .collect())
    }
}
