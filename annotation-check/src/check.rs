use std::{fmt, path::Path, sync::Arc};

use annotation::{
    Annotation, AnnotationConfig, ModuleRegistry, Rule, RuleIndex, RuleKind, ScriptRuntime,
};
use anyhow::{bail, Context, Result};
use common::{error::LogError, FxHashSet};

/// Module ids from the config file and the command line.
#[derive(Debug, Default)]
pub struct ConfiguredModules {
    ids: FxHashSet<String>,
}

impl ConfiguredModules {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl ModuleRegistry for ConfiguredModules {
    fn is_configured(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Validate the annotation config at `path`.
///
/// Rule validation and script compilation are both run before giving up, so that every problem
/// is reported in a single pass.
pub fn check(path: &Path, modules: &[String]) -> Result<RuleTable> {
    let config = AnnotationConfig::read_from(path)?;
    let modules = ConfiguredModules::new(config.modules.iter().chain(modules).cloned());
    log::debug!("{} configured modules", modules.len());
    if modules.is_empty() {
        log::warn!("no modules configured, every annotation will be rejected");
    }

    let rules = config
        .rules(&modules)
        .context("Invalid annotation rules")
        .log_error();
    let runtime = ScriptRuntime::from_paths(&config.scripts)
        .context("Failed to load policy scripts")
        .log_error();

    let (rules, runtime) = match (rules, runtime) {
        (Some(rules), Some(runtime)) => (rules, runtime),
        _ => bail!("Annotation config {:?} is invalid", path),
    };

    let annotation = Annotation::new(rules, Box::new(runtime))?;
    log::info!(
        "{} annotation rules in {:?} are valid",
        annotation.rules().len(),
        path
    );

    Ok(RuleTable::new(annotation.rules()))
}

/// Armed rules, one line per rule in configuration order.
#[derive(Debug)]
pub struct RuleTable {
    rules: Vec<Arc<Rule>>,
}

impl RuleTable {
    pub fn new(rules: &RuleIndex) -> Self {
        Self {
            rules: rules.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Display for RuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            let kind = match rule.kind() {
                RuleKind::Call { param_count, .. } => format!("call({param_count})"),
                RuleKind::Instruction { .. } => "instruction".to_string(),
            };

            writeln!(
                f,
                "{} {} {:#x} {} {} {}",
                rule.name(),
                rule.module(),
                rule.address(),
                kind,
                rule.policy(),
                if rule.is_active() {
                    "active"
                } else {
                    "inactive"
                }
            )?;
        }

        Ok(())
    }
}
