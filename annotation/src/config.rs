use std::{
    error, fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use common::config::annotation::{
    KEY_ACTIVE, KEY_ADDRESS, KEY_CALL_ANNOTATION, KEY_INSTRUCTION_ANNOTATION, KEY_MODULE,
    KEY_PARAM_COUNT, SECTION,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::{
    host::{Address, ModuleRegistry},
    rule::{Rule, RuleIndex, RuleKind},
};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AnnotationConfig {
    /// module ids known to the module tracker (used when no platform is attached)
    #[serde(default)]
    pub modules: Vec<String>,
    /// policy scripts, in lookup order
    #[serde(default)]
    pub scripts: Vec<PathBuf>,
    /// one named entry per rule, kept raw so validation can report every error
    #[serde(default)]
    pub annotation: Mapping,
}

impl AnnotationConfig {
    pub fn read_from(path: &Path) -> Result<Self> {
        let content = fs::read(path)
            .with_context(|| format!("Failed to read annotation config file {path:?}"))?;
        let mut config: Self = serde_yaml::from_slice(&content)
            .with_context(|| format!("Failed to parse annotation config file {path:?}"))?;

        // scripts are relative to the config file
        if let Some(base) = path.parent() {
            for script in &mut config.scripts {
                if script.is_relative() {
                    *script = base.join(&*script);
                }
            }
        }

        Ok(config)
    }

    pub fn rules(&self, registry: &dyn ModuleRegistry) -> Result<RuleIndex, ValidationErrors> {
        load_rules(&self.annotation, registry)
    }
}

/// Validate every entry of the annotation section and build the rule index.
///
/// All entries are checked and every error is collected; a single invalid entry rejects the
/// whole rule set.
pub fn load_rules(
    section: &Mapping,
    registry: &dyn ModuleRegistry,
) -> Result<RuleIndex, ValidationErrors> {
    let mut rules = Vec::with_capacity(section.len());
    let mut errors = vec![];

    for (key, entry) in section.iter() {
        let name = match key {
            Value::String(name) => name.clone(),
            key => format!("{key:?}"),
        };
        log::debug!("Scanning section {}.{}", SECTION, name);

        match parse_entry(&name, entry, registry) {
            Ok(rule) => rules.push(rule),
            Err(entry_errors) => errors.extend(entry_errors),
        }
    }

    if !errors.is_empty() {
        for error in &errors {
            log::error!("{}", error);
        }
        log::error!("Errors while scanning the {} sections", SECTION);

        return Err(ValidationErrors(errors));
    }

    log::debug!("loaded {} annotation rules", rules.len());
    Ok(RuleIndex::new(rules))
}

fn parse_entry(
    name: &str,
    entry: &Value,
    registry: &dyn ModuleRegistry,
) -> Result<Rule, Vec<ValidationError>> {
    let entry = match entry {
        Value::Mapping(entry) => entry,
        _ => {
            return Err(vec![ValidationError::new(
                name,
                ValidationErrorKind::NotAMapping,
            )])
        }
    };

    let mut errors = vec![];
    let mut error = |kind| errors.push(ValidationError::new(name, kind));

    let active = match field(entry, KEY_ACTIVE) {
        Some(Value::Bool(active)) => Some(*active),
        Some(_) => {
            error(ValidationErrorKind::InvalidType {
                key: KEY_ACTIVE,
                expected: "a boolean",
            });
            None
        }
        None => {
            error(ValidationErrorKind::Missing(KEY_ACTIVE));
            None
        }
    };

    let module = match field(entry, KEY_MODULE) {
        Some(Value::String(module)) if registry.is_configured(module) => Some(module.clone()),
        Some(Value::String(module)) => {
            error(ValidationErrorKind::UnknownModule(module.clone()));
            None
        }
        Some(_) => {
            error(ValidationErrorKind::InvalidType {
                key: KEY_MODULE,
                expected: "a string",
            });
            None
        }
        None => {
            error(ValidationErrorKind::Missing(KEY_MODULE));
            None
        }
    };

    let address = match field(entry, KEY_ADDRESS) {
        Some(value) => match value.as_u64() {
            Some(address) => Some(address as Address),
            None => {
                error(ValidationErrorKind::InvalidType {
                    key: KEY_ADDRESS,
                    expected: "a non-negative integer",
                });
                None
            }
        },
        None => {
            error(ValidationErrorKind::Missing(KEY_ADDRESS));
            None
        }
    };

    let call = policy_name(entry, KEY_CALL_ANNOTATION, &mut error);
    let instruction = policy_name(entry, KEY_INSTRUCTION_ANNOTATION, &mut error);
    let kind = match (call, instruction) {
        (Some(policy), None) => match field(entry, KEY_PARAM_COUNT) {
            Some(value) => match value.as_u64().and_then(|count| u32::try_from(count).ok()) {
                Some(param_count) => Some(RuleKind::Call {
                    policy,
                    param_count,
                }),
                None => {
                    error(ValidationErrorKind::InvalidType {
                        key: KEY_PARAM_COUNT,
                        expected: "a non-negative integer",
                    });
                    None
                }
            },
            None => {
                error(ValidationErrorKind::Missing(KEY_PARAM_COUNT));
                None
            }
        },
        (None, Some(policy)) => Some(RuleKind::Instruction { policy }),
        (Some(_), Some(_)) => {
            error(ValidationErrorKind::AmbiguousAnnotation);
            None
        }
        (None, None) => {
            error(ValidationErrorKind::MissingAnnotation);
            None
        }
    };

    match (active, module, address, kind) {
        (Some(active), Some(module), Some(address), Some(kind)) if errors.is_empty() => {
            Ok(Rule::new(name.to_owned(), module, address, active, kind))
        }
        _ => Err(errors),
    }
}

fn field<'a>(entry: &'a Mapping, key: &str) -> Option<&'a Value> {
    entry.get(&Value::String(key.to_owned()))
}

/// Policy name under `key`, empty names count as not set.
fn policy_name<F: FnMut(ValidationErrorKind)>(
    entry: &Mapping,
    key: &'static str,
    error: &mut F,
) -> Option<String> {
    match field(entry, key) {
        Some(Value::String(policy)) if !policy.is_empty() => Some(policy.clone()),
        Some(Value::String(_)) | None => None,
        Some(_) => {
            error(ValidationErrorKind::InvalidType {
                key,
                expected: "a policy name",
            });
            None
        }
    }
}

/// A configuration entry that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    entry: String,
    inner: ValidationErrorKind,
}

impl ValidationError {
    pub fn new(entry: &str, kind: ValidationErrorKind) -> Self {
        Self {
            entry: entry.to_owned(),
            inner: kind,
        }
    }

    /// Name of the offending entry.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn kind(&self) -> &ValidationErrorKind {
        &self.inner
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// entry is not a key-value mapping
    NotAMapping,
    /// required key is missing
    Missing(&'static str),
    /// key is present with a value of the wrong type
    InvalidType {
        key: &'static str,
        expected: &'static str,
    },
    /// module is not configured in the module tracker
    UnknownModule(String),
    /// neither call nor instruction annotation is set
    MissingAnnotation,
    /// both call and instruction annotation are set
    AmbiguousAnnotation,
}

impl error::Error for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}: ", SECTION, self.entry)?;

        match &self.inner {
            ValidationErrorKind::NotAMapping => write!(f, "entry must be a mapping"),
            ValidationErrorKind::Missing(KEY_ACTIVE) => {
                write!(f, "you must specify whether the entry is active")
            }
            ValidationErrorKind::Missing(key) => write!(f, "you must specify a valid {key}"),
            ValidationErrorKind::InvalidType { key, expected } => {
                write!(f, "{key} must be {expected}")
            }
            ValidationErrorKind::UnknownModule(module) => {
                write!(f, "unknown module {module:?}, it is not configured for tracking")
            }
            ValidationErrorKind::MissingAnnotation => write!(
                f,
                "you must specify either {KEY_CALL_ANNOTATION} or {KEY_INSTRUCTION_ANNOTATION}"
            ),
            ValidationErrorKind::AmbiguousAnnotation => write!(
                f,
                "only one of {KEY_CALL_ANNOTATION} or {KEY_INSTRUCTION_ANNOTATION} may be specified"
            ),
        }
    }
}

/// Every error collected while loading the annotation section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl error::Error for ValidationErrors {}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} invalid {} entries:\n{}",
            self.0.len(),
            SECTION,
            self.0.iter().join("\n")
        )
    }
}
