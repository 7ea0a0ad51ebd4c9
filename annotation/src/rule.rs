use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::host::Address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    /// fires on call entry (and again on return when the policy lets the call continue)
    Call { policy: String, param_count: u32 },
    /// fires when the instruction at the rule address executes
    Instruction { policy: String },
}

impl RuleKind {
    pub fn policy(&self) -> &str {
        match self {
            Self::Call { policy, .. } | Self::Instruction { policy } => policy,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }

    pub fn is_instruction(&self) -> bool {
        matches!(self, Self::Instruction { .. })
    }
}

/// One instrumentation point. Only the `active` flag changes after creation.
#[derive(Debug)]
pub struct Rule {
    name: String,
    module: String,
    address: Address,
    active: AtomicBool,
    kind: RuleKind,
}

impl Rule {
    pub fn new(
        name: String,
        module: String,
        address: Address,
        active: bool,
        kind: RuleKind,
    ) -> Self {
        Self {
            name,
            module,
            address,
            active: AtomicBool::new(active),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn policy(&self) -> &str {
        self.kind.policy()
    }

    pub fn param_count(&self) -> Option<u32> {
        match self.kind {
            RuleKind::Call { param_count, .. } => Some(param_count),
            RuleKind::Instruction { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst)
    }

    fn location(&self) -> (&str, Address) {
        (self.module.as_str(), self.address)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}@{:#x})", self.name, self.module, self.address)
    }
}

/// Immutable rule set, ordered by `(module, address)` for matching.
///
/// Several rules may share a location; lookups return all of them in configuration order.
/// Toggling by name scans in configuration order and only touches the first match.
#[derive(Debug, Default)]
pub struct RuleIndex {
    rules: Vec<Arc<Rule>>,
    by_location: Vec<Arc<Rule>>,
}

impl RuleIndex {
    pub fn new(rules: Vec<Rule>) -> Self {
        let rules: Vec<_> = rules.into_iter().map(Arc::new).collect();

        // stable sort keeps configuration order within a location
        let mut by_location = rules.clone();
        by_location.sort_by(|a, b| a.location().cmp(&b.location()));

        Self { rules, by_location }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All rules in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    pub fn find(&self, module: &str, address: Address) -> &[Arc<Rule>] {
        let key = (module, address);
        let start = self.by_location.partition_point(|rule| rule.location() < key);
        let end = self.by_location.partition_point(|rule| rule.location() <= key);

        &self.by_location[start..end]
    }

    pub fn find_instruction(
        &self,
        module: &str,
        address: Address,
    ) -> impl Iterator<Item = &Arc<Rule>> {
        self.find(module, address)
            .iter()
            .filter(|rule| rule.kind().is_instruction())
    }

    pub fn for_module(&self, module: &str) -> &[Arc<Rule>] {
        let start = self
            .by_location
            .partition_point(|rule| rule.module() < module);
        let end = self
            .by_location
            .partition_point(|rule| rule.module() <= module);

        &self.by_location[start..end]
    }

    pub fn has_instruction_rules(&self, module: &str) -> bool {
        self.for_module(module)
            .iter()
            .any(|rule| rule.kind().is_instruction())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|rule| rule.name() == name)
    }

    /// Set `active` on the first rule called `name`, returns whether such a rule exists.
    pub fn toggle(&self, name: &str, active: bool) -> bool {
        match self.get(name) {
            Some(rule) => {
                log::debug!("set active state of rule {} to {}", rule, active);
                rule.set_active(active);
                true
            }
            None => {
                log::debug!("no rule {:?} to set active state {}", name, active);
                false
            }
        }
    }
}
