use std::{fmt, sync::Arc, time::Instant};

use anyhow::{bail, Context, Result};
use common::config::script::SLOW_POLICY_MS;

use crate::{
    effect::ControlEffect,
    host::ExecutionContext,
    rule::{Rule, RuleIndex},
};

/// Capabilities handed to a policy for one firing.
pub trait AnnotationApi {
    /// bypass the intercepted call (call entry only)
    fn set_skip(&mut self, skip: bool);
    /// terminate the current path
    fn set_kill(&mut self, kill: bool);
    /// mark the current path as successful (return and instruction firings only)
    fn succeed(&mut self);
    /// set the active state of the first rule called `name`
    fn activate_rule(&mut self, name: &str, active: bool) -> bool;
    fn is_return(&self) -> bool;
    fn is_call(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firing {
    CallEntry,
    CallReturn,
    Instruction,
}

impl fmt::Display for Firing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CallEntry => "call",
            Self::CallReturn => "return",
            Self::Instruction => "instruction",
        })
    }
}

/// State of one policy call: directionality in, decision flags out.
#[derive(Debug, Clone)]
pub struct PolicyInvocation {
    rules: Arc<RuleIndex>,
    rule: Arc<Rule>,
    is_return: bool,
    is_instruction: bool,
    skip: bool,
    kill: bool,
    succeed: bool,
}

impl PolicyInvocation {
    pub fn new(rules: Arc<RuleIndex>, rule: Arc<Rule>, firing: Firing) -> Self {
        Self {
            rules,
            rule,
            is_return: firing == Firing::CallReturn,
            is_instruction: firing == Firing::Instruction,
            skip: false,
            kill: false,
            succeed: false,
        }
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn firing(&self) -> Firing {
        if self.is_instruction {
            Firing::Instruction
        } else if self.is_return {
            Firing::CallReturn
        } else {
            Firing::CallEntry
        }
    }

    pub fn is_call_entry(&self) -> bool {
        self.firing() == Firing::CallEntry
    }

    /// Interpret the decision flags, kill wins over skip wins over succeed.
    pub fn effect(&self) -> ControlEffect {
        if self.kill {
            ControlEffect::Kill
        } else if self.skip && self.is_call_entry() {
            ControlEffect::Skip
        } else if self.succeed && !self.is_call_entry() {
            ControlEffect::Succeed
        } else {
            if self.skip {
                log::warn!(
                    "annotation {} requested skip on a {} firing, ignored",
                    self.rule.name(),
                    self.firing()
                );
            }
            if self.succeed {
                log::warn!(
                    "annotation {} called succeed() on a call entry, ignored",
                    self.rule.name()
                );
            }

            ControlEffect::Continue
        }
    }
}

impl AnnotationApi for PolicyInvocation {
    fn set_skip(&mut self, skip: bool) {
        log::debug!("annotation {}: set_skip {}", self.rule.name(), skip);
        self.skip = skip;
    }

    fn set_kill(&mut self, kill: bool) {
        log::debug!("annotation {}: set_kill {}", self.rule.name(), kill);
        self.kill = kill;
    }

    fn succeed(&mut self) {
        log::debug!("annotation {}: succeed", self.rule.name());
        self.succeed = true;
    }

    fn activate_rule(&mut self, name: &str, active: bool) -> bool {
        log::debug!(
            "annotation {}: setting active state of rule {:?} to {}",
            self.rule.name(),
            name,
            active
        );
        self.rules.toggle(name, active)
    }

    fn is_return(&self) -> bool {
        !self.is_instruction && self.is_return
    }

    fn is_call(&self) -> bool {
        !self.is_instruction && !self.is_return
    }
}

/// Executes named policies, e.g. functions of a script.
pub trait PolicyRunner {
    fn has_policy(&self, policy: &str) -> bool;

    /// Run `policy` synchronously, decisions are recorded in `invocation`.
    fn run(
        &mut self,
        policy: &str,
        ctx: &mut dyn ExecutionContext,
        invocation: &mut PolicyInvocation,
    ) -> Result<()>;
}

/// Native policies: a single function dispatching on the policy name.
impl<F> PolicyRunner for F
where
    F: FnMut(&str, &mut dyn ExecutionContext, &mut PolicyInvocation) -> Result<()>,
{
    fn has_policy(&self, _policy: &str) -> bool {
        true
    }

    fn run(
        &mut self,
        policy: &str,
        ctx: &mut dyn ExecutionContext,
        invocation: &mut PolicyInvocation,
    ) -> Result<()> {
        self(policy, ctx, invocation)
    }
}

pub struct PolicyInvoker {
    runner: Box<dyn PolicyRunner>,
}

impl fmt::Debug for PolicyInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyInvoker").finish_non_exhaustive()
    }
}

impl PolicyInvoker {
    pub fn new(runner: Box<dyn PolicyRunner>) -> Self {
        Self { runner }
    }

    /// Every policy referenced by `rules` can be run.
    pub fn verify(&self, rules: &RuleIndex) -> Result<()> {
        let mut missing = 0;
        for rule in rules.iter() {
            if !self.runner.has_policy(rule.policy()) {
                log::error!(
                    "policy {:?} of annotation {} is not defined",
                    rule.policy(),
                    rule.name()
                );
                missing += 1;
            }
        }

        if missing > 0 {
            bail!("{} annotation rules reference undefined policies", missing);
        }

        Ok(())
    }

    pub fn invoke(
        &mut self,
        ctx: &mut dyn ExecutionContext,
        rules: &Arc<RuleIndex>,
        rule: &Arc<Rule>,
        firing: Firing,
    ) -> Result<PolicyInvocation> {
        log::debug!(
            "Invoking {} annotation {} on path {} at {:#x}",
            firing,
            rule,
            ctx.id(),
            ctx.pc()
        );

        let mut invocation = PolicyInvocation::new(rules.clone(), rule.clone(), firing);
        let start = Instant::now();
        self.runner
            .run(rule.policy(), ctx, &mut invocation)
            .with_context(|| format!("Failed to run policy {:?} of {}", rule.policy(), rule))?;

        let elapsed = start.elapsed();
        if elapsed.as_millis() > SLOW_POLICY_MS {
            log::debug!(
                "policy {:?} took {:.3} ms",
                rule.policy(),
                elapsed.as_micros() as f64 / 1000.
            );
        }

        Ok(invocation)
    }
}
