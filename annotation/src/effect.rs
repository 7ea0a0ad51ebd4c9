use std::{fmt, sync::Arc};

use anyhow::{bail, Context, Result};

use crate::{
    host::{Address, CallState, ExecutionContext, Host},
    policy::PolicyInvocation,
    rule::Rule,
};

/// Outcome of evaluating a policy for one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEffect {
    Continue,
    /// the intercepted call was bypassed with a synthesized return
    Skip,
    /// the current path was terminated
    Kill,
    /// the current path was marked as a successful outcome
    Succeed,
}

impl ControlEffect {
    /// The dispatch loop must abandon the rest of the current instruction step.
    pub fn unwinds(self) -> bool {
        matches!(self, Self::Skip | Self::Succeed)
    }

    /// No further events are delivered for the current path.
    pub fn terminates(self) -> bool {
        self == Self::Kill
    }
}

impl fmt::Display for ControlEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continue => "continue",
            Self::Skip => "skip",
            Self::Kill => "kill",
            Self::Succeed => "succeed",
        })
    }
}

/// One-shot binding of a call that continued to the return-side policy invocation.
///
/// Consumed by value in [`crate::Annotation::on_return`], so it fires at most once.
#[derive(Debug)]
pub struct ReturnSubscription {
    rule: Arc<Rule>,
    call_pc: Address,
}

impl ReturnSubscription {
    fn arm(invocation: &PolicyInvocation, call_pc: Address) -> Self {
        assert!(
            invocation.is_call_entry(),
            "return subscription armed for a {} firing of {}",
            invocation.firing(),
            invocation.rule()
        );

        Self {
            rule: invocation.rule().clone(),
            call_pc,
        }
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn call_pc(&self) -> Address {
        self.call_pc
    }

    pub(crate) fn into_rule(self) -> Arc<Rule> {
        self.rule
    }
}

/// Execute the decision recorded in `invocation` against the execution context.
///
/// `call` is the in-flight call of a call-entry firing, it receives the return subscription
/// when the policy lets the call continue.
pub fn apply(
    host: &mut Host<'_>,
    ctx: &mut dyn ExecutionContext,
    call: Option<&mut dyn CallState>,
    invocation: &PolicyInvocation,
) -> Result<ControlEffect> {
    let rule = invocation.rule();
    let effect = invocation.effect();

    match effect {
        ControlEffect::Kill => {
            log::info!("outcome: annotation {} killed path {}", rule, ctx.id());
            ctx.terminate(&format!("Annotation {} killed us", rule.name()));
        }
        ControlEffect::Skip => {
            let param_count = rule
                .param_count()
                .with_context(|| format!("skip requested by non-call annotation {rule}"))?;
            log::info!(
                "outcome: annotation {} bypassed call at {:#x} ({} parameters) on path {}",
                rule,
                ctx.pc(),
                param_count,
                ctx.id()
            );
            ctx.bypass_function(param_count)
                .with_context(|| format!("Failed to bypass call for annotation {rule}"))?;
        }
        ControlEffect::Succeed => {
            let pc = ctx.pc();
            log::info!(
                "outcome: annotation {} marked path {} successful at {:#x}",
                rule,
                ctx.id(),
                pc
            );
            match host.paths.as_deref_mut() {
                Some(paths) => paths
                    .succeed(ctx)
                    .with_context(|| format!("Failed to succeed path for annotation {rule}"))?,
                None => bail!(
                    "annotation {} called succeed(), but no path manager is available",
                    rule
                ),
            }
            host.calls.erase_return_state(ctx, pc);
        }
        ControlEffect::Continue => {
            if let Some(call) = call {
                let subscription = ReturnSubscription::arm(invocation, ctx.pc());
                log::debug!(
                    "annotation {} continues, return hook armed for call at {:#x}",
                    rule,
                    subscription.call_pc()
                );
                call.register_return(subscription);
            }
        }
    }

    Ok(effect)
}
