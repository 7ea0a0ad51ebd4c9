//! Interfaces to the hosting analysis platform.
//!
//! The engine never reaches for a global platform instance: every event handler gets a [`Host`]
//! with the collaborators of the current translation stream and the [`ExecutionContext`] of the
//! path that triggered the event.

use std::{fmt, sync::Arc};

use anyhow::Result;

use crate::{effect::ReturnSubscription, rule::Rule};

pub type Address = u64;
pub type Pid = u64;

/// Opaque handle of a translation block, only compared for identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u64);

/// Handle returned by a [`Translator`] subscription, released with [`Translator::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A loaded instance of a tracked executable module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub pid: Pid,
    /// link-time base address, rule addresses are relative to this base
    pub native_base: Address,
    /// base address the module is mapped at in this process
    pub load_base: Address,
    pub size: u64,
}

impl ModuleDescriptor {
    pub fn to_runtime(&self, address: Address) -> Address {
        address
            .wrapping_sub(self.native_base)
            .wrapping_add(self.load_base)
    }

    pub fn to_native(&self, pc: Address) -> Address {
        pc.wrapping_sub(self.load_base)
            .wrapping_add(self.native_base)
    }

    /// Native `address` lies within the mapped size of this module.
    pub fn contains_native(&self, address: Address) -> bool {
        address
            .checked_sub(self.native_base)
            .map(|offset| offset <= self.size)
            .unwrap_or(false)
    }
}

impl fmt::Display for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (pid {}, {:#x}..{:#x})",
            self.name,
            self.pid,
            self.load_base,
            self.load_base.wrapping_add(self.size)
        )
    }
}

/// State of one analyzed execution path, the target of control effects.
pub trait ExecutionContext {
    /// path identifier, used in diagnostics
    fn id(&self) -> usize;
    fn pc(&self) -> Address;
    /// snapshot of the named registers, handed to policies
    fn registers(&self) -> Vec<(String, u64)>;
    fn set_register(&mut self, name: &str, value: u64) -> Result<()>;
    /// synthesize a return from the intercepted call, popping `param_count` arguments
    fn bypass_function(&mut self, param_count: u32) -> Result<()>;
    /// terminate this path, no further events are delivered for it
    fn terminate(&mut self, reason: &str);
}

pub trait ModuleRegistry {
    /// `id` is a module the platform is configured to track
    fn is_configured(&self, id: &str) -> bool;
}

pub trait ModuleTracker: ModuleRegistry {
    /// configured id of a loaded module, if it is tracked
    fn module_id(&self, module: &ModuleDescriptor) -> Option<String>;
    /// tracked module executing `pc` in the given context
    fn module_at(&self, ctx: &dyn ExecutionContext, pc: Address) -> Option<ModuleDescriptor>;
}

pub trait CallMonitor {
    /// fire [`crate::Annotation::on_call`] with `rule` whenever `pid` calls `pc`
    fn register_call_hook(
        &mut self,
        ctx: &mut dyn ExecutionContext,
        pc: Address,
        pid: Pid,
        rule: Arc<Rule>,
    );
    /// drop pending return tracking for the call frame at `pc`
    fn erase_return_state(&mut self, ctx: &mut dyn ExecutionContext, pc: Address);
}

/// Handle of one in-flight monitored call.
pub trait CallState {
    /// deliver `subscription` to [`crate::Annotation::on_return`] once this call returns
    fn register_return(&mut self, subscription: ReturnSubscription);
}

pub trait Translator {
    /// block translate start/end events for tracked modules
    fn subscribe_block_translation(&mut self) -> SubscriptionId;
    /// translate end event of every instruction
    fn subscribe_instruction_translation(&mut self) -> SubscriptionId;
    fn unsubscribe(&mut self, subscription: SubscriptionId);
}

/// Execution signal of a single translated instruction.
pub trait InstructionSignal {
    /// fire [`crate::Annotation::on_instruction`] whenever the instruction executes
    fn connect(&mut self);
}

pub trait PathManager {
    /// mark the path as a successful exploration outcome
    fn succeed(&mut self, ctx: &mut dyn ExecutionContext) -> Result<()>;
}

/// Collaborators of the engine, passed into every event handler.
pub struct Host<'a> {
    pub modules: &'a dyn ModuleTracker,
    pub calls: &'a mut dyn CallMonitor,
    pub translator: &'a mut dyn Translator,
    pub paths: Option<&'a mut dyn PathManager>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::ModuleDescriptor;

    fn libfoo() -> ModuleDescriptor {
        ModuleDescriptor {
            name: "libfoo.so".into(),
            pid: 42,
            native_base: 0x400000,
            load_base: 0x7f00_0000_0000,
            size: 0x2000,
        }
    }

    #[test]
    fn address_translation() {
        let module = libfoo();
        assert_eq!(module.to_runtime(0x401000), 0x7f00_0000_1000);
        assert_eq!(module.to_native(0x7f00_0000_1000), 0x401000);
    }

    #[test]
    fn module_bounds() {
        let module = libfoo();
        assert!(module.contains_native(0x400000));
        assert!(module.contains_native(0x402000));
        assert!(!module.contains_native(0x402001));
        assert!(!module.contains_native(0x3fffff));
    }
}
