//! Recording collaborators for engine tests.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::{
    effect::ReturnSubscription,
    host::{
        self, Address, ExecutionContext, Host, ModuleDescriptor, ModuleRegistry, ModuleTracker,
        Pid, SubscriptionId,
    },
    rule::Rule,
};

pub fn libfoo(pid: Pid) -> ModuleDescriptor {
    ModuleDescriptor {
        name: "libfoo".into(),
        pid,
        native_base: 0x400000,
        load_base: 0x7f00_0000_0000,
        size: 0x2000,
    }
}

#[derive(Debug)]
pub struct Context {
    pub id: usize,
    pub pc: Address,
    pub registers: Vec<(String, u64)>,
    pub bypassed: Vec<u32>,
    pub terminated: Option<String>,
}

impl Context {
    pub fn new(pc: Address) -> Self {
        Self {
            id: 1,
            pc,
            registers: vec![("r0".into(), 0), ("r1".into(), 0)],
            bypassed: vec![],
            terminated: None,
        }
    }

    pub fn register(&self, name: &str) -> Option<u64> {
        self.registers
            .iter()
            .find(|(register, _)| register == name)
            .map(|(_, value)| *value)
    }
}

impl ExecutionContext for Context {
    fn id(&self) -> usize {
        self.id
    }

    fn pc(&self) -> Address {
        self.pc
    }

    fn registers(&self) -> Vec<(String, u64)> {
        self.registers.clone()
    }

    fn set_register(&mut self, name: &str, value: u64) -> Result<()> {
        match self.registers.iter_mut().find(|(register, _)| register == name) {
            Some((_, old)) => {
                *old = value;
                Ok(())
            }
            None => bail!("unknown register {:?}", name),
        }
    }

    fn bypass_function(&mut self, param_count: u32) -> Result<()> {
        self.bypassed.push(param_count);
        Ok(())
    }

    fn terminate(&mut self, reason: &str) {
        self.terminated = Some(reason.to_string());
    }
}

#[derive(Debug, Default)]
pub struct Modules {
    ids: Vec<String>,
    loaded: Vec<ModuleDescriptor>,
}

impl Modules {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|id| id.to_string()).collect(),
            loaded: vec![],
        }
    }

    pub fn with_loaded(mut self, module: ModuleDescriptor) -> Self {
        self.loaded.push(module);
        self
    }
}

impl ModuleRegistry for Modules {
    fn is_configured(&self, id: &str) -> bool {
        self.ids.iter().any(|known| known == id)
    }
}

impl ModuleTracker for Modules {
    fn module_id(&self, module: &ModuleDescriptor) -> Option<String> {
        self.is_configured(&module.name)
            .then(|| module.name.clone())
    }

    fn module_at(&self, _ctx: &dyn ExecutionContext, pc: Address) -> Option<ModuleDescriptor> {
        self.loaded
            .iter()
            .find(|module| pc.wrapping_sub(module.load_base) < module.size)
            .cloned()
    }
}

#[derive(Debug, Default)]
pub struct Calls {
    pub hooks: Vec<(Address, Pid, Arc<Rule>)>,
    pub erased: Vec<Address>,
}

impl host::CallMonitor for Calls {
    fn register_call_hook(
        &mut self,
        _ctx: &mut dyn ExecutionContext,
        pc: Address,
        pid: Pid,
        rule: Arc<Rule>,
    ) {
        self.hooks.push((pc, pid, rule));
    }

    fn erase_return_state(&mut self, _ctx: &mut dyn ExecutionContext, pc: Address) {
        self.erased.push(pc);
    }
}

#[derive(Debug, Default)]
pub struct Translator {
    next: u64,
    pub live: Vec<SubscriptionId>,
    pub released: Vec<SubscriptionId>,
}

impl Translator {
    fn subscribe(&mut self) -> SubscriptionId {
        self.next += 1;
        let subscription = SubscriptionId(self.next);
        self.live.push(subscription);
        subscription
    }
}

impl host::Translator for Translator {
    fn subscribe_block_translation(&mut self) -> SubscriptionId {
        self.subscribe()
    }

    fn subscribe_instruction_translation(&mut self) -> SubscriptionId {
        self.subscribe()
    }

    fn unsubscribe(&mut self, subscription: SubscriptionId) {
        assert!(
            self.live.contains(&subscription),
            "{subscription:?} released twice"
        );
        self.live.retain(|live| *live != subscription);
        self.released.push(subscription);
    }
}

#[derive(Debug, Default)]
pub struct Paths {
    pub succeeded: Vec<usize>,
}

impl host::PathManager for Paths {
    fn succeed(&mut self, ctx: &mut dyn ExecutionContext) -> Result<()> {
        self.succeeded.push(ctx.id());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Call {
    pub returns: Vec<ReturnSubscription>,
}

impl host::CallState for Call {
    fn register_return(&mut self, subscription: ReturnSubscription) {
        self.returns.push(subscription);
    }
}

#[derive(Debug, Default)]
pub struct Signal {
    pub connected: usize,
}

impl host::InstructionSignal for Signal {
    fn connect(&mut self) {
        self.connected += 1;
    }
}

#[derive(Debug, Default)]
pub struct Platform {
    pub modules: Modules,
    pub calls: Calls,
    pub translator: Translator,
    pub paths: Paths,
}

impl Platform {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            modules: Modules::new(ids),
            ..Default::default()
        }
    }

    pub fn host(&mut self) -> Host<'_> {
        Host {
            modules: &self.modules,
            calls: &mut self.calls,
            translator: &mut self.translator,
            paths: Some(&mut self.paths),
        }
    }
}
