//! Rule-driven instrumentation of call sites and instructions in tracked modules.
//!
//! Rules are loaded from the `annotation` configuration section. Call rules are armed as call
//! hooks when their module is loaded, instruction rules are armed while their module's blocks are
//! translated. A firing rule runs its policy, and the policy's decision is applied to the execution
//! context as a [`ControlEffect`].

use std::sync::Arc;

use anyhow::{Context, Result};

pub mod activation;
pub mod config;
pub mod effect;
pub mod host;
pub mod policy;
pub mod rule;
pub mod script;
#[cfg(test)]
mod testing;
pub mod translation;

pub use crate::{
    config::{AnnotationConfig, ValidationError, ValidationErrorKind, ValidationErrors},
    effect::{ControlEffect, ReturnSubscription},
    host::{
        Address, BlockId, CallMonitor, CallState, ExecutionContext, Host, InstructionSignal,
        ModuleDescriptor, ModuleRegistry, ModuleTracker, PathManager, Pid, SubscriptionId,
        Translator,
    },
    policy::{AnnotationApi, Firing, PolicyInvocation, PolicyRunner},
    rule::{Rule, RuleIndex, RuleKind},
    script::{PolicySource, ScriptRuntime},
};

use crate::{
    activation::ModuleActivationTracker, policy::PolicyInvoker,
    translation::TranslationHookMachine,
};

#[derive(Debug)]
pub struct Annotation {
    rules: Arc<RuleIndex>,
    activation: ModuleActivationTracker,
    translation: TranslationHookMachine,
    invoker: PolicyInvoker,
}

impl Annotation {
    pub fn new(rules: RuleIndex, runner: Box<dyn PolicyRunner>) -> Result<Self> {
        let invoker = PolicyInvoker::new(runner);
        invoker
            .verify(&rules)
            .context("Failed to verify annotation policies")?;

        Ok(Self {
            rules: Arc::new(rules),
            activation: ModuleActivationTracker::default(),
            translation: TranslationHookMachine::default(),
            invoker,
        })
    }

    pub fn from_config(config: &AnnotationConfig, registry: &dyn ModuleRegistry) -> Result<Self> {
        let rules = config
            .rules(registry)
            .context("Invalid annotation configuration")?;
        let runtime =
            ScriptRuntime::from_paths(&config.scripts).context("Failed to load policy scripts")?;

        Self::new(rules, Box::new(runtime))
    }

    pub fn rules(&self) -> &Arc<RuleIndex> {
        &self.rules
    }

    pub fn activate_rule(&self, name: &str, active: bool) -> bool {
        self.rules.toggle(name, active)
    }

    pub fn on_module_load(
        &mut self,
        host: &mut Host<'_>,
        ctx: &mut dyn ExecutionContext,
        module: &ModuleDescriptor,
    ) -> usize {
        self.activation
            .on_module_load(host, ctx, &self.rules, module)
    }

    pub fn on_translate_block_start(
        &mut self,
        host: &mut Host<'_>,
        _ctx: &mut dyn ExecutionContext,
        module: &ModuleDescriptor,
        block: BlockId,
        pc: Address,
    ) -> bool {
        // inactive instruction rules count too, `active` is checked when the instruction executes
        // since translated blocks outlive later toggles
        let instrument = host
            .modules
            .module_id(module)
            .map(|id| self.rules.has_instruction_rules(&id))
            .unwrap_or(false);
        log::trace!(
            "translating block {:?} at {:#x} of {} (instrument = {})",
            block,
            pc,
            module,
            instrument
        );

        self.translation
            .on_block_start(host.translator, block, instrument)
    }

    /// Connects `signal` when the translated instruction at `pc` has an instruction rule.
    pub fn on_translate_instruction_end(
        &mut self,
        host: &mut Host<'_>,
        ctx: &mut dyn ExecutionContext,
        signal: &mut dyn InstructionSignal,
        block: BlockId,
        pc: Address,
    ) -> bool {
        if !self.translation.on_instruction_end(host.translator, block) {
            return false;
        }

        let (module, address) = match locate(host.modules, ctx, pc) {
            Some(location) => location,
            None => return false,
        };
        if self.rules.find_instruction(&module, address).next().is_none() {
            return false;
        }

        log::debug!(
            "instrumenting instruction {:#x} ({}@{:#x})",
            pc,
            module,
            address
        );
        signal.connect();
        true
    }

    pub fn on_translate_block_end(
        &mut self,
        host: &mut Host<'_>,
        _ctx: &mut dyn ExecutionContext,
        module: &ModuleDescriptor,
        block: BlockId,
        end_pc: Address,
        static_target: Option<Address>,
    ) {
        log::trace!(
            "translated block {:?} of {} ending at {:#x} (static target = {:x?})",
            block,
            module,
            end_pc,
            static_target
        );

        self.translation.on_block_end(host.translator, block);
    }

    /// Execution of an instrumented instruction.
    ///
    /// Every active instruction rule at `pc` is invoked in configuration order until one of them
    /// produces an effect other than [`ControlEffect::Continue`].
    pub fn on_instruction(
        &mut self,
        host: &mut Host<'_>,
        ctx: &mut dyn ExecutionContext,
        pc: Address,
    ) -> Result<ControlEffect> {
        let (module, address) = match locate(host.modules, ctx, pc) {
            Some(location) => location,
            None => return Ok(ControlEffect::Continue),
        };

        for rule in self.rules.find_instruction(&module, address) {
            if !rule.is_active() {
                log::trace!("annotation {} is inactive", rule);
                continue;
            }

            let invocation = self
                .invoker
                .invoke(ctx, &self.rules, rule, Firing::Instruction)?;
            let effect = effect::apply(host, ctx, None, &invocation)?;
            if effect != ControlEffect::Continue {
                return Ok(effect);
            }
        }

        Ok(ControlEffect::Continue)
    }

    /// Entry of a call armed for `rule`.
    pub fn on_call(
        &mut self,
        host: &mut Host<'_>,
        ctx: &mut dyn ExecutionContext,
        call: &mut dyn CallState,
        rule: &Arc<Rule>,
    ) -> Result<ControlEffect> {
        if !rule.is_active() {
            log::trace!("annotation {} is inactive", rule);
            return Ok(ControlEffect::Continue);
        }

        let invocation = self
            .invoker
            .invoke(ctx, &self.rules, rule, Firing::CallEntry)?;
        effect::apply(host, ctx, Some(call), &invocation)
    }

    pub fn on_return(
        &mut self,
        host: &mut Host<'_>,
        ctx: &mut dyn ExecutionContext,
        subscription: ReturnSubscription,
    ) -> Result<ControlEffect> {
        let rule = subscription.into_rule();
        let invocation = self
            .invoker
            .invoke(ctx, &self.rules, &rule, Firing::CallReturn)?;
        effect::apply(host, ctx, None, &invocation)
    }

    pub fn shutdown(&mut self, host: &mut Host<'_>) {
        self.translation.detach(host.translator);
        self.activation.shutdown(host.translator);
    }
}

/// Configured module id and native address of `pc`.
fn locate(
    modules: &dyn ModuleTracker,
    ctx: &dyn ExecutionContext,
    pc: Address,
) -> Option<(String, Address)> {
    let module = modules.module_at(ctx, pc)?;
    let id = modules.module_id(&module)?;

    Some((id, module.to_native(pc)))
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, fs, rc::Rc};

    use pretty_assertions::assert_eq;
    use serde_yaml::Mapping;

    use super::*;
    use crate::testing::{libfoo, Call, Context, Modules, Platform, Signal};

    type Firings = Rc<RefCell<Vec<(String, Firing)>>>;

    const BYPASS: &str = r#"
        bypass_license:
          active: true
          module: libfoo
          address: 0x401000
          callAnnotation: bypass_check
          paramcount: 2
    "#;

    const INSTRUCTIONS: &str = r#"
        first:
          active: true
          module: libfoo
          address: 0x401010
          instructionAnnotation: observe
        disabled:
          active: false
          module: libfoo
          address: 0x401010
          instructionAnnotation: observe
        second:
          active: true
          module: libfoo
          address: 0x401010
          instructionAnnotation: finish
        third:
          active: true
          module: libfoo
          address: 0x401010
          instructionAnnotation: observe
        unreached:
          active: true
          module: libfoo
          address: 0x401800
          instructionAnnotation: observe
    "#;

    fn platform() -> Platform {
        Platform {
            modules: Modules::new(&["libfoo"]).with_loaded(libfoo(42)),
            ..Default::default()
        }
    }

    fn annotation(
        yaml: &str,
        platform: &Platform,
        mut decide: impl FnMut(&str, &mut PolicyInvocation) + 'static,
    ) -> (Annotation, Firings) {
        let section: Mapping = serde_yaml::from_str(yaml).unwrap();
        let rules = config::load_rules(&section, &platform.modules).unwrap();

        let firings = Firings::default();
        let recorded = firings.clone();
        let annotation = Annotation::new(
            rules,
            Box::new(
                move |policy: &str,
                      _: &mut dyn ExecutionContext,
                      invocation: &mut PolicyInvocation|
                      -> Result<()> {
                    recorded
                        .borrow_mut()
                        .push((invocation.rule().name().to_string(), invocation.firing()));
                    decide(policy, invocation);
                    Ok(())
                },
            ),
        )
        .unwrap();

        (annotation, firings)
    }

    fn armed_rule(platform: &Platform) -> Arc<Rule> {
        assert_eq!(platform.calls.hooks.len(), 1);
        let (pc, pid, rule) = &platform.calls.hooks[0];
        assert_eq!((*pc, *pid), (0x7f00_0000_1000, 42));
        rule.clone()
    }

    #[test]
    fn skip_bypasses_call() {
        let mut platform = platform();
        let (mut annotation, firings) = annotation(BYPASS, &platform, |_, invocation| {
            invocation.set_skip(true)
        });
        assert_eq!(annotation.rules().len(), 1);

        let mut ctx = Context::new(0x7f00_0000_1000);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));
        let rule = armed_rule(&platform);
        assert_eq!(rule.param_count(), Some(2));

        let mut call = Call::default();
        let effect = annotation
            .on_call(&mut platform.host(), &mut ctx, &mut call, &rule)
            .unwrap();
        assert_eq!(effect, ControlEffect::Skip);
        assert_eq!(ctx.bypassed, vec![2]);
        assert!(call.returns.is_empty());
        assert_eq!(
            *firings.borrow(),
            vec![("bypass_license".to_string(), Firing::CallEntry)]
        );
    }

    #[test]
    fn continue_fires_again_on_return() {
        let mut platform = platform();
        let directions = Rc::new(RefCell::new(vec![]));
        let recorded = directions.clone();
        let (mut annotation, firings) = annotation(BYPASS, &platform, move |_, invocation| {
            recorded
                .borrow_mut()
                .push((invocation.is_call(), invocation.is_return()))
        });

        let mut ctx = Context::new(0x7f00_0000_1000);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));
        let rule = armed_rule(&platform);

        let mut call = Call::default();
        let effect = annotation
            .on_call(&mut platform.host(), &mut ctx, &mut call, &rule)
            .unwrap();
        assert_eq!(effect, ControlEffect::Continue);
        assert_eq!(call.returns.len(), 1);

        let subscription = call.returns.remove(0);
        let effect = annotation
            .on_return(&mut platform.host(), &mut ctx, subscription)
            .unwrap();
        assert_eq!(effect, ControlEffect::Continue);
        assert!(ctx.bypassed.is_empty());
        assert_eq!(
            *firings.borrow(),
            vec![
                ("bypass_license".to_string(), Firing::CallEntry),
                ("bypass_license".to_string(), Firing::CallReturn),
            ]
        );
        assert_eq!(*directions.borrow(), vec![(true, false), (false, true)]);
    }

    #[test]
    fn inactive_rule_is_never_invoked() {
        let mut platform = platform();
        let (mut annotation, firings) = annotation(BYPASS, &platform, |_, _| {});

        let mut ctx = Context::new(0x7f00_0000_1000);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));
        let rule = armed_rule(&platform);

        assert!(annotation.activate_rule("bypass_license", false));
        let mut call = Call::default();
        for _ in 0..3 {
            let effect = annotation
                .on_call(&mut platform.host(), &mut ctx, &mut call, &rule)
                .unwrap();
            assert_eq!(effect, ControlEffect::Continue);
        }
        assert!(firings.borrow().is_empty());
        assert!(call.returns.is_empty());

        assert!(annotation.activate_rule("bypass_license", true));
        annotation
            .on_call(&mut platform.host(), &mut ctx, &mut call, &rule)
            .unwrap();
        assert_eq!(firings.borrow().len(), 1);
        assert_eq!(call.returns.len(), 1);
    }

    #[test]
    fn kill_on_call_entry() {
        let mut platform = platform();
        let (mut annotation, _) =
            annotation(BYPASS, &platform, |_, invocation| invocation.set_kill(true));

        let mut ctx = Context::new(0x7f00_0000_1000);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));
        let rule = armed_rule(&platform);

        let mut call = Call::default();
        let effect = annotation
            .on_call(&mut platform.host(), &mut ctx, &mut call, &rule)
            .unwrap();
        assert_eq!(effect, ControlEffect::Kill);
        assert_eq!(
            ctx.terminated.as_deref(),
            Some("Annotation bypass_license killed us")
        );
        assert!(call.returns.is_empty());
    }

    #[test]
    fn instruction_rules_fire_in_configuration_order() {
        let mut platform = platform();
        let (mut annotation, firings) = annotation(INSTRUCTIONS, &platform, |policy, invocation| {
            if policy == "finish" {
                invocation.succeed();
            }
        });

        let mut ctx = Context::new(0);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));
        assert!(platform.calls.hooks.is_empty());
        assert_eq!(platform.translator.live.len(), 1);

        // translate a block containing one annotated instruction
        let block = BlockId(1);
        assert!(annotation.on_translate_block_start(
            &mut platform.host(),
            &mut ctx,
            &libfoo(42),
            block,
            0x7f00_0000_1000
        ));
        let mut signals = vec![];
        for pc in (0x7f00_0000_1000..0x7f00_0000_1020).step_by(8) {
            let mut signal = Signal::default();
            annotation.on_translate_instruction_end(
                &mut platform.host(),
                &mut ctx,
                &mut signal,
                block,
                pc,
            );
            signals.push(signal.connected);
        }
        assert_eq!(signals, vec![0, 0, 1, 0]);
        annotation.on_translate_block_end(
            &mut platform.host(),
            &mut ctx,
            &libfoo(42),
            block,
            0x7f00_0000_1020,
            None,
        );
        assert_eq!(platform.translator.live.len(), 1);

        // execute it
        ctx.pc = 0x7f00_0000_1010;
        let effect = annotation
            .on_instruction(&mut platform.host(), &mut ctx, 0x7f00_0000_1010)
            .unwrap();
        assert_eq!(effect, ControlEffect::Succeed);
        assert!(effect.unwinds());
        assert_eq!(platform.paths.succeeded, vec![1]);
        assert_eq!(platform.calls.erased, vec![0x7f00_0000_1010]);

        let names: Vec<_> = firings.borrow().iter().map(|(name, _)| name.clone()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(firings
            .borrow()
            .iter()
            .all(|(_, firing)| *firing == Firing::Instruction));
    }

    #[test]
    fn unreached_instruction_is_never_invoked() {
        let mut platform = platform();
        let (mut annotation, firings) = annotation(INSTRUCTIONS, &platform, |_, _| {});

        let mut ctx = Context::new(0);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));

        let mut signal = Signal::default();
        for block in [BlockId(1), BlockId(2)] {
            annotation.on_translate_block_start(
                &mut platform.host(),
                &mut ctx,
                &libfoo(42),
                block,
                0x7f00_0000_1000,
            );
            annotation.on_translate_instruction_end(
                &mut platform.host(),
                &mut ctx,
                &mut signal,
                block,
                0x7f00_0000_1000,
            );
            annotation.on_translate_block_end(
                &mut platform.host(),
                &mut ctx,
                &libfoo(42),
                block,
                0x7f00_0000_1004,
                Some(0x7f00_0000_1100),
            );
        }

        assert_eq!(signal.connected, 0);
        assert!(firings.borrow().is_empty());
    }

    #[test]
    fn interrupted_translation_stops_instrumenting() {
        let mut platform = platform();
        let (mut annotation, _) = annotation(INSTRUCTIONS, &platform, |_, _| {});

        let mut ctx = Context::new(0);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));
        annotation.on_translate_block_start(
            &mut platform.host(),
            &mut ctx,
            &libfoo(42),
            BlockId(1),
            0x7f00_0000_1000,
        );

        // an unrelated block is translated before block 1 finished
        let mut signal = Signal::default();
        assert!(!annotation.on_translate_instruction_end(
            &mut platform.host(),
            &mut ctx,
            &mut signal,
            BlockId(2),
            0x7f00_0000_1010,
        ));
        assert!(!annotation.on_translate_instruction_end(
            &mut platform.host(),
            &mut ctx,
            &mut signal,
            BlockId(1),
            0x7f00_0000_1010,
        ));
        assert_eq!(signal.connected, 0);

        annotation.shutdown(&mut platform.host());
        assert!(platform.translator.live.is_empty());
    }

    #[test]
    fn blocks_without_instruction_rules_are_not_instrumented() {
        let mut platform = platform();
        let (mut annotation, _) = annotation(BYPASS, &platform, |_, _| {});

        let mut ctx = Context::new(0);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));
        assert!(!annotation.on_translate_block_start(
            &mut platform.host(),
            &mut ctx,
            &libfoo(42),
            BlockId(1),
            0x7f00_0000_1000,
        ));
        assert!(platform.translator.live.is_empty());
    }

    #[test]
    fn inactive_instruction_rule_still_instruments_block() {
        const DISABLED: &str = r#"
        watch:
          active: false
          module: libfoo
          address: 0x401010
          instructionAnnotation: observe
        "#;

        let mut platform = platform();
        let (mut annotation, firings) = annotation(DISABLED, &platform, |_, _| {});

        let mut ctx = Context::new(0);
        annotation.on_module_load(&mut platform.host(), &mut ctx, &libfoo(42));

        let block = BlockId(1);
        assert!(annotation.on_translate_block_start(
            &mut platform.host(),
            &mut ctx,
            &libfoo(42),
            block,
            0x7f00_0000_1000,
        ));
        let mut signal = Signal::default();
        assert!(annotation.on_translate_instruction_end(
            &mut platform.host(),
            &mut ctx,
            &mut signal,
            block,
            0x7f00_0000_1010,
        ));
        assert_eq!(signal.connected, 1);
        annotation.on_translate_block_end(
            &mut platform.host(),
            &mut ctx,
            &libfoo(42),
            block,
            0x7f00_0000_1020,
            None,
        );

        ctx.pc = 0x7f00_0000_1010;
        let effect = annotation
            .on_instruction(&mut platform.host(), &mut ctx, 0x7f00_0000_1010)
            .unwrap();
        assert_eq!(effect, ControlEffect::Continue);
        assert!(firings.borrow().is_empty());

        // enabled after translation, the instrumented block picks it up
        assert!(annotation.activate_rule("watch", true));
        annotation
            .on_instruction(&mut platform.host(), &mut ctx, 0x7f00_0000_1010)
            .unwrap();
        assert_eq!(
            *firings.borrow(),
            vec![("watch".to_string(), Firing::Instruction)]
        );
    }

    #[test]
    fn from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("policies.rn"),
            "pub fn bypass_check(state, annotation) { annotation.set_skip(true); }",
        )
        .unwrap();
        let path = dir.path().join("annotation.yml");
        fs::write(
            &path,
            format!("scripts:\n  - policies.rn\nannotation:\n{}", indent(BYPASS)),
        )
        .unwrap();

        let config = AnnotationConfig::read_from(&path).unwrap();
        let modules = Modules::new(&["libfoo"]);
        let annotation = Annotation::from_config(&config, &modules).unwrap();
        assert!(annotation.rules().get("bypass_license").is_some());

        // policies must exist
        fs::write(dir.path().join("policies.rn"), "pub fn other(state, annotation) {}").unwrap();
        assert!(Annotation::from_config(&config, &modules).is_err());

        // modules must be known
        assert!(Annotation::from_config(&config, &Modules::new(&["libbar"])).is_err());
    }

    fn indent(yaml: &str) -> String {
        yaml.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| format!("  {}\n", line.trim_start_matches("        ")))
            .collect()
    }
}
