use std::{fmt, fs, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use common::{FxHashMap, FxHashSet};
use rune::{
    runtime::{RuntimeContext, VmError},
    termcolor::{ColorChoice, StandardStream},
    Any, Diagnostics, Hash, Module, Source, SourceId, Sources, Unit, Value, Vm,
};

use crate::{
    host::{Address, ExecutionContext},
    policy::{AnnotationApi, PolicyInvocation, PolicyRunner},
};

mod log;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    File(PathBuf),
    Script(PathBuf, String),
}

impl PolicySource {
    fn path(&self) -> &PathBuf {
        match self {
            Self::File(path) | Self::Script(path, _) => path,
        }
    }
}

/// Runs policies defined as `pub fn <policy>(state, annotation)` in rune scripts.
pub struct ScriptRuntime {
    context: Arc<RuntimeContext>,
    scripts: Vec<PolicyScript>,
    target: log::RuleTarget,
}

struct PolicyScript {
    unit: Arc<Unit>,
    script: SourceId,
    sources: Sources,
}

impl fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field(
                "scripts",
                &self
                    .scripts
                    .iter()
                    .map(|script| script_path(script.script, &script.sources))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ScriptRuntime {
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        let sources: Vec<_> = paths.iter().cloned().map(PolicySource::File).collect();
        Self::new(&sources)
    }

    pub fn new(scripts: &[PolicySource]) -> Result<Self> {
        // set up script engine context
        let mut context = rune::Context::with_default_modules()
            .context("Failed to create script engine context")?;

        // install rune modules
        context.install(&rune::modules::core::module()?)?;
        context.install(&rune::modules::fmt::module()?)?;
        context.install(&rune::modules::io::module(true)?)?;
        context.install(&rune::modules::macros::module()?)?;

        // install annotation modules
        let target = log::RuleTarget::default();
        context.install(&log::module(&target)?)?;
        context.install(&type_policy()?)?;

        let runtime_context = Arc::new(context.runtime());

        let scripts = scripts
            .iter()
            .map(|source| -> Result<PolicyScript> {
                let path = source.path();
                let script = match source {
                    PolicySource::File(path) => fs::read_to_string(path)
                        .with_context(|| format!("Failed to read script {path:?}"))?,
                    PolicySource::Script(_, script) => script.clone(),
                };

                let mut sources = Sources::new();
                let script = sources.insert(Source::with_path(
                    path.to_string_lossy(),
                    script,
                    Some(path),
                ));

                let mut diagnostics = Diagnostics::new();
                let result = rune::prepare(&mut sources)
                    .with_context(&context)
                    .with_diagnostics(&mut diagnostics)
                    .build()
                    .with_context(|| format!("Failed to compile script {path:?}"));

                if !diagnostics.is_empty() {
                    let (level, name) = if diagnostics.has_error() {
                        (::log::Level::Error, "error")
                    } else {
                        (::log::Level::Warn, "warning")
                    };
                    ::log::log!(
                        level,
                        "Script {:?} contain {}s, see stderr for details:",
                        path,
                        name
                    );

                    if ::log::log_enabled!(level) {
                        let mut writer = StandardStream::stderr(ColorChoice::Always);
                        diagnostics.emit(&mut writer, &sources)?;
                    }
                }

                let unit = result?;
                ::log::debug!(
                    "Loaded script {:?} with {} functions",
                    path,
                    unit.iter_functions().count()
                );

                Ok(PolicyScript {
                    unit: Arc::new(unit),
                    script,
                    sources,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            context: runtime_context,
            scripts,
            target,
        })
    }

    /// First script in configuration order defining `policy`.
    fn script(&self, policy: Hash) -> Option<&PolicyScript> {
        self.scripts
            .iter()
            .find(|script| script.unit.iter_functions().any(|(hash, _)| hash == policy))
    }
}

impl PolicyRunner for ScriptRuntime {
    fn has_policy(&self, policy: &str) -> bool {
        self.script(Hash::type_hash([policy])).is_some()
    }

    fn run(
        &mut self,
        policy: &str,
        ctx: &mut dyn ExecutionContext,
        invocation: &mut PolicyInvocation,
    ) -> Result<()> {
        let hash = Hash::type_hash([policy]);
        let script = self
            .script(hash)
            .with_context(|| format!("No script defines policy {policy:?}"))?;
        ::log::trace!(
            "Calling policy {:?} in script {:?}",
            policy,
            script_path(script.script, &script.sources)
        );

        self.target.enter(invocation.rule().name());
        let mut state = ScriptState::new(ctx, invocation.rule().name());
        let mut annotation = ScriptAnnotation {
            invocation: invocation.clone(),
        };

        let mut vm = Vm::new(self.context.clone(), script.unit.clone());
        let result = vm.call(hash, (&mut state, &mut annotation));
        process_call_result(result, script.script, &script.sources)?;

        // a firing either applies all of its writes or none
        let known: FxHashSet<String> = ctx
            .registers()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        if let Some((name, _)) = state.writes.iter().find(|(name, _)| !known.contains(name)) {
            bail!("Policy {:?} writes unknown register {:?}", policy, name);
        }

        *invocation = annotation.invocation;
        for (name, value) in state.writes {
            ::log::debug!("policy {:?} sets register {} = {:#x}", policy, name, value);
            ctx.set_register(&name, value)
                .with_context(|| format!("Failed to write register {name:?}"))?;
        }

        Ok(())
    }
}

fn script_path(script: SourceId, sources: &Sources) -> &str {
    sources
        .get(script)
        .map(|source| source.name())
        .unwrap_or("<unknown>")
}

fn process_call_result(
    result: Result<Value, VmError>,
    script: SourceId,
    sources: &Sources,
) -> Result<()> {
    let value = match result {
        Ok(value) => value,
        Err(err) => {
            ::log::error!(
                "Failed to call policy in script {:?}, see stderr for details:",
                script_path(script, sources)
            );
            let mut writer = StandardStream::stderr(ColorChoice::Always);
            err.emit(&mut writer, sources)
                .context("Failed to emit script errors to stderr")?;

            return Err(err).context("Failed to call policy (see stderr for details)");
        }
    };

    match value {
        Value::Unit => Ok(()),
        Value::Result(result) => {
            let result = result
                .borrow_ref()
                .context("Failed to borrow return value as Result")?;

            match &*result {
                Ok(_) => Ok(()),
                Err(Value::Any(any)) => match any.downcast_borrow_ref::<anyhow::Error>() {
                    Ok(error) => bail!("policy returned error: {}", *error),
                    Err(_) => bail!("policy returned error: {:?}", any),
                },
                Err(value) => bail!("policy returned error: {:?}", value),
            }
        }
        value => {
            ::log::warn!(
                "Policy in script {:?} returned unexpected value {:?}",
                script_path(script, sources),
                value
            );
            Ok(())
        }
    }
}

fn type_policy() -> Result<Module> {
    let mut module = Module::new();

    module.ty::<ScriptState>()?;
    module.inst_fn("id", ScriptState::id)?;
    module.inst_fn("pc", ScriptState::pc)?;
    module.inst_fn("rule", ScriptState::rule)?;
    module.inst_fn("register", ScriptState::register)?;
    module.inst_fn("set_register", ScriptState::set_register)?;

    module.ty::<ScriptAnnotation>()?;
    module.inst_fn("set_skip", ScriptAnnotation::set_skip)?;
    module.inst_fn("set_kill", ScriptAnnotation::set_kill)?;
    module.inst_fn("succeed", ScriptAnnotation::succeed)?;
    module.inst_fn("activate_rule", ScriptAnnotation::activate_rule)?;
    module.inst_fn("is_return", ScriptAnnotation::is_return)?;
    module.inst_fn("is_call", ScriptAnnotation::is_call)?;

    Ok(module)
}

/// Snapshot of the execution context, register writes are applied after the policy returns.
#[derive(Debug, Any)]
struct ScriptState {
    id: usize,
    pc: Address,
    rule: String,
    registers: FxHashMap<String, u64>,
    writes: Vec<(String, u64)>,
}

impl ScriptState {
    fn new(ctx: &dyn ExecutionContext, rule: &str) -> Self {
        Self {
            id: ctx.id(),
            pc: ctx.pc(),
            rule: rule.to_string(),
            registers: ctx.registers().into_iter().collect(),
            writes: vec![],
        }
    }

    /**
     * @Article Policy API
     * ## Execution State
     * `state.id()`, `state.pc()`, `state.rule()`
     *
     * Path id, program counter and name of the firing annotation.
     */
    fn id(&self) -> usize {
        self.id
    }

    fn pc(&self) -> i64 {
        self.pc as i64
    }

    fn rule(&self) -> String {
        self.rule.clone()
    }

    /**
     * @Article Policy API
     * ## Registers
     * `state.register(name: &str) -> Option<i64>`
     * `state.set_register(name: &str, value: i64)`
     *
     * Reads see the register values at the time of the firing.
     * Writes are applied once the policy returns, before skip/kill/succeed take effect.
     * A write to a register the path does not have fails the firing without applying any write.
     *
     * Register values and `state.pc()` are the raw 64-bit patterns as `i64`,
     * an all-ones register reads as `-1`.
     *
     * Example:
     * ```rune
     * pub fn fake_license(state, annotation) {
     *     if annotation.is_return() {
     *         state.set_register("eax", 1);
     *     }
     * }
     * ```
     */
    fn register(&self, name: &str) -> Option<i64> {
        self.registers.get(name).map(|value| *value as i64)
    }

    fn set_register(&mut self, name: &str, value: i64) {
        let value = value as u64;
        self.registers.insert(name.to_string(), value);
        self.writes.push((name.to_string(), value));
    }
}

#[derive(Debug, Any)]
struct ScriptAnnotation {
    invocation: PolicyInvocation,
}

impl ScriptAnnotation {
    /**
     * @Article Policy API
     * ## Control Effects
     * `annotation.set_skip(skip: bool)`
     * `annotation.set_kill(kill: bool)`
     * `annotation.succeed()`
     *
     * Kill terminates the path, skip bypasses the intercepted call (call entry only) and
     * succeed marks the path as successful (return and instruction firings only).
     * Kill takes precedence over skip, skip over succeed.
     *
     * Example:
     * ```rune
     * pub fn bypass_check(state, annotation) {
     *     if annotation.is_call() {
     *         annotation.set_skip(true);
     *     }
     * }
     * ```
     */
    fn set_skip(&mut self, skip: bool) {
        self.invocation.set_skip(skip)
    }

    fn set_kill(&mut self, kill: bool) {
        self.invocation.set_kill(kill)
    }

    fn succeed(&mut self) {
        self.invocation.succeed()
    }

    /**
     * @Article Policy API
     * ## Toggle Annotations
     * `annotation.activate_rule(name: &str, active: bool) -> bool`
     *
     * Set the active state of the first annotation called `name`.
     * Returns `false` when no such annotation exists.
     */
    fn activate_rule(&mut self, name: &str, active: bool) -> bool {
        self.invocation.activate_rule(name, active)
    }

    /**
     * @Article Policy API
     * ## Firing Direction
     * `annotation.is_call() -> bool`, `annotation.is_return() -> bool`
     *
     * Both are `false` for instruction annotations.
     */
    fn is_return(&self) -> bool {
        self.invocation.is_return()
    }

    fn is_call(&self) -> bool {
        self.invocation.is_call()
    }
}
