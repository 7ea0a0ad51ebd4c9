use crate::{
    host::{ExecutionContext, Host, ModuleDescriptor, SubscriptionId, Translator},
    rule::{RuleIndex, RuleKind},
};

/// Arms rules when the module they belong to is loaded.
///
/// Call rules get a call hook per loaded module instance. Instruction rules share a single
/// block translation subscription, acquired on the first load of a module with instruction rules.
#[derive(Debug, Default)]
pub struct ModuleActivationTracker {
    block_translation: Option<SubscriptionId>,
}

impl ModuleActivationTracker {
    pub fn is_translation_subscribed(&self) -> bool {
        self.block_translation.is_some()
    }

    /// Returns the number of rules armed for `module`.
    pub fn on_module_load(
        &mut self,
        host: &mut Host<'_>,
        ctx: &mut dyn ExecutionContext,
        rules: &RuleIndex,
        module: &ModuleDescriptor,
    ) -> usize {
        let id = match host.modules.module_id(module) {
            Some(id) => id,
            None => {
                log::trace!("module {} is not tracked", module);
                return 0;
            }
        };

        let rules = rules.for_module(&id);
        for rule in rules {
            if !module.contains_native(rule.address()) {
                log::warn!(
                    "address of annotation {} exceeds the size of the loaded module {}",
                    rule,
                    module
                );
            }

            match rule.kind() {
                RuleKind::Instruction { .. } => {
                    if self.block_translation.is_none() {
                        let subscription = host.translator.subscribe_block_translation();
                        log::debug!(
                            "subscribed to block translation ({:?}) for annotation {}",
                            subscription,
                            rule
                        );
                        self.block_translation = Some(subscription);
                    }
                }
                RuleKind::Call { .. } => {
                    let pc = module.to_runtime(rule.address());
                    log::debug!(
                        "arming call hook for annotation {} at {:#x} in pid {}",
                        rule,
                        pc,
                        module.pid
                    );
                    host.calls
                        .register_call_hook(ctx, pc, module.pid, rule.clone());
                }
            }
        }

        rules.len()
    }

    pub fn shutdown(&mut self, translator: &mut dyn Translator) {
        if let Some(subscription) = self.block_translation.take() {
            log::debug!("releasing block translation subscription {:?}", subscription);
            translator.unsubscribe(subscription);
        }
    }
}
