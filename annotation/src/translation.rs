use crate::host::{BlockId, SubscriptionId, Translator};

#[derive(Debug)]
struct TranslationHookState {
    block: BlockId,
    subscription: SubscriptionId,
}

/// Tracks the block currently translated for a tracked module.
///
/// While attached, the per-instruction translation event is subscribed so that matching
/// instructions can request an execution-time firing. Every transition out of the attached state
/// releases the subscription.
#[derive(Debug, Default)]
pub struct TranslationHookMachine {
    attached: Option<TranslationHookState>,
}

impl TranslationHookMachine {
    pub fn attached_block(&self) -> Option<BlockId> {
        self.attached.as_ref().map(|state| state.block)
    }

    /// A new block replaces any prior one, `instrument` decides whether to attach to it.
    pub fn on_block_start(
        &mut self,
        translator: &mut dyn Translator,
        block: BlockId,
        instrument: bool,
    ) -> bool {
        self.detach(translator);

        if instrument {
            let subscription = translator.subscribe_instruction_translation();
            log::trace!("attached to block {:?} ({:?})", block, subscription);
            self.attached = Some(TranslationHookState {
                block,
                subscription,
            });
        }

        instrument
    }

    /// Whether the instruction translated in `block` should be examined.
    pub fn on_instruction_end(&mut self, translator: &mut dyn Translator, block: BlockId) -> bool {
        match &self.attached {
            Some(state) if state.block == block => true,
            Some(state) => {
                log::debug!(
                    "translation of block {:?} interrupted by block {:?}",
                    state.block,
                    block
                );
                self.detach(translator);
                false
            }
            None => false,
        }
    }

    pub fn on_block_end(&mut self, translator: &mut dyn Translator, block: BlockId) {
        if let Some(state) = &self.attached {
            if state.block != block {
                log::debug!(
                    "translation of block {:?} ended while attached to {:?}",
                    block,
                    state.block
                );
            }
        }

        self.detach(translator);
    }

    pub fn detach(&mut self, translator: &mut dyn Translator) -> bool {
        match self.attached.take() {
            Some(state) => {
                log::trace!("detached from block {:?} ({:?})", state.block, state.subscription);
                translator.unsubscribe(state.subscription);
                true
            }
            None => false,
        }
    }
}
