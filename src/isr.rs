//! Interrupt-context entry points.
//!
//! Both operations mask interrupts on the target core, touch one queue and
//! return. They never allocate while the queue stays within its reserved
//! capacity and never take the inter-core mutex.

use crate::dsp::DspShared;
use crate::msg::Message;
use std::sync::Arc;

/// Handle an interrupt handler uses to talk to its core.
#[derive(Clone)]
pub struct IsrHandle {
    core: u32,
    shared: Arc<DspShared>,
}

impl IsrHandle {
    pub(crate) fn new(core: u32, shared: Arc<DspShared>) -> Self {
        Self { core, shared }
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    /// Queue `msg` for dispatch on the core.
    pub fn schedule(&self, msg: Message) {
        let platform = &*self.shared.platform;
        let was_empty = self.shared.cores[self.core as usize]
            .isr
            .with(platform, |q| q.schedule.enqueue(msg));
        if was_empty {
            platform.ipi_assert(self.core);
        }
    }

    /// Queue `msg` to be returned to its originator by the core.
    pub fn complete(&self, msg: Message) {
        let platform = &*self.shared.platform;
        let was_empty = self.shared.cores[self.core as usize]
            .isr
            .with(platform, |q| q.complete.enqueue(msg));
        if was_empty {
            platform.ipi_assert(self.core);
        }
    }
}

impl std::fmt::Debug for IsrHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsrHandle").field("core", &self.core).finish()
    }
}
