//! Correlation id generation and the per-thread correlation id stack

use crate::config::IdScheme;
use gpucorr_shared::{AppThreadId, CorrelationId};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter for [`IdScheme::GlobalCounter`]
static GLOBAL_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread sequence for [`IdScheme::ThreadEmbedded`]
    static SEQUENCE: Cell<u64> = const { Cell::new(1) };

    /// Ids pushed for the vendor side channel, innermost last
    static ID_STACK: RefCell<Vec<CorrelationId>> = const { RefCell::new(Vec::new()) };
}

/// Hands out correlation ids. Never blocks and never fails.
#[derive(Debug, Clone, Copy)]
pub struct IdGenerator {
    scheme: IdScheme,
}

impl IdGenerator {
    pub fn new(scheme: IdScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> IdScheme {
        self.scheme
    }

    /// Fresh id for an operation submitted by `thread`, the calling thread.
    pub fn next_id(&self, thread: AppThreadId) -> CorrelationId {
        match self.scheme {
            IdScheme::ThreadEmbedded => {
                let seq = SEQUENCE.with(|s| {
                    let seq = s.get();
                    s.set(seq.wrapping_add(1));
                    seq
                });
                CorrelationId::pack(thread, seq)
            }
            IdScheme::GlobalCounter => CorrelationId(GLOBAL_COUNTER.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Thread that produced `id`, when the scheme embeds it
    pub fn extract_thread_id(&self, id: CorrelationId) -> Option<AppThreadId> {
        match self.scheme {
            IdScheme::ThreadEmbedded if !id.is_sentinel() => Some(id.thread_id()),
            _ => None,
        }
    }
}

/// Push `id` for the vendor API call about to be made on this thread
pub fn correlation_id_push(id: CorrelationId) {
    ID_STACK.with(|s| s.borrow_mut().push(id));
}

/// Pop the innermost pushed id
pub fn correlation_id_pop() -> Option<CorrelationId> {
    ID_STACK.with(|s| s.borrow_mut().pop())
}

/// Innermost pushed id without removing it
pub fn correlation_id_top() -> Option<CorrelationId> {
    ID_STACK.with(|s| s.borrow().last().copied())
}
