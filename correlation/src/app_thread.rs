//! Application thread ids
//!
//! Every thread that submits GPU operations gets a small process-unique id on
//! first use. The id is embedded in correlation ids so a completion arriving
//! on a vendor thread can be routed back without a table lookup.

use crate::error::{CorrelationError, Result};
use gpucorr_shared::AppThreadId;
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Next id to hand out; 0 is reserved
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static CURRENT: Cell<AppThreadId> = const { Cell::new(AppThreadId::NONE) };
}

/// Id of the calling thread, assigned on first call.
///
/// Fails once the 16-bit id space is used up. Ids are never recycled, so a
/// correlation id outliving its thread can't be misrouted to a new thread.
pub fn current() -> Result<AppThreadId> {
    CURRENT.with(|cell| {
        let id = cell.get();
        if !id.is_none() {
            return Ok(id);
        }
        let id = allocate()?;
        cell.set(id);
        Ok(id)
    })
}

/// Id of the calling thread if one was already assigned
pub fn try_current() -> Option<AppThreadId> {
    CURRENT
        .try_with(|cell| cell.get())
        .ok()
        .filter(|id| !id.is_none())
}

fn allocate() -> Result<AppThreadId> {
    NEXT_THREAD_ID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
            (next <= u16::MAX as u32).then_some(next + 1)
        })
        .map(|id| AppThreadId(id as u16))
        .map_err(|next| {
            tracing::error!("application thread id space exhausted");
            CorrelationError::ThreadIdExhausted(next - 1)
        })
}
