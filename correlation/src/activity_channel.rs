//! Activity channels
//!
//! Each application thread owns one channel. Resolved GPU activity records
//! are pushed into it by the monitor thread and drained either by the monitor
//! itself or by the owning thread, depending on where metrics are applied.
//!
//! Channels are also reachable through a process-wide registry keyed by
//! [`AppThreadId`], which is how a completion for a thread-embedded
//! correlation id finds its initiator.

use crate::app_thread;
use crate::error::Result;
use crate::{lock, read, write};
use gpucorr_shared::{AppThreadId, GpuActivity};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Records a channel can hold before its buffer has to grow
pub const ACTIVITY_CHANNEL_CAPACITY: usize = 256;

static REGISTRY: Lazy<RwLock<HashMap<AppThreadId, Arc<ActivityChannel>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

thread_local! {
    static LOCAL: ChannelHandle = ChannelHandle::default();
}

/// Per-thread queue of resolved GPU activity records
#[derive(Debug)]
pub struct ActivityChannel {
    owner: AppThreadId,
    records: Mutex<Vec<GpuActivity>>,
    /// Emptied buffer from the previous drain, swapped back in on the next one
    spare: Mutex<Vec<GpuActivity>>,
    /// GPU operations submitted by the owner whose host entry is still live
    pending: Arc<AtomicUsize>,
}

impl ActivityChannel {
    pub fn new(owner: AppThreadId) -> Arc<Self> {
        Arc::new(Self {
            owner,
            records: Mutex::new(Vec::with_capacity(ACTIVITY_CHANNEL_CAPACITY)),
            spare: Mutex::new(Vec::with_capacity(ACTIVITY_CHANNEL_CAPACITY)),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn owner(&self) -> AppThreadId {
        self.owner
    }

    /// Append a record. Safe from any thread.
    pub fn push(&self, record: GpuActivity) {
        lock(&self.records).push(record);
    }

    /// Detach everything currently queued and visit it in push order.
    ///
    /// Records pushed while the visitor runs are left for the next drain.
    pub fn drain_all<F: FnMut(GpuActivity)>(&self, mut visit: F) -> usize {
        let mut batch = std::mem::take(&mut *lock(&self.spare));
        std::mem::swap(&mut *lock(&self.records), &mut batch);

        let count = batch.len();
        for record in batch.drain(..) {
            visit(record);
        }

        let mut spare = lock(&self.spare);
        if spare.capacity() < batch.capacity() {
            *spare = batch;
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter of the owner's in-flight operations
    pub fn pending(&self) -> &Arc<AtomicUsize> {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Channel registered for `tid`, if that thread is still alive
pub fn lookup_by_thread_id(tid: AppThreadId) -> Option<Arc<ActivityChannel>> {
    read(&REGISTRY).get(&tid).cloned()
}

/// Number of live registered channels
pub fn registered_channels() -> usize {
    read(&REGISTRY).len()
}

/// The calling thread's channel, created and registered on first use
pub fn current() -> Result<Arc<ActivityChannel>> {
    LOCAL.with(|handle| handle.get_or_register())
}

/// The calling thread's channel if it already has one
pub fn try_current() -> Option<Arc<ActivityChannel>> {
    LOCAL
        .try_with(|handle| handle.channel.borrow().clone())
        .ok()
        .flatten()
}

/// Thread-local owner of a channel; unregisters it when the thread exits
#[derive(Default)]
struct ChannelHandle {
    channel: RefCell<Option<Arc<ActivityChannel>>>,
}

impl ChannelHandle {
    fn get_or_register(&self) -> Result<Arc<ActivityChannel>> {
        let mut slot = self.channel.borrow_mut();
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }
        let tid = app_thread::current()?;
        let channel = ActivityChannel::new(tid);
        write(&REGISTRY).insert(tid, channel.clone());
        debug!(thread = %tid, "registered activity channel");
        *slot = Some(channel.clone());
        Ok(channel)
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        let Some(channel) = self.channel.get_mut().take() else {
            return;
        };
        let mut registry = write(&REGISTRY);
        if registry
            .get(&channel.owner)
            .is_some_and(|c| Arc::ptr_eq(c, &channel))
        {
            registry.remove(&channel.owner);
        }
        if !channel.is_empty() {
            debug!(
                thread = %channel.owner,
                records = channel.len(),
                "activity channel closed with undrained records"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucorr_shared::{ActivityDetails, CorrelationId, Counter};
    use std::thread;

    fn counter(id: u64) -> GpuActivity {
        GpuActivity::new(ActivityDetails::Counter(Counter {
            correlation_id: CorrelationId(id),
            ..Default::default()
        }))
    }

    #[test]
    fn test_drain_delivers_each_record_once_in_order() {
        let channel = ActivityChannel::new(AppThreadId(1));
        for i in 1..=10 {
            channel.push(counter(i));
        }

        let mut seen = Vec::new();
        let n = channel.drain_all(|r| seen.push(r.correlation_id().unwrap().0));
        assert_eq!(n, 10);
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());

        let mut again = 0;
        assert_eq!(channel.drain_all(|_| again += 1), 0);
        assert_eq!(again, 0);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_drain_reuses_buffers() {
        let channel = ActivityChannel::new(AppThreadId(1));
        for round in 0..3 {
            for i in 0..100 {
                channel.push(counter(round * 100 + i + 1));
            }
            assert_eq!(channel.drain_all(|_| {}), 100);
        }
        assert!(lock(&channel.records).capacity() >= ACTIVITY_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let channel = ActivityChannel::new(AppThreadId(1));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        channel.push(counter(p * 1000 + i + 1));
                    }
                })
            })
            .collect();

        let mut total = 0;
        while producers.iter().any(|h| !h.is_finished()) {
            total += channel.drain_all(|_| {});
        }
        for h in producers {
            h.join().unwrap();
        }
        total += channel.drain_all(|_| {});
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_registry_follows_thread_lifetime() {
        let (tid, looked_up) = thread::spawn(|| {
            let channel = current().unwrap();
            let again = current().unwrap();
            assert!(Arc::ptr_eq(&channel, &again));
            let found = lookup_by_thread_id(channel.owner()).is_some();
            (channel.owner(), found)
        })
        .join()
        .unwrap();

        assert!(looked_up);
        assert!(lookup_by_thread_id(tid).is_none());
    }

    #[test]
    fn test_try_current_does_not_register() {
        let absent = thread::spawn(|| try_current().is_none()).join().unwrap();
        assert!(absent);
    }
}
