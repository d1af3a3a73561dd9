//! Operation multiplexer
//!
//! Producers (vendor completion threads, application threads issuing flush
//! barriers) each get their own lock-free operation channel, registered
//! lazily on first push. A single monitor thread sweeps every registered
//! channel, hands each item to an [`OperationHandler`] and decrements the
//! item's pending counter once it has been handled.
//!
//! Flush records are held back for one full sweep before they are handed
//! over. Anything pushed on any channel before the flush was pushed is
//! therefore handled before the flush, even though channels are swept in no
//! particular order.

use crate::activity_channel::ActivityChannel;
use crate::error::{CorrelationError, Result};
use crate::lock;
use crate::stats::OPERATION_CHANNELS;
use crossbeam::queue::SegQueue;
use gpucorr_shared::{ActivityKind, GpuActivity};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

static NEXT_MULTIPLEXER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Operation channels this thread has registered, one per multiplexer
    static LOCAL_CHANNELS: RefCell<Vec<Arc<OperationChannel>>> = const { RefCell::new(Vec::new()) };
}

/// One unit of work for the monitor thread
#[derive(Debug)]
pub struct OperationItem {
    /// Activity channel of the thread that initiated the operation, when the
    /// producer already knows it
    pub initiator: Option<Arc<ActivityChannel>>,
    /// Decremented once the item has been handled
    pub pending: Option<Arc<AtomicUsize>>,
    pub activity: GpuActivity,
}

/// Consumer run on the monitor thread
pub trait OperationHandler: Send + 'static {
    fn handle(&mut self, item: OperationItem);

    /// Called after every sweep over all channels
    fn end_of_pass(&mut self) {}
}

/// Per-producer queue
#[derive(Debug)]
pub struct OperationChannel {
    multiplexer: u64,
    queue: SegQueue<OperationItem>,
    closed: AtomicBool,
}

impl OperationChannel {
    fn new(multiplexer: u64) -> Self {
        Self {
            multiplexer,
            queue: SegQueue::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct Shared {
    id: u64,
    channels: Mutex<Vec<Arc<OperationChannel>>>,
    stop: AtomicBool,
}

impl Shared {
    fn channels(&self) -> Vec<Arc<OperationChannel>> {
        lock(&self.channels).clone()
    }

    fn register(&self) -> Arc<OperationChannel> {
        let channel = Arc::new(OperationChannel::new(self.id));
        lock(&self.channels).push(channel.clone());
        OPERATION_CHANNELS.inc();
        debug!(multiplexer = self.id, "registered operation channel");
        channel
    }

    /// Drop channels whose producer thread has exited and that are drained
    fn prune(&self) {
        let mut channels = lock(&self.channels);
        let before = channels.len();
        channels.retain(|c| Arc::strong_count(c) > 1 || !c.is_empty());
        let removed = before - channels.len();
        if removed > 0 {
            OPERATION_CHANNELS.sub(removed as i64);
            trace!(removed, "pruned operation channels of exited threads");
        }
    }
}

/// Fan-in of GPU activity from many producer threads to one monitor thread
pub struct OperationMultiplexer {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    monitor_thread: Thread,
}

impl OperationMultiplexer {
    /// Spawn the monitor thread.
    ///
    /// `idle_wait` bounds how long the monitor sleeps after a sweep that
    /// found nothing to do.
    pub fn start<H: OperationHandler>(name: &str, idle_wait: Duration, handler: H) -> Result<Self> {
        let shared = Arc::new(Shared {
            id: NEXT_MULTIPLEXER_ID.fetch_add(1, Ordering::Relaxed),
            channels: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });

        let monitor_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || monitor_loop(monitor_shared, handler, idle_wait))
            .map_err(CorrelationError::MonitorSpawn)?;
        let monitor_thread = handle.thread().clone();

        info!(multiplexer = shared.id, thread = name, "monitor thread started");
        Ok(Self {
            shared,
            monitor: Mutex::new(Some(handle)),
            monitor_thread,
        })
    }

    /// Enqueue an item on the calling thread's operation channel.
    ///
    /// Never blocks. Fails only after [`OperationMultiplexer::fini`].
    pub fn push(
        &self,
        initiator: Option<Arc<ActivityChannel>>,
        pending: Option<Arc<AtomicUsize>>,
        activity: GpuActivity,
    ) -> Result<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(CorrelationError::MultiplexerStopped);
        }
        let item = OperationItem {
            initiator,
            pending,
            activity,
        };
        self.with_local_channel(|channel| channel.queue.push(item));
        Ok(())
    }

    fn with_local_channel<F: FnOnce(&OperationChannel)>(&self, f: F) {
        LOCAL_CHANNELS.with(|local| {
            let mut local = local.borrow_mut();
            if let Some(channel) = local.iter().find(|c| c.multiplexer == self.shared.id) {
                f(channel);
                return;
            }
            local.retain(|c| !c.closed.load(Ordering::Relaxed));
            let channel = self.shared.register();
            f(&channel);
            local.push(channel);
        })
    }

    /// Nudge the monitor out of its idle wait
    pub fn wake(&self) {
        self.monitor_thread.unpark();
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.load(Ordering::Acquire)
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.shared.channels).len()
    }

    /// Items waiting on all channels
    pub fn queued(&self) -> usize {
        lock(&self.shared.channels).iter().map(|c| c.len()).sum()
    }

    /// Stop the monitor after it has handled everything already queued, and
    /// wait for it to exit. Idempotent.
    pub fn fini(&self) -> Result<()> {
        self.shared.stop.store(true, Ordering::Release);
        let Some(handle) = lock(&self.monitor).take() else {
            return Ok(());
        };
        self.monitor_thread.unpark();
        handle.join().map_err(|_| CorrelationError::MonitorPanicked)?;

        let mut channels = lock(&self.shared.channels);
        for channel in channels.iter() {
            channel.closed.store(true, Ordering::Relaxed);
        }
        OPERATION_CHANNELS.sub(channels.len() as i64);
        channels.clear();
        info!(multiplexer = self.shared.id, "monitor thread stopped");
        Ok(())
    }
}

impl Drop for OperationMultiplexer {
    fn drop(&mut self) {
        if let Err(e) = self.fini() {
            warn!("operation multiplexer shutdown failed: {}", e);
        }
    }
}

fn deliver<H: OperationHandler>(handler: &mut H, mut item: OperationItem) {
    let pending = item.pending.take();
    handler.handle(item);
    if let Some(pending) = pending {
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

fn monitor_loop<H: OperationHandler>(shared: Arc<Shared>, mut handler: H, idle_wait: Duration) {
    // Flushes seen in the previous sweep; released at the end of this one
    let mut held: Vec<OperationItem> = Vec::new();

    loop {
        let stopping = shared.stop.load(Ordering::Acquire);
        let due = std::mem::take(&mut held);
        let mut worked = !due.is_empty();

        for channel in shared.channels() {
            while let Some(item) = channel.queue.pop() {
                worked = true;
                if item.activity.kind() == ActivityKind::Flush {
                    held.push(item);
                } else {
                    deliver(&mut handler, item);
                }
            }
        }

        for item in due {
            deliver(&mut handler, item);
        }
        handler.end_of_pass();
        shared.prune();

        if !worked && held.is_empty() {
            if stopping {
                break;
            }
            thread::park_timeout(idle_wait);
        }
    }
}
