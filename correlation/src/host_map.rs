//! Host-correlation map
//!
//! Binds a correlation id to what was known at submission time: the
//! placeholder nodes, the CPU timestamp and the submitting thread's activity
//! channel. Entries are created on the application thread and consumed on the
//! monitor thread.
//!
//! Two locking regimes are supported. With [`MapRegime::PerThread`] the map is
//! striped by the thread id embedded in the correlation id, so inserts from
//! different application threads rarely contend. Threads whose ids collide
//! modulo the stripe count share a lock. With
//! [`MapRegime::Shared`] a single lock guards the whole map.

use crate::activity_channel::ActivityChannel;
use crate::config::{Config, MapRegime};
use crate::error::{CorrelationError, Result};
use crate::lock;
use crossbeam::utils::CachePadded;
use gpucorr_shared::{CorrelationId, GpuOpCcts, NormalizedIp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{error, trace};

/// State recorded for one submitted GPU operation
#[derive(Debug, Clone)]
pub struct HostCorrelationEntry {
    pub op_ccts: GpuOpCcts,
    /// Function launched by a kernel submission. Records that do not name
    /// their kernel are attributed to it.
    pub kernel_ip: Option<NormalizedIp>,
    /// Monotonic CPU time of the submission, in nanoseconds
    pub cpu_submit_time: u64,
    pub channel: Weak<ActivityChannel>,
    pub samples: u64,
    /// Known once the sampling summary arrives
    pub total_samples: Option<u64>,
    pub expects_samples: bool,
    /// Set when the operation's own completion record has been resolved
    pub attributed: bool,
    pending: Arc<AtomicUsize>,
}

impl HostCorrelationEntry {
    pub fn new(op_ccts: GpuOpCcts, cpu_submit_time: u64, channel: &Arc<ActivityChannel>) -> Self {
        Self {
            op_ccts,
            kernel_ip: None,
            cpu_submit_time,
            channel: Arc::downgrade(channel),
            samples: 0,
            total_samples: None,
            expects_samples: false,
            attributed: false,
            pending: channel.pending().clone(),
        }
    }

    pub fn with_kernel_ip(mut self, ip: NormalizedIp) -> Self {
        self.kernel_ip = Some(ip).filter(|ip| !ip.is_null());
        self
    }

    /// Keep the entry alive until its PC samples have all arrived
    pub fn expecting_samples(mut self) -> Self {
        self.expects_samples = true;
        self
    }

    /// Channel of the submitting thread, if it still exists
    pub fn channel(&self) -> Option<Arc<ActivityChannel>> {
        self.channel.upgrade()
    }

    fn samples_complete(&self) -> bool {
        self.total_samples.is_some_and(|total| self.samples >= total)
    }

    fn retire(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

type Shard = CachePadded<Mutex<HashMap<CorrelationId, HostCorrelationEntry>>>;

/// Correlation id → submission state
pub struct HostCorrelationMap {
    regime: MapRegime,
    allow_replace: bool,
    shards: Box<[Shard]>,
}

impl HostCorrelationMap {
    /// `shards` is rounded up to a power of two; ignored for the shared regime
    pub fn new(regime: MapRegime, shards: usize, allow_replace: bool) -> Self {
        let count = match regime {
            MapRegime::PerThread => shards.max(1).next_power_of_two(),
            MapRegime::Shared => 1,
        };
        let shards = (0..count)
            .map(|_| CachePadded::new(Mutex::new(HashMap::new())))
            .collect();
        Self {
            regime,
            allow_replace,
            shards,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.map_regime(), config.map_shards, config.allow_replace)
    }

    pub fn regime(&self) -> MapRegime {
        self.regime
    }

    fn shard(&self, id: CorrelationId) -> &Mutex<HashMap<CorrelationId, HostCorrelationEntry>> {
        let idx = match self.regime {
            MapRegime::PerThread => id.thread_id().0 as usize & (self.shards.len() - 1),
            MapRegime::Shared => 0,
        };
        &self.shards[idx]
    }

    /// Install an entry for `id`.
    ///
    /// A live id is a submission-side bug and fails unless replace mode is on.
    pub fn insert(&self, id: CorrelationId, entry: HostCorrelationEntry) -> Result<()> {
        let mut shard = lock(self.shard(id));
        if let Some(old) = shard.get(&id) {
            if !self.allow_replace {
                error!(%id, "correlation id inserted twice");
                return Err(CorrelationError::DuplicateCorrelationId(id));
            }
            old.retire();
        }
        entry.pending.fetch_add(1, Ordering::AcqRel);
        shard.insert(id, entry);
        Ok(())
    }

    pub fn lookup(&self, id: CorrelationId) -> Option<HostCorrelationEntry> {
        lock(self.shard(id)).get(&id).cloned()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        lock(self.shard(id)).contains_key(&id)
    }

    /// Remove `id`; returns false if it was already gone
    pub fn delete(&self, id: CorrelationId) -> bool {
        self.take(id).is_some()
    }

    /// Remove and return the entry in one step
    pub fn take(&self, id: CorrelationId) -> Option<HostCorrelationEntry> {
        let entry = lock(self.shard(id)).remove(&id)?;
        entry.retire();
        Some(entry)
    }

    /// Claim the entry for the operation's own completion record.
    ///
    /// Returns the entry at most once per id. Entries not expecting samples
    /// are removed; sampled entries are only marked so their samples can
    /// still find them.
    pub fn claim(&self, id: CorrelationId) -> Option<HostCorrelationEntry> {
        let mut shard = lock(self.shard(id));
        let entry = shard.get_mut(&id)?;
        if !entry.expects_samples {
            let entry = shard.remove(&id)?;
            entry.retire();
            return Some(entry);
        }
        if entry.attributed {
            trace!(%id, "duplicate completion for sampled operation");
            return None;
        }
        entry.attributed = true;
        Some(entry.clone())
    }

    /// Count `n` more samples for `id`.
    ///
    /// Returns true while more samples are expected, false once the entry is
    /// gone (either removed by this call or never present).
    pub fn samples_increase(&self, id: CorrelationId, n: u64) -> bool {
        self.update_samples(id, |entry| entry.samples += n)
    }

    /// Record how many samples `id` will receive in total.
    ///
    /// Same return convention as [`HostCorrelationMap::samples_increase`].
    pub fn total_samples_update(&self, id: CorrelationId, total: u64) -> bool {
        self.update_samples(id, |entry| entry.total_samples = Some(total))
    }

    fn update_samples<F: FnOnce(&mut HostCorrelationEntry)>(&self, id: CorrelationId, update: F) -> bool {
        let mut shard = lock(self.shard(id));
        let Some(entry) = shard.get_mut(&id) else {
            return false;
        };
        update(entry);
        if !entry.samples_complete() {
            return true;
        }
        if let Some(entry) = shard.remove(&id) {
            trace!(%id, samples = entry.samples, "all samples received");
            entry.retire();
        }
        false
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live id, sorted
    pub fn ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<_> = self
            .shards
            .iter()
            .flat_map(|s| lock(s).keys().copied().collect::<Vec<_>>())
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Vendor-native correlation id → host correlation id.
///
/// Filled from external-correlation records for back-ends whose completion
/// records carry their own ids.
#[derive(Debug, Default)]
pub struct VendorCorrelationMap {
    map: Mutex<HashMap<u64, CorrelationId>>,
}

impl VendorCorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous host id
    pub fn insert(&self, native_id: u64, host_id: CorrelationId) -> Option<CorrelationId> {
        lock(&self.map).insert(native_id, host_id)
    }

    pub fn translate(&self, native_id: u64) -> Option<CorrelationId> {
        lock(&self.map).get(&native_id).copied()
    }

    pub fn remove(&self, native_id: u64) -> Option<CorrelationId> {
        lock(&self.map).remove(&native_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucorr_shared::{AppThreadId, NodeId, PlaceholderKind};
    use std::thread;

    fn entry(channel: &Arc<ActivityChannel>) -> HostCorrelationEntry {
        let mut ccts = GpuOpCcts::default();
        ccts.set(PlaceholderKind::Kernel, NodeId(1));
        HostCorrelationEntry::new(ccts, 100, channel)
    }

    fn id(thread: u16, seq: u64) -> CorrelationId {
        CorrelationId::pack(AppThreadId(thread), seq)
    }

    #[test]
    fn test_insert_lookup_delete() {
        for regime in [MapRegime::PerThread, MapRegime::Shared] {
            let map = HostCorrelationMap::new(regime, 8, false);
            let channel = ActivityChannel::new(AppThreadId(1));
            map.insert(id(1, 1), entry(&channel)).unwrap();

            let found = map.lookup(id(1, 1)).unwrap();
            assert_eq!(found.cpu_submit_time, 100);
            assert!(found.channel().is_some());
            assert_eq!(channel.pending_count(), 1);

            assert!(map.delete(id(1, 1)));
            assert!(!map.delete(id(1, 1)));
            assert!(map.lookup(id(1, 1)).is_none());
            assert_eq!(channel.pending_count(), 0);
        }
    }

    #[test]
    fn test_threads_sharing_a_stripe_keep_separate_entries() {
        let map = HostCorrelationMap::new(MapRegime::PerThread, 2, false);
        let channel = ActivityChannel::new(AppThreadId(1));
        // Thread ids 1 and 3 map to the same stripe
        map.insert(id(1, 1), entry(&channel)).unwrap();
        map.insert(id(3, 1), entry(&channel).with_kernel_ip(NormalizedIp::NULL)).unwrap();
        assert!(std::ptr::eq(map.shard(id(1, 1)), map.shard(id(3, 1))));
        assert_eq!(map.len(), 2);
        assert!(map.take(id(1, 1)).is_some());
        let other = map.lookup(id(3, 1)).unwrap();
        assert_eq!(other.kernel_ip, None);
    }

    #[test]
    fn test_double_insert_fails_without_replace() {
        let map = HostCorrelationMap::new(MapRegime::Shared, 1, false);
        let channel = ActivityChannel::new(AppThreadId(1));
        map.insert(id(1, 1), entry(&channel)).unwrap();
        let err = map.insert(id(1, 1), entry(&channel)).unwrap_err();
        assert!(matches!(err, CorrelationError::DuplicateCorrelationId(x) if x == id(1, 1)));
        assert_eq!(map.len(), 1);
        assert_eq!(channel.pending_count(), 1);
    }

    #[test]
    fn test_replace_mode_swaps_entry() {
        let map = HostCorrelationMap::new(MapRegime::PerThread, 4, true);
        let channel = ActivityChannel::new(AppThreadId(1));
        map.insert(id(1, 1), entry(&channel)).unwrap();
        let mut second = entry(&channel);
        second.cpu_submit_time = 200;
        map.insert(id(1, 1), second).unwrap();
        assert_eq!(map.lookup(id(1, 1)).unwrap().cpu_submit_time, 200);
        assert_eq!(channel.pending_count(), 1);
    }

    #[test]
    fn test_claim_is_at_most_once() {
        let map = HostCorrelationMap::new(MapRegime::Shared, 1, false);
        let channel = ActivityChannel::new(AppThreadId(1));
        map.insert(id(1, 1), entry(&channel)).unwrap();
        assert!(map.claim(id(1, 1)).is_some());
        assert!(map.claim(id(1, 1)).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_sampled_entry_survives_claim_until_samples_done() {
        let map = HostCorrelationMap::new(MapRegime::PerThread, 4, false);
        let channel = ActivityChannel::new(AppThreadId(2));
        map.insert(id(2, 1), entry(&channel).expecting_samples()).unwrap();

        assert!(map.claim(id(2, 1)).is_some());
        assert!(map.claim(id(2, 1)).is_none());
        assert!(map.contains(id(2, 1)));

        assert!(map.samples_increase(id(2, 1), 2));
        assert!(map.total_samples_update(id(2, 1), 3));
        assert!(!map.samples_increase(id(2, 1), 1));
        assert!(!map.contains(id(2, 1)));
        assert!(!map.samples_increase(id(2, 1), 1));
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_total_after_samples_deletes_immediately() {
        let map = HostCorrelationMap::new(MapRegime::Shared, 1, false);
        let channel = ActivityChannel::new(AppThreadId(1));
        map.insert(id(1, 5), entry(&channel).expecting_samples()).unwrap();
        assert!(map.samples_increase(id(1, 5), 4));
        assert!(!map.total_samples_update(id(1, 5), 4));
        assert!(map.is_empty());
    }

    #[test]
    fn test_zero_total_deletes_on_summary() {
        let map = HostCorrelationMap::new(MapRegime::Shared, 1, false);
        let channel = ActivityChannel::new(AppThreadId(1));
        map.insert(id(1, 6), entry(&channel).expecting_samples()).unwrap();
        assert!(!map.total_samples_update(id(1, 6), 0));
        assert!(map.is_empty());
    }

    #[test]
    fn test_concurrent_sample_increments_delete_once() {
        let map = Arc::new(HostCorrelationMap::new(MapRegime::Shared, 1, false));
        let channel = ActivityChannel::new(AppThreadId(1));
        map.insert(id(1, 9), entry(&channel).expecting_samples()).unwrap();
        assert!(map.total_samples_update(id(1, 9), 400));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = map.clone();
                thread::spawn(move || {
                    (0..100)
                        .filter(|_| !map.samples_increase(id(1, 9), 1))
                        .count()
                })
            })
            .collect();
        let finished: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // Only the 400th increment observes the deletion
        assert_eq!(finished, 1);
        assert!(map.is_empty());
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_per_thread_stripes_are_independent() {
        let map = HostCorrelationMap::new(MapRegime::PerThread, 4, false);
        assert_eq!(map.shards.len(), 4);
        let a = ActivityChannel::new(AppThreadId(1));
        let b = ActivityChannel::new(AppThreadId(2));
        map.insert(id(1, 1), entry(&a)).unwrap();
        map.insert(id(2, 1), entry(&b)).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.ids(), vec![id(1, 1), id(2, 1)]);
        assert_eq!(a.pending_count(), 1);
        assert_eq!(b.pending_count(), 1);
    }

    #[test]
    fn test_channel_gone_after_owner_drops() {
        let map = HostCorrelationMap::new(MapRegime::Shared, 1, false);
        let channel = ActivityChannel::new(AppThreadId(3));
        map.insert(id(3, 1), entry(&channel)).unwrap();
        drop(channel);
        let found = map.take(id(3, 1)).unwrap();
        assert!(found.channel().is_none());
    }

    #[test]
    fn test_vendor_map_insert_or_replace() {
        let vendor = VendorCorrelationMap::new();
        assert_eq!(vendor.insert(17, id(1, 1)), None);
        assert_eq!(vendor.insert(17, id(1, 2)), Some(id(1, 1)));
        assert_eq!(vendor.translate(17), Some(id(1, 2)));
        assert_eq!(vendor.remove(17), Some(id(1, 2)));
        assert!(vendor.translate(17).is_none());
        assert!(vendor.is_empty());
    }
}
