mod scale;

use crate::labels::LabelSet;
use crate::pprof::{Count, Entry, StackMap};
pub use scale::{scale_heap_sample, Scaling};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default heap sampling rate of the runtime, in bytes.
pub const DEFAULT_MEM_PROFILE_RATE: i64 = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Heap,
    Mutex,
    Block,
}

impl ProfileKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProfileKind::Heap => "heap",
            ProfileKind::Mutex => "mutex",
            ProfileKind::Block => "block",
        }
    }

    /// (type, unit) of the two counters carried by each sample.
    pub fn sample_types(&self) -> [(&'static str, &'static str); 2] {
        match self {
            ProfileKind::Heap => [("alloc_objects", "count"), ("alloc_space", "bytes")],
            ProfileKind::Mutex | ProfileKind::Block => {
                [("contentions", "count"), ("delay", "nanoseconds")]
            }
        }
    }
}

/// Which accumulator of an entry a profiler writes to and diffs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    /// `acc`, fed by the current runtime record format.
    Current,
    /// `acc2`, fed by the older record format.
    Legacy,
}

impl Generation {
    fn counts_mut<'a>(&self, e: &'a mut Entry) -> &'a mut Count {
        match self {
            Generation::Current => &mut e.acc,
            Generation::Legacy => &mut e.acc2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaPolicy {
    pub kind: ProfileKind,
    pub generation: Generation,
    pub scaling: Scaling,
}

impl DeltaPolicy {
    pub fn for_kind(kind: ProfileKind) -> Self {
        let scaling = match kind {
            ProfileKind::Heap => Scaling::Heap {
                rate: DEFAULT_MEM_PROFILE_RATE,
            },
            ProfileKind::Mutex | ProfileKind::Block => Scaling::None,
        };
        Self {
            kind,
            generation: Generation::Current,
            scaling,
        }
    }

    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = scaling;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaSample {
    pub stack: Vec<u64>,
    pub tag: u64,
    pub value: Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaProfile {
    pub kind: ProfileKind,
    pub epoch: u64,
    pub samples: Vec<DeltaSample>,
    /// Label sets behind the non-zero sample tags.
    pub labels: BTreeMap<u64, LabelSet>,
}

impl DeltaProfile {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Turns cumulative runtime records of one profile kind into per-stack deltas.
///
/// Each pass feeds every runtime record through [`DeltaProfiler::record`] and
/// then calls [`DeltaProfiler::snapshot`]. Records sharing a key within a pass
/// are summed before the delta is taken.
#[derive(Debug)]
pub struct DeltaProfiler {
    policy: DeltaPolicy,
    map: StackMap,
    epoch: u64,
}

impl DeltaProfiler {
    pub fn new(policy: DeltaPolicy) -> Self {
        Self {
            policy,
            map: StackMap::new(),
            epoch: 0,
        }
    }

    pub fn policy(&self) -> &DeltaPolicy {
        &self.policy
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of distinct (stack, tag) keys tracked in the current epoch.
    pub fn tracked(&self) -> usize {
        self.map.len()
    }

    pub fn record(&mut self, stack: &[u64], tag: u64, count: Count) {
        let generation = self.policy.generation;
        let mut entry = self.map.lookup(stack, tag);
        *generation.counts_mut(&mut entry) += count;
    }

    /// Emits the increments accumulated since the previous snapshot.
    ///
    /// Keys whose counts went backwards (runtime reset, or absent from this
    /// pass) are skipped and keep their previous baseline.
    pub fn snapshot(&mut self) -> DeltaProfile {
        let policy = self.policy;
        let mut samples = Vec::new();

        self.map.for_each_mut(|stack, e| {
            let cur = *policy.generation.counts_mut(e);
            e.acc = Count::default();
            e.acc2 = Count::default();

            let delta = cur - e.prev;
            if delta.is_negative() || delta.is_zero() {
                return;
            }
            e.prev = cur;

            let value = policy.scaling.apply(delta);
            if value.is_zero() {
                return;
            }
            samples.push(DeltaSample {
                stack: stack.to_vec(),
                tag: e.tag(),
                value,
            });
        });

        log::debug!(
            "{} delta snapshot: {} of {} stacks changed in epoch {}",
            policy.kind.name(),
            samples.len(),
            self.map.len(),
            self.epoch
        );

        DeltaProfile {
            kind: policy.kind,
            epoch: self.epoch,
            samples,
            labels: BTreeMap::new(),
        }
    }

    /// Drops every tracked key and starts a new epoch. The first snapshot of
    /// the new epoch reports full cumulative counts again.
    pub fn rollover(&mut self) {
        log::info!(
            "{} profiler rolling over epoch {} with {} stacks",
            self.policy.kind.name(),
            self.epoch,
            self.map.len()
        );
        self.map = StackMap::new();
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutex_profiler() -> DeltaProfiler {
        DeltaProfiler::new(DeltaPolicy::for_kind(ProfileKind::Mutex))
    }

    #[test]
    fn first_snapshot_reports_cumulative_counts() {
        let mut d = mutex_profiler();
        d.record(&[0x1, 0x2], 0, Count::new(3, 300));
        d.record(&[0x3], 0, Count::new(1, 10));

        let p = d.snapshot();
        assert_eq!(p.kind, ProfileKind::Mutex);
        assert_eq!(p.samples.len(), 2);
        assert_eq!(p.samples[0].stack, vec![0x1, 0x2]);
        assert_eq!(p.samples[0].value, Count::new(3, 300));
        assert_eq!(p.samples[1].value, Count::new(1, 10));
    }

    #[test]
    fn later_snapshots_report_only_increments() {
        let mut d = mutex_profiler();
        d.record(&[0x1], 0, Count::new(3, 300));
        d.record(&[0x2], 0, Count::new(1, 10));
        d.snapshot();

        d.record(&[0x1], 0, Count::new(5, 450));
        d.record(&[0x2], 0, Count::new(1, 10));
        let p = d.snapshot();
        assert_eq!(p.samples.len(), 1);
        assert_eq!(p.samples[0].stack, vec![0x1]);
        assert_eq!(p.samples[0].value, Count::new(2, 150));
    }

    #[test]
    fn records_with_same_key_are_summed_before_diffing() {
        let mut d = mutex_profiler();
        d.record(&[0x1], 7, Count::new(1, 10));
        d.record(&[0x1], 7, Count::new(2, 20));
        let p = d.snapshot();
        assert_eq!(p.samples.len(), 1);
        assert_eq!(p.samples[0].tag, 7);
        assert_eq!(p.samples[0].value, Count::new(3, 30));
        assert_eq!(d.tracked(), 1);
    }

    #[test]
    fn missing_or_reset_keys_keep_their_baseline() {
        let mut d = mutex_profiler();
        d.record(&[0x1], 0, Count::new(4, 40));
        d.snapshot();

        // Absent from this pass.
        assert!(d.snapshot().is_empty());

        d.record(&[0x1], 0, Count::new(6, 70));
        let p = d.snapshot();
        assert_eq!(p.samples[0].value, Count::new(2, 30));
    }

    #[test]
    fn legacy_generation_uses_second_accumulator() {
        let policy = DeltaPolicy::for_kind(ProfileKind::Block).with_generation(Generation::Legacy);
        let mut d = DeltaProfiler::new(policy);
        d.record(&[0x9], 0, Count::new(2, 2000));
        let p = d.snapshot();
        assert_eq!(p.samples[0].value, Count::new(2, 2000));

        d.record(&[0x9], 0, Count::new(3, 2500));
        assert_eq!(d.snapshot().samples[0].value, Count::new(1, 500));
    }

    #[test]
    fn heap_deltas_are_unsampled() {
        let mut d = DeltaProfiler::new(DeltaPolicy::for_kind(ProfileKind::Heap));
        d.record(&[0x1], 64, Count::new(2, 1 << 30));
        let p = d.snapshot();
        assert_eq!(p.samples[0].value, Count::new(2, 1 << 30));

        let policy = DeltaPolicy::for_kind(ProfileKind::Mutex).with_scaling(Scaling::Fraction(10));
        let mut d = DeltaProfiler::new(policy);
        d.record(&[0x1], 0, Count::new(1, 5));
        assert_eq!(d.snapshot().samples[0].value, Count::new(10, 50));
    }

    #[test]
    fn rollover_starts_a_fresh_epoch() {
        let mut d = mutex_profiler();
        d.record(&[0x1], 0, Count::new(4, 40));
        d.snapshot();
        d.rollover();
        assert_eq!(d.epoch(), 1);
        assert_eq!(d.tracked(), 0);

        d.record(&[0x1], 0, Count::new(5, 50));
        let p = d.snapshot();
        assert_eq!(p.epoch, 1);
        assert_eq!(p.samples[0].value, Count::new(5, 50));
    }
}
