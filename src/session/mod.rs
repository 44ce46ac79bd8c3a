mod flusher;

use crate::config::{Config, ProfileType};
use crate::delta::{DeltaPolicy, DeltaProfile, DeltaProfiler, ProfileKind};
use crate::labels::{LabelSet, TagRegistry, UNLABELED};
use crate::pprof::{Count, CpuCollector};
use crate::profile::{encode_profile, gzip};
use crate::upstream::{UploadJob, Upstream};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
pub use flusher::Flusher;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ulid::Ulid;

/// In-memory sink installed into the collector for the duration of a window.
#[derive(Debug, Clone, Default)]
struct CpuBuffer(Arc<Mutex<Vec<u8>>>);

impl CpuBuffer {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Write for CpuBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type HeapRefresh = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct Window {
    start: DateTime<Utc>,
    running: bool,
}

/// Drives snapshot/flush cycles for one application.
///
/// The session owns one delta profiler per enabled profile kind and borrows
/// the CPU collector handle it was given; it never reaches for global state.
pub struct Session {
    config: Config,
    collector: Arc<CpuCollector>,
    upstream: Arc<dyn Upstream>,
    profilers: Mutex<BTreeMap<ProfileKind, DeltaProfiler>>,
    tags: Mutex<TagRegistry>,
    heap_refresh: Mutex<Option<HeapRefresh>>,
    cpu: CpuBuffer,
    window: Mutex<Window>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("collector", &self.collector)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        config: Config,
        collector: Arc<CpuCollector>,
        upstream: Arc<dyn Upstream>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let profilers: BTreeMap<ProfileKind, DeltaProfiler> = config
            .profile_types
            .iter()
            .filter_map(|t| t.delta_kind())
            .map(|kind| (kind, DeltaProfiler::new(DeltaPolicy::for_kind(kind))))
            .collect();

        Ok(Self {
            config,
            collector,
            upstream,
            profilers: Mutex::new(profilers),
            tags: Mutex::new(TagRegistry::new()),
            heap_refresh: Mutex::new(None),
            cpu: CpuBuffer::default(),
            window: Mutex::new(Window {
                start: Utc::now(),
                running: false,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replaces the delta policy of an enabled kind, dropping its tracked stacks.
    pub fn set_policy(&self, policy: DeltaPolicy) -> anyhow::Result<()> {
        let mut profilers = self.lock_profilers();
        match profilers.get_mut(&policy.kind) {
            Some(profiler) => {
                *profiler = DeltaProfiler::new(policy);
                Ok(())
            }
            None => bail!("profile type {} is not enabled", policy.kind.name()),
        }
    }

    /// Installs the hook that brings the runtime's heap records up to date,
    /// typically by running a collection and feeding the result to
    /// [`Session::record`]. It runs before every heap snapshot unless
    /// `disable_gc_runs` is set.
    pub fn set_heap_refresh(&self, refresh: impl Fn() + Send + Sync + 'static) {
        *self
            .heap_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(refresh));
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut window = self.lock_window();
        if window.running {
            bail!("session already started");
        }

        if self.config.is_enabled(ProfileType::Cpu) {
            self.collector
                .start_cpu_profile(Box::new(self.cpu.clone()))
                .context("failed to start cpu profiling")?;
        }
        window.start = Utc::now();
        window.running = true;

        log::info!("Starting profiling session:");
        log::info!("  AppName:        {}", self.config.application_name);
        log::info!("  Tags:           {:?}", self.config.tags);
        log::info!("  ProfilingTypes: {:?}", self.config.profile_types);
        log::info!("  SampleRate:     {}", self.config.sample_rate);
        log::info!("  UploadRate:     {:?}", self.config.upload_rate());
        log::info!("  DisableGCRuns:  {}", self.config.disable_gc_runs);
        Ok(())
    }

    /// Feeds one decoded runtime record into the delta profiler of `kind`.
    pub fn record(
        &self,
        kind: ProfileKind,
        stack: &[u64],
        tag: u64,
        count: Count,
    ) -> anyhow::Result<()> {
        let mut profilers = self.lock_profilers();
        match profilers.get_mut(&kind) {
            Some(profiler) => {
                profiler.record(stack, tag, count);
                Ok(())
            }
            None => bail!("profile type {} is not enabled", kind.name()),
        }
    }

    /// Like [`Session::record`], with the stack tagged by `labels`. Equal
    /// label sets share a tag; the empty set records untagged.
    pub fn record_labeled(
        &self,
        kind: ProfileKind,
        stack: &[u64],
        labels: &LabelSet,
        count: Count,
    ) -> anyhow::Result<()> {
        let tag = self.lock_tags().tag(labels);
        self.record(kind, stack, tag, count)
    }

    /// Uploads everything collected since the previous flush.
    pub fn flush(&self) -> anyhow::Result<()> {
        self.flush_window(false)
    }

    /// Final flush, then releases the CPU collector if this session holds it.
    pub fn stop(&self) -> anyhow::Result<()> {
        let result = self.flush_window(true);
        if self.config.is_enabled(ProfileType::Cpu) {
            self.collector.reset_collector();
        }
        log::info!("Profiling session stopped");
        result
    }

    /// Starts a new epoch in every delta profiler.
    pub fn rollover(&self) {
        for profiler in self.lock_profilers().values_mut() {
            profiler.rollover();
        }
    }

    /// Spawns a thread flushing on the configured upload rate, unless the
    /// session is configured for manual flushing.
    pub fn spawn_flusher(self: &Arc<Self>) -> anyhow::Result<Option<Flusher>> {
        if self.config.manual_flush {
            return Ok(None);
        }
        self.spawn_flusher_every(self.config.upload_rate()).map(Some)
    }

    pub fn spawn_flusher_every(self: &Arc<Self>, every: Duration) -> anyhow::Result<Flusher> {
        Flusher::spawn(Arc::clone(self), every)
    }

    fn flush_window(&self, last: bool) -> anyhow::Result<()> {
        let mut window = self.lock_window();
        if !window.running {
            bail!("session is not running");
        }

        let start = window.start;
        let end = Utc::now();
        window.start = end;
        if last {
            window.running = false;
        }

        let mut jobs = Vec::new();
        let mut first_err: Option<anyhow::Error> = None;

        if self.config.is_enabled(ProfileType::Cpu) {
            if let Err(e) = self.collector.stop_cpu_profile() {
                first_err = Some(anyhow::Error::from(e).context("failed to stop cpu profiling"));
            }
            let bytes = self.cpu.take();

            if !last {
                if let Err(e) = self.collector.start_cpu_profile(Box::new(self.cpu.clone())) {
                    log::warn!("Failed to restart cpu profiling: {}", e);
                    if first_err.is_none() {
                        first_err =
                            Some(anyhow::Error::from(e).context("failed to restart cpu profiling"));
                    }
                }
            }

            if !bytes.is_empty() {
                jobs.push(self.job(ProfileType::Cpu, start, end, gzip(&bytes)?));
            }
        }

        if self.config.is_enabled(ProfileType::Heap) && !self.config.disable_gc_runs {
            let refresh = self
                .heap_refresh
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(refresh) = refresh {
                refresh();
            }
        }

        {
            let mut profilers = self.lock_profilers();
            for profiler in profilers.values_mut() {
                let mut profile = profiler.snapshot();
                if profile.is_empty() {
                    continue;
                }
                self.attach_labels(&mut profile);
                let payload = encode_profile(&profile)?;
                jobs.push(self.job(profile.kind.into(), start, end, payload));
            }
        }

        log::debug!("Flushing {} profiles", jobs.len());
        for job in jobs {
            let name = job.name.clone();
            if let Err(e) = self.upstream.upload(job) {
                log::warn!("Failed to upload {}: {:#}", name, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn job(
        &self,
        profile_type: ProfileType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> UploadJob {
        UploadJob {
            id: Ulid::new(),
            name: self.config.series_name(profile_type),
            profile_type,
            start,
            end,
            sample_rate: self.config.sample_rate,
            payload,
        }
    }

    fn attach_labels(&self, profile: &mut DeltaProfile) {
        let tags = self.lock_tags();
        for sample in profile.samples.iter() {
            if sample.tag == UNLABELED || profile.labels.contains_key(&sample.tag) {
                continue;
            }
            if let Some(labels) = tags.labels(sample.tag) {
                profile.labels.insert(sample.tag, labels.clone());
            }
        }
    }

    fn lock_tags(&self) -> MutexGuard<'_, TagRegistry> {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_profilers(&self) -> MutexGuard<'_, BTreeMap<ProfileKind, DeltaProfiler>> {
        self.profilers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
