use std::io::{self, Write};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Records held back before they are drained to the installed sink.
pub const BUFFERED_RECORDS: usize = 64;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("cpu profiling already in use")]
    AlreadyActive,

    #[error("failed to flush cpu profile records: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    /// The sampling source is being switched on. No sink is installed yet.
    Starting,
    Profiling,
    /// The sampling source is being switched off and the old sink flushed.
    Stopping,
}

/// Switches the runtime's sampling source on and off.
///
/// Both calls are made without the collector lock held, while the collector
/// is in its `Starting` or `Stopping` phase.
pub trait SamplingControl: Send + Sync {
    fn enable(&self) -> io::Result<()>;

    fn disable(&self);
}

struct Slot {
    state: CollectorState,
    sink: Option<Box<dyn Write + Send>>,
    pending: Vec<Vec<u8>>,
    /// Set while a full buffer is written out by `deliver`. The sink is
    /// checked out of the slot for that time.
    draining: bool,
    /// Number of stops that ran to completion.
    stops: u64,
}

/// Guard around the single CPU-sampling channel.
///
/// Exactly one sink receives sample records at a time. The guard is an owned
/// handle; share it with `Arc` between the threads driving a profiling session
/// and the thread delivering samples.
pub struct CpuCollector {
    slot: Mutex<Slot>,
    /// Signalled on every state change and at the end of every drain.
    changed: Condvar,
    control: Option<Box<dyn SamplingControl>>,
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.lock_slot();
        f.debug_struct("CpuCollector")
            .field("state", &slot.state)
            .field("installed", &slot.sink.is_some())
            .field("pending", &slot.pending.len())
            .field("draining", &slot.draining)
            .field("controlled", &self.control.is_some())
            .finish()
    }
}

impl CpuCollector {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: CollectorState::Idle,
                sink: None,
                pending: Vec::new(),
                draining: false,
                stops: 0,
            }),
            changed: Condvar::new(),
            control: None,
        }
    }

    /// A collector that switches `control` on for every start and off for
    /// every stop.
    pub fn with_control(control: impl SamplingControl + 'static) -> Self {
        Self {
            control: Some(Box::new(control)),
            ..Self::new()
        }
    }

    /// Installs `sink` as the receiver of subsequent sample records.
    pub fn start_cpu_profile(&self, sink: Box<dyn Write + Send>) -> Result<(), CollectorError> {
        let mut slot = self.lock_slot();
        if slot.state != CollectorState::Idle || slot.sink.is_some() {
            return Err(CollectorError::AlreadyActive);
        }
        slot.state = CollectorState::Starting;
        slot.pending.clear();
        drop(slot);

        let enabled = match self.control.as_ref() {
            Some(control) => control.enable(),
            None => Ok(()),
        };

        let mut slot = self.lock_slot();
        let result = match enabled {
            Ok(()) => {
                slot.sink = Some(sink);
                slot.state = CollectorState::Profiling;
                Ok(())
            }
            Err(e) => {
                slot.state = CollectorState::Idle;
                Err(e)
            }
        };
        drop(slot);
        self.changed.notify_all();

        match result {
            Ok(()) => {
                log::info!("CPU collector installed");
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to enable CPU sampling: {}", e);
                Err(e.into())
            }
        }
    }

    /// Flushes buffered records to the installed sink and uninstalls it.
    ///
    /// Stopping an idle collector does nothing. A flush failure is reported
    /// only after the channel has been released.
    pub fn stop_cpu_profile(&self) -> Result<(), CollectorError> {
        let mut slot = self.lock_slot();
        loop {
            let state = slot.state;
            match state {
                CollectorState::Idle => return Ok(()),
                CollectorState::Stopping => {
                    // Another thread is tearing down; wait for it instead of racing.
                    let seen = slot.stops;
                    while slot.stops == seen {
                        slot = self.wait(slot);
                    }
                    return Ok(());
                }
                CollectorState::Starting => slot = self.wait(slot),
                CollectorState::Profiling if slot.draining => slot = self.wait(slot),
                CollectorState::Profiling => break,
            }
        }

        match self.teardown(slot) {
            Ok(()) => {
                log::info!("CPU collector stopped");
                Ok(())
            }
            Err(e) => {
                log::warn!("CPU collector stopped, flushing records failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Clears the installed collector.
    ///
    /// A stop already in flight is waited for. A profile that is still
    /// running is torn down here, flushing its buffered records first. Once
    /// this returns the slot is empty, no record reaches the old sink and the
    /// channel is free for a new start.
    pub fn reset_collector(&self) {
        let mut slot = self.lock_slot();
        loop {
            let state = slot.state;
            match state {
                CollectorState::Idle => break,
                CollectorState::Starting | CollectorState::Stopping => slot = self.wait(slot),
                CollectorState::Profiling if slot.draining => slot = self.wait(slot),
                CollectorState::Profiling => {
                    if let Err(e) = self.teardown(slot) {
                        log::warn!("CPU collector reset, flushing records failed: {}", e);
                    }
                    slot = self.lock_slot();
                }
            }
        }

        slot.sink = None;
        slot.pending.clear();
        log::debug!("CPU collector reset");
    }

    /// Hands a raw sample record to the installed sink.
    ///
    /// Returns `false` when no profile is running and the record was dropped.
    /// A full buffer is written out without the collector lock held.
    pub fn deliver(&self, record: &[u8]) -> bool {
        let mut slot = self.lock_slot();
        if slot.state != CollectorState::Profiling {
            return false;
        }

        slot.pending.push(record.to_vec());
        if slot.draining || slot.pending.len() < BUFFERED_RECORDS {
            return true;
        }
        let Some(mut sink) = slot.sink.take() else {
            return true;
        };
        let pending = std::mem::take(&mut slot.pending);
        slot.draining = true;
        drop(slot);

        let result = write_records(&mut *sink, pending);

        let mut slot = self.lock_slot();
        slot.sink = Some(sink);
        slot.draining = false;
        drop(slot);
        self.changed.notify_all();

        if let Err(e) = result {
            log::warn!("Failed to drain CPU records to collector: {}", e);
        }
        true
    }

    pub fn state(&self) -> CollectorState {
        self.lock_slot().state
    }

    /// Whether a sink is currently installed.
    pub fn is_active(&self) -> bool {
        let slot = self.lock_slot();
        slot.sink.is_some() || slot.draining
    }

    /// Switches sampling off and flushes the sink out of a `Profiling` slot
    /// that is not draining, then marks the channel idle.
    fn teardown(&self, mut slot: MutexGuard<'_, Slot>) -> io::Result<()> {
        slot.state = CollectorState::Stopping;
        let sink = slot.sink.take();
        let pending = std::mem::take(&mut slot.pending);
        drop(slot);

        if let Some(control) = self.control.as_ref() {
            control.disable();
        }
        let result = match sink {
            Some(mut sink) => write_records(&mut *sink, pending),
            None => Ok(()),
        };

        let mut slot = self.lock_slot();
        slot.state = CollectorState::Idle;
        slot.stops += 1;
        drop(slot);
        self.changed.notify_all();
        result
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, slot: MutexGuard<'a, Slot>) -> MutexGuard<'a, Slot> {
        self.changed
            .wait(slot)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_records(sink: &mut dyn Write, records: Vec<Vec<u8>>) -> io::Result<()> {
    for record in records.iter() {
        sink.write_all(record)?;
    }
    sink.flush()
}
