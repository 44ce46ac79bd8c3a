//! Aggregation core of a continuous-profiling client: stack-keyed delta
//! aggregation and a guarded CPU-sampling channel.

pub mod config;
pub mod delta;
pub mod labels;
pub mod pprof;
pub mod profile;
pub mod session;
pub mod upstream;

pub use config::{Config, ProfileType};
pub use delta::{DeltaPolicy, DeltaProfile, DeltaProfiler, ProfileKind};
pub use labels::{current_labels, with_labels, LabelSet, TagRegistry};
pub use pprof::{CollectorError, Count, CpuCollector, SamplingControl, StackMap};
pub use session::Session;
pub use upstream::{UploadJob, Upstream};
