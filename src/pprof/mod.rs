pub mod arena;
mod collector;
mod map;

pub use arena::{EntryId, ENTRY_CHUNK, STACK_CHUNK};
pub use collector::{
    CollectorError, CollectorState, CpuCollector, SamplingControl, BUFFERED_RECORDS,
};
pub use map::{stack_hash, Count, Entry, EntryMut, EntryRef, HashFn, Iter, StackMap};
