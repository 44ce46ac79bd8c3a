/// Number of records reserved at once when the entry pool runs dry.
pub const ENTRY_CHUNK: usize = 128;

/// Number of address slots reserved at once when the stack pool runs dry.
pub const STACK_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(usize);

impl EntryId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Bulk-allocated record storage. Records are handed out in insertion order and
/// live as long as the pool; there is no way to release a single one.
#[derive(Debug)]
pub struct EntryPool<T> {
    chunks: Vec<Vec<T>>,
}

impl<T> Default for EntryPool<T> {
    fn default() -> Self {
        Self { chunks: Vec::new() }
    }
}

impl<T: Default> EntryPool<T> {
    pub fn alloc(&mut self) -> EntryId {
        let needs_chunk = match self.chunks.last() {
            Some(chunk) => chunk.len() == ENTRY_CHUNK,
            None => true,
        };
        if needs_chunk {
            log::debug!(
                "Entry pool exhausted, reserving chunk #{} of {} records",
                self.chunks.len() + 1,
                ENTRY_CHUNK
            );
            self.chunks.push(Vec::with_capacity(ENTRY_CHUNK));
        }

        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        chunk.push(T::default());
        EntryId(chunk_idx * ENTRY_CHUNK + chunk.len() - 1)
    }
}

impl<T> EntryPool<T> {
    pub fn get(&self, id: EntryId) -> &T {
        &self.chunks[id.0 / ENTRY_CHUNK][id.0 % ENTRY_CHUNK]
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut T {
        &mut self.chunks[id.0 / ENTRY_CHUNK][id.0 % ENTRY_CHUNK]
    }

    pub fn len(&self) -> usize {
        match self.chunks.last() {
            Some(last) => (self.chunks.len() - 1) * ENTRY_CHUNK + last.len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }
}

/// Location of an owned stack inside a [`StackPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackSlice {
    chunk: usize,
    start: usize,
    len: usize,
}

impl StackSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Flat pool of address slots. Stacks are copied into the current chunk; when
/// the remaining tail is too short a fresh chunk is opened and the old tail is
/// abandoned.
#[derive(Debug, Default)]
pub struct StackPool {
    chunks: Vec<Box<[u64]>>,
    used: usize,
}

impl StackPool {
    pub fn alloc(&mut self, stack: &[u64]) -> StackSlice {
        if stack.is_empty() {
            return StackSlice::default();
        }

        let remaining = match self.chunks.last() {
            Some(chunk) => chunk.len() - self.used,
            None => 0,
        };
        if remaining < stack.len() {
            // Stacks deeper than a chunk get a chunk of their own.
            let size = STACK_CHUNK.max(stack.len());
            log::debug!(
                "Stack pool exhausted, reserving chunk #{} of {} slots",
                self.chunks.len() + 1,
                size
            );
            self.chunks.push(vec![0; size].into_boxed_slice());
            self.used = 0;
        }

        let chunk = self.chunks.len() - 1;
        let start = self.used;
        self.chunks[chunk][start..start + stack.len()].copy_from_slice(stack);
        self.used += stack.len();

        StackSlice {
            chunk,
            start,
            len: stack.len(),
        }
    }

    pub fn get(&self, slice: StackSlice) -> &[u64] {
        if slice.len == 0 {
            return &[];
        }
        &self.chunks[slice.chunk][slice.start..slice.start + slice.len]
    }

    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }
}
