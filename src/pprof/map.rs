use super::arena::{EntryId, EntryPool, StackPool, StackSlice};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Add, AddAssign, Deref, DerefMut, Sub};

/// A pair of counters whose meaning depends on the profile kind:
/// alloc_objects/alloc_bytes for heap, count/duration for mutex and block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    pub v1: i64,
    pub v2: i64,
}

impl Count {
    pub fn new(v1: i64, v2: i64) -> Self {
        Self { v1, v2 }
    }

    pub fn is_zero(&self) -> bool {
        self.v1 == 0 && self.v2 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.v1 < 0 || self.v2 < 0
    }
}

impl Add for Count {
    type Output = Count;

    fn add(self, rhs: Count) -> Count {
        Count {
            v1: self.v1.wrapping_add(rhs.v1),
            v2: self.v2.wrapping_add(rhs.v2),
        }
    }
}

impl AddAssign for Count {
    fn add_assign(&mut self, rhs: Count) {
        *self = *self + rhs;
    }
}

impl Sub for Count {
    type Output = Count;

    fn sub(self, rhs: Count) -> Count {
        Count {
            v1: self.v1.wrapping_sub(rhs.v1),
            v2: self.v2.wrapping_sub(rhs.v2),
        }
    }
}

/// A single (stack, tag) record of a [`StackMap`].
#[derive(Debug, Default)]
pub struct Entry {
    next_hash: Option<EntryId>,
    next_all: Option<EntryId>,
    stk: StackSlice,
    tag: u64,
    /// Counts at the last delta emission.
    pub prev: Count,
    /// Cumulative counts reported by the runtime in the current pass.
    pub acc: Count,
    /// Accumulator for the legacy profile generation.
    pub acc2: Count,
}

impl Entry {
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// Mutable view of an entry returned by [`StackMap::lookup`].
#[derive(Debug)]
pub struct EntryMut<'a> {
    id: EntryId,
    stack: &'a [u64],
    entry: &'a mut Entry,
}

impl EntryMut<'_> {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn stack(&self) -> &[u64] {
        self.stack
    }
}

impl Deref for EntryMut<'_> {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        self.entry
    }
}

impl DerefMut for EntryMut<'_> {
    fn deref_mut(&mut self) -> &mut Entry {
        self.entry
    }
}

/// Shared view of an entry yielded while walking a [`StackMap`].
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    pub id: EntryId,
    pub stack: &'a [u64],
    pub entry: &'a Entry,
}

pub type HashFn = fn(&[u64], u64) -> u64;

/// Order-sensitive rotate-and-accumulate hash over every stack address and the tag.
pub fn stack_hash(stack: &[u64], tag: u64) -> u64 {
    let mut h: u64 = 0;
    for x in stack {
        h = h.rotate_left(8).wrapping_add(x.wrapping_mul(41));
    }
    h.rotate_left(8).wrapping_add(tag.wrapping_mul(41))
}

/// A map from (stack, tag) to [`Entry`].
///
/// It grows without bound for the lifetime of one profiling epoch; dropping
/// the map releases every entry at once. Lookups need `&mut self`, so only one
/// writer can use a map at a time.
#[derive(Debug)]
pub struct StackMap {
    hash: HashMap<u64, EntryId>,
    all: Option<EntryId>,
    last: Option<EntryId>,
    entries: EntryPool<Entry>,
    stacks: StackPool,
    hash_fn: HashFn,
}

impl Default for StackMap {
    fn default() -> Self {
        Self::new()
    }
}

impl StackMap {
    pub fn new() -> Self {
        Self::with_hash_fn(stack_hash)
    }

    pub fn with_hash_fn(hash_fn: HashFn) -> Self {
        Self {
            hash: HashMap::new(),
            all: None,
            last: None,
            entries: EntryPool::default(),
            stacks: StackPool::default(),
            hash_fn,
        }
    }

    /// Returns the entry for (stack, tag), creating it on first sight.
    pub fn lookup(&mut self, stack: &[u64], tag: u64) -> EntryMut<'_> {
        let h = (self.hash_fn)(stack, tag);

        // Find entry if present.
        let mut last: Option<EntryId> = None;
        let mut cur = self.hash.get(&h).copied();
        while let Some(id) = cur {
            let e = self.entries.get(id);
            let next = e.next_hash;
            if e.tag == tag && self.stacks.get(e.stk) == stack {
                // Move to front.
                if let Some(last) = last {
                    self.entries.get_mut(last).next_hash = next;
                    let head = self.hash.insert(h, id);
                    self.entries.get_mut(id).next_hash = head;
                }
                return self.entry_mut(id);
            }
            last = cur;
            cur = next;
        }

        // Add new entry.
        let stk = self.stacks.alloc(stack);
        let id = self.entries.alloc();
        let head = self.hash.insert(h, id);
        {
            let e = self.entries.get_mut(id);
            e.next_hash = head;
            e.stk = stk;
            e.tag = tag;
        }
        match self.last {
            Some(last) => self.entries.get_mut(last).next_all = Some(id),
            None => self.all = Some(id),
        }
        self.last = Some(id);

        self.entry_mut(id)
    }

    pub fn get(&self, id: EntryId) -> EntryRef<'_> {
        let entry = self.entries.get(id);
        EntryRef {
            id,
            stack: self.stacks.get(entry.stk),
            entry,
        }
    }

    /// Number of distinct keys ever looked up.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_none()
    }

    /// Walks every entry once, in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            map: self,
            cur: self.all,
        }
    }

    /// Walks every entry once, in insertion order, with mutable access to its counters.
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&[u64], &mut Entry),
    {
        let mut cur = self.all;
        while let Some(id) = cur {
            let entry = self.entries.get_mut(id);
            f(self.stacks.get(entry.stk), entry);
            cur = entry.next_all;
        }
    }

    /// Number of (entry, address slot) chunks reserved so far.
    pub fn reserved_chunks(&self) -> (usize, usize) {
        (self.entries.chunks(), self.stacks.chunks())
    }

    fn entry_mut(&mut self, id: EntryId) -> EntryMut<'_> {
        let entry = self.entries.get_mut(id);
        EntryMut {
            id,
            stack: self.stacks.get(entry.stk),
            entry,
        }
    }
}

pub struct Iter<'a> {
    map: &'a StackMap,
    cur: Option<EntryId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<EntryRef<'a>> {
        let id = self.cur?;
        let item = self.map.get(id);
        self.cur = item.entry.next_all;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pprof::arena::{ENTRY_CHUNK, STACK_CHUNK};

    fn colliding_hash(_stack: &[u64], _tag: u64) -> u64 {
        42
    }

    #[test]
    fn same_key_returns_same_entry() {
        let mut m = StackMap::new();
        let first = m.lookup(&[0x1, 0x2, 0x3], 0).id();
        let entry = m.lookup(&[0x1, 0x2, 0x3], 0);
        assert_eq!(entry.id(), first);
        assert_eq!(entry.stack(), &[0x1, 0x2, 0x3]);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn permutations_and_tags_are_distinct() {
        let mut m = StackMap::new();
        let a = m.lookup(&[0x1, 0x2], 5).id();
        let b = m.lookup(&[0x2, 0x1], 5).id();
        let c = m.lookup(&[0x1, 0x2], 6).id();
        let d = m.lookup(&[0x1, 0x2, 0x0], 5).id();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn hash_is_order_sensitive() {
        assert_ne!(stack_hash(&[0x1, 0x2], 5), stack_hash(&[0x2, 0x1], 5));
        assert_ne!(stack_hash(&[0x1, 0x2], 5), stack_hash(&[0x1, 0x2], 6));
    }

    #[test]
    fn collisions_never_merge_distinct_keys() {
        let mut m = StackMap::with_hash_fn(colliding_hash);
        let keys: Vec<(Vec<u64>, u64)> = vec![
            (vec![0x1, 0x2, 0x3], 0),
            (vec![0x3, 0x2, 0x1], 0),
            (vec![0x2, 0x1, 0x3], 0),
            (vec![0x1, 0x2, 0x3], 1),
            (vec![], 0),
        ];
        let ids: Vec<EntryId> = keys.iter().map(|(s, t)| m.lookup(s, *t).id()).collect();
        for (i, (s, t)) in keys.iter().enumerate() {
            let e = m.lookup(s, *t);
            assert_eq!(e.id(), ids[i]);
            assert_eq!(e.stack(), s.as_slice());
            assert_eq!(e.tag(), *t);
        }
        assert_eq!(m.len(), keys.len());
    }

    #[test]
    fn hit_moves_entry_to_bucket_front() {
        let mut m = StackMap::with_hash_fn(colliding_hash);
        let a = m.lookup(&[0xa], 0).id();
        let b = m.lookup(&[0xb], 0).id();
        let c = m.lookup(&[0xc], 0).id();
        assert_eq!(m.hash.get(&42), Some(&c));

        m.lookup(&[0xa], 0);
        assert_eq!(m.hash.get(&42), Some(&a));
        // Chain is now a -> c -> b.
        let after_a = m.entries.get(a).next_hash;
        assert_eq!(after_a, Some(c));
        assert_eq!(m.entries.get(c).next_hash, Some(b));
        assert_eq!(m.entries.get(b).next_hash, None);

        // Move from the middle of the chain.
        m.lookup(&[0xc], 0);
        assert_eq!(m.hash.get(&42), Some(&c));
        assert_eq!(m.entries.get(c).next_hash, Some(a));
        assert_eq!(m.entries.get(a).next_hash, Some(b));
    }

    #[test]
    fn global_chain_enumerates_in_insertion_order() {
        let mut m = StackMap::new();
        assert!(m.is_empty());
        assert_eq!(m.iter().count(), 0);

        m.lookup(&[0x10, 0x20], 3);
        let only: Vec<EntryRef> = m.iter().collect();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].stack, &[0x10, 0x20]);
        assert_eq!(only[0].entry.tag(), 3);

        let n = 3 * ENTRY_CHUNK;
        let mut m = StackMap::new();
        for i in 0..n as u64 {
            m.lookup(&[i, i + 1, i * 7], i % 3);
            // Repeated hits must not duplicate chain nodes.
            m.lookup(&[0, 1, 0], 0);
        }
        let stacks: Vec<Vec<u64>> = m.iter().map(|e| e.stack.to_vec()).collect();
        assert_eq!(stacks.len(), n);
        assert_eq!(m.len(), n);
        assert_eq!(stacks[0], vec![0, 1, 0]);
        for i in 1..n as u64 {
            assert_eq!(stacks[i as usize], vec![i, i + 1, i * 7]);
        }
    }

    #[test]
    fn stacks_are_copied_from_caller_buffer() {
        let mut m = StackMap::new();
        let mut buf = vec![0x1, 0x2, 0x3];
        let id = m.lookup(&buf, 0).id();
        buf.copy_from_slice(&[0x9, 0x9, 0x9]);
        assert_eq!(m.get(id).stack, &[0x1, 0x2, 0x3]);
        assert_ne!(m.lookup(&buf, 0).id(), id);
    }

    #[test]
    fn counters_are_updated_in_place() {
        let mut m = StackMap::new();
        m.lookup(&[0x1], 0).acc += Count::new(2, 200);
        m.lookup(&[0x1], 0).acc += Count::new(1, 100);
        m.lookup(&[0x2], 0).acc2 = Count::new(5, 5);

        m.for_each_mut(|_, e| {
            e.prev = e.acc;
        });
        let counts: Vec<(Count, Count)> = m.iter().map(|e| (e.entry.prev, e.entry.acc2)).collect();
        assert_eq!(counts[0], (Count::new(3, 300), Count::default()));
        assert_eq!(counts[1], (Count::default(), Count::new(5, 5)));
    }

    #[test]
    fn arena_chunks_grow_with_distinct_keys() {
        let mut m = StackMap::new();
        let deep: Vec<u64> = (0..100).collect();
        for tag in 0..(ENTRY_CHUNK as u64 + 1) {
            m.lookup(&deep, tag);
        }
        let (entry_chunks, stack_chunks) = m.reserved_chunks();
        assert_eq!(entry_chunks, 2);
        let per_chunk = STACK_CHUNK / deep.len();
        let expected = (ENTRY_CHUNK + 1).div_ceil(per_chunk);
        assert_eq!(stack_chunks, expected);
    }
}
