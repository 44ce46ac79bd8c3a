//! Profiling labels attached by application code, interned into the opaque
//! `tag` that keeps otherwise identical stacks apart.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Tag of samples recorded without labels.
pub const UNLABELED: u64 = 0;

/// An ordered set of `key=value` labels, e.g. `{endpoint=/checkout}`.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, returning the value it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `self` with every label of `inner` laid over it.
    pub fn merged(&self, inner: &LabelSet) -> LabelSet {
        let mut out = self.clone();
        for (k, v) in inner.0.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Assigns every distinct label set a stable tag.
///
/// Tags start at 1 and are never reused; the empty set is always
/// [`UNLABELED`].
#[derive(Debug, Default)]
pub struct TagRegistry {
    tags: HashMap<LabelSet, u64>,
    sets: Vec<LabelSet>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&mut self, labels: &LabelSet) -> u64 {
        if labels.is_empty() {
            return UNLABELED;
        }
        if let Some(tag) = self.tags.get(labels) {
            return *tag;
        }

        self.sets.push(labels.clone());
        let tag = self.sets.len() as u64;
        self.tags.insert(labels.clone(), tag);
        log::debug!("Label set {} interned as tag {}", labels, tag);
        tag
    }

    pub fn labels(&self, tag: u64) -> Option<&LabelSet> {
        match tag {
            UNLABELED => None,
            tag => self.sets.get(tag as usize - 1),
        }
    }

    /// Number of interned non-empty sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

thread_local! {
    static CURRENT: RefCell<LabelSet> = RefCell::new(LabelSet::new());
}

struct Restore(Option<LabelSet>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(outer) = self.0.take() {
            CURRENT.with(|current| *current.borrow_mut() = outer);
        }
    }
}

/// Runs `f` with `labels` added to the calling thread's current labels.
/// Scopes nest; the outer labels come back when `f` returns or unwinds.
pub fn with_labels<R>(labels: &LabelSet, f: impl FnOnce() -> R) -> R {
    let outer = CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let merged = current.merged(labels);
        std::mem::replace(&mut *current, merged)
    });
    let _restore = Restore(Some(outer));
    f()
}

/// Labels in effect on the calling thread.
pub fn current_labels() -> LabelSet {
    CURRENT.with(|current| current.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn equal_sets_share_a_tag() {
        let mut registry = TagRegistry::new();
        let a = registry.tag(&set(&[("endpoint", "/a"), ("region", "eu")]));
        let b = registry.tag(&set(&[("region", "eu"), ("endpoint", "/a")]));
        let c = registry.tag(&set(&[("endpoint", "/b")]));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, UNLABELED);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.labels(c).unwrap().get("endpoint"), Some("/b"));
    }

    #[test]
    fn empty_set_is_unlabeled() {
        let mut registry = TagRegistry::new();
        assert_eq!(registry.tag(&LabelSet::new()), UNLABELED);
        assert!(registry.is_empty());
        assert!(registry.labels(UNLABELED).is_none());
        assert!(registry.labels(7).is_none());
    }

    #[test]
    fn display_lists_labels_in_key_order() {
        let labels = set(&[("b", "2"), ("a", "1")]);
        assert_eq!(labels.to_string(), "{a=1,b=2}");
        assert_eq!(LabelSet::new().to_string(), "{}");
    }

    #[test]
    fn scopes_nest_and_restore() {
        assert!(current_labels().is_empty());
        with_labels(&set(&[("endpoint", "/a"), ("tier", "web")]), || {
            with_labels(&set(&[("endpoint", "/b")]), || {
                let inner = current_labels();
                assert_eq!(inner.get("endpoint"), Some("/b"));
                assert_eq!(inner.get("tier"), Some("web"));
            });
            assert_eq!(current_labels().get("endpoint"), Some("/a"));
        });
        assert!(current_labels().is_empty());
    }

    #[test]
    fn scope_is_restored_after_a_panic() {
        let result = std::panic::catch_unwind(|| {
            with_labels(&set(&[("k", "v")]), || panic!("boom"));
        });
        assert!(result.is_err());
        assert!(current_labels().is_empty());
    }

    #[test]
    fn scopes_are_per_thread() {
        with_labels(&set(&[("k", "v")]), || {
            let other = std::thread::spawn(current_labels).join().unwrap();
            assert!(other.is_empty());
        });
    }
}
