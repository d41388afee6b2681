// Generic synchronized map. One mutex per instance serializes every
// operation; derived operations (filter, map_values, merge, ...) iterate a
// detached snapshot, so caller closures run outside the lock and may re-enter
// the same instance without deadlocking. Cross-instance operations snapshot
// the other side and release its lock before taking their own, never holding
// two locks at once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::iter::FromIterator;

pub struct SyncMap<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K, V> SyncMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::with_capacity(cap)),
        }
    }

    // plain owned copy of the current contents, the lock is released on return
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.inner.lock().clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    // Some inserts, None removes; either way the previous association comes
    // back from the same lock hold, so check-and-write is one atomic step
    pub fn set(&self, key: K, value: Option<V>) -> Option<V> {
        let mut map = self.inner.lock();
        match value {
            Some(value) => map.insert(key, value),
            None => map.remove(&key),
        }
    }

    pub fn clear(&self, keep_capacity: bool) {
        let mut map = self.inner.lock();
        debug!("clearing {} entries", map.len());
        if keep_capacity {
            map.clear();
        } else {
            *map = HashMap::new();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.lock().values().cloned().collect()
    }

    // removes some entry, the underlying map imposes no order
    pub fn pop_first(&self) -> Option<(K, V)> {
        let mut map = self.inner.lock();
        let key = map.keys().next()?.clone();
        let value = map.remove(&key)?;
        Some((key, value))
    }

    pub fn drop_first(&self, n: usize) -> Self {
        self.snapshot().into_iter().skip(n).collect()
    }

    pub fn filter<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.snapshot()
            .into_iter()
            .filter(|(k, v)| predicate(k, v))
            .collect()
    }

    pub fn try_filter<E, F>(&self, mut predicate: F) -> Result<Self, E>
    where
        F: FnMut(&K, &V) -> Result<bool, E>,
    {
        let mut out = HashMap::new();
        for (key, value) in self.snapshot() {
            if predicate(&key, &value)? {
                out.insert(key, value);
            }
        }
        Ok(out.into())
    }

    pub fn map_values<U, F>(&self, mut transform: F) -> SyncMap<K, U>
    where
        F: FnMut(V) -> U,
    {
        self.snapshot()
            .into_iter()
            .map(|(k, v)| (k, transform(v)))
            .collect()
    }

    pub fn try_map_values<U, E, F>(&self, mut transform: F) -> Result<SyncMap<K, U>, E>
    where
        F: FnMut(V) -> Result<U, E>,
    {
        let mut out = HashMap::new();
        for (key, value) in self.snapshot() {
            out.insert(key, transform(value)?);
        }
        Ok(out.into())
    }

    pub fn compact_map_values<U, F>(&self, mut transform: F) -> SyncMap<K, U>
    where
        F: FnMut(V) -> Option<U>,
    {
        self.snapshot()
            .into_iter()
            .filter_map(|(k, v)| transform(v).map(|u| (k, u)))
            .collect()
    }

    pub fn try_compact_map_values<U, E, F>(&self, mut transform: F) -> Result<SyncMap<K, U>, E>
    where
        F: FnMut(V) -> Result<Option<U>, E>,
    {
        let mut out = HashMap::new();
        for (key, value) in self.snapshot() {
            if let Some(mapped) = transform(value)? {
                out.insert(key, mapped);
            }
        }
        Ok(out.into())
    }

    // combine(existing, incoming) decides overlapping keys, fresh keys take
    // the incoming value as-is; duplicates inside `pairs` fold left to right
    fn stage<I, F>(current: &HashMap<K, V>, pairs: I, combine: &mut F) -> HashMap<K, V>
    where
        I: IntoIterator<Item = (K, V)>,
        F: FnMut(&V, V) -> V,
    {
        let mut staged = HashMap::new();
        for (key, incoming) in pairs {
            let merged = match staged.get(&key).or_else(|| current.get(&key)) {
                Some(existing) => combine(existing, incoming),
                None => incoming,
            };
            staged.insert(key, merged);
        }
        staged
    }

    fn try_stage<I, E, F>(
        current: &HashMap<K, V>,
        pairs: I,
        combine: &mut F,
    ) -> Result<HashMap<K, V>, E>
    where
        I: IntoIterator<Item = (K, V)>,
        F: FnMut(&V, V) -> Result<V, E>,
    {
        let mut staged = HashMap::new();
        for (key, incoming) in pairs {
            let merged = match staged.get(&key).or_else(|| current.get(&key)) {
                Some(existing) => combine(existing, incoming)?,
                None => incoming,
            };
            staged.insert(key, merged);
        }
        Ok(staged)
    }

    // combine runs against a snapshot, outside the lock; only the fully
    // staged result is committed
    pub fn merge<I, F>(&self, pairs: I, mut combine: F)
    where
        I: IntoIterator<Item = (K, V)>,
        F: FnMut(&V, V) -> V,
    {
        let staged = Self::stage(&self.snapshot(), pairs, &mut combine);
        trace!("merge: committing {} staged entries", staged.len());
        self.inner.lock().extend(staged);
    }

    // nothing is committed unless every combine call succeeds
    pub fn try_merge<I, E, F>(&self, pairs: I, mut combine: F) -> Result<(), E>
    where
        I: IntoIterator<Item = (K, V)>,
        F: FnMut(&V, V) -> Result<V, E>,
    {
        let staged = Self::try_stage(&self.snapshot(), pairs, &mut combine)?;
        self.inner.lock().extend(staged);
        Ok(())
    }

    pub fn merging<I, F>(&self, pairs: I, mut combine: F) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        F: FnMut(&V, V) -> V,
    {
        let mut snap = self.snapshot();
        let staged = Self::stage(&snap, pairs, &mut combine);
        snap.extend(staged);
        snap.into()
    }

    pub fn try_merging<I, E, F>(&self, pairs: I, mut combine: F) -> Result<Self, E>
    where
        I: IntoIterator<Item = (K, V)>,
        F: FnMut(&V, V) -> Result<V, E>,
    {
        let mut snap = self.snapshot();
        let staged = Self::try_stage(&snap, pairs, &mut combine)?;
        snap.extend(staged);
        Ok(snap.into())
    }

    // other's lock is taken and released inside snapshot() before we touch
    // our own, so mutual concurrent merges cannot deadlock and
    // map.merge_from(&map, ..) is fine
    pub fn merge_from<F>(&self, other: &SyncMap<K, V>, combine: F)
    where
        F: FnMut(&V, V) -> V,
    {
        self.merge(other.snapshot(), combine);
    }

    pub fn merging_from<F>(&self, other: &SyncMap<K, V>, combine: F) -> Self
    where
        F: FnMut(&V, V) -> V,
    {
        self.merging(other.snapshot(), combine)
    }
}

impl<K, V> From<HashMap<K, V>> for SyncMap<K, V> {
    fn from(map: HashMap<K, V>) -> Self {
        Self {
            inner: Mutex::new(map),
        }
    }
}

impl<K: Hash + Eq, V> FromIterator<(K, V)> for SyncMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter().collect::<HashMap<K, V>>().into()
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

// deep copy, the new instance never aliases the source's storage
impl<K, V> Clone for SyncMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        self.snapshot().into()
    }
}

// two sequential snapshots, never both locks at once
impl<K, V> PartialEq for SyncMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl<K, V> Eq for SyncMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Eq,
{
}

impl<K, V> fmt::Debug for SyncMap<K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.lock().iter()).finish()
    }
}
