//! Dependency sets.
//!
//! A `Deps` names every transaction that must be ordered before a given
//! transaction: key-domain dependencies per key, range-domain dependencies
//! per range, and direct ids (sync points witnessed without a key). All three
//! components are kept sorted so union and subtraction are linear merges.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::keys::{Key, KeyRange, Ranges};
use crate::txn::TxnId;

fn merge_ids(a: &[TxnId], b: &[TxnId]) -> Vec<TxnId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Per-key dependency multimap for key-domain transactions.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KeyDeps {
    map: BTreeMap<Key, Vec<TxnId>>,
}

impl KeyDeps {
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn insert(&mut self, key: Key, id: TxnId) {
        let ids = self.map.entry(key).or_default();
        if let Err(at) = ids.binary_search(&id) {
            ids.insert(at, id);
        }
    }

    pub fn ids_for(&self, key: &Key) -> &[TxnId] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.map.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &[TxnId])> {
        self.map.iter().map(|(k, v)| (k, v.as_slice()))
    }

    fn union(&self, other: &KeyDeps) -> KeyDeps {
        let mut map = self.map.clone();
        for (key, ids) in &other.map {
            match map.get_mut(key) {
                Some(existing) => *existing = merge_ids(existing, ids),
                None => {
                    map.insert(key.clone(), ids.clone());
                }
            }
        }
        KeyDeps { map }
    }

    fn without(&self, other: &KeyDeps) -> KeyDeps {
        let mut map = BTreeMap::new();
        for (key, ids) in &self.map {
            let remove = other.ids_for(key);
            let kept: Vec<TxnId> = ids
                .iter()
                .filter(|id| remove.binary_search(id).is_err())
                .copied()
                .collect();
            if !kept.is_empty() {
                map.insert(key.clone(), kept);
            }
        }
        KeyDeps { map }
    }

    fn slice(&self, ranges: &Ranges) -> KeyDeps {
        KeyDeps {
            map: self
                .map
                .iter()
                .filter(|(key, _)| ranges.contains_key(key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Per-range dependency multimap for range-domain transactions.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeDeps {
    entries: Vec<(KeyRange, Vec<TxnId>)>,
}

impl RangeDeps {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, range: KeyRange, id: TxnId) {
        for (existing, ids) in &mut self.entries {
            if *existing == range {
                if let Err(at) = ids.binary_search(&id) {
                    ids.insert(at, id);
                }
                return;
            }
        }
        self.entries.push((range, vec![id]));
        self.entries.sort_by(|a, b| a.0.start.cmp(&b.0.start));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyRange, &[TxnId])> {
        self.entries.iter().map(|(r, v)| (r, v.as_slice()))
    }

    /// Ids of every range dependency intersecting `key`.
    pub fn ids_intersecting<'a>(&'a self, key: &'a Key) -> impl Iterator<Item = TxnId> + 'a {
        self.entries
            .iter()
            .filter(move |(range, _)| range.contains(key))
            .flat_map(|(_, ids)| ids.iter().copied())
    }

    fn union(&self, other: &RangeDeps) -> RangeDeps {
        let mut out = self.clone();
        for (range, ids) in &other.entries {
            for id in ids {
                out.insert(range.clone(), *id);
            }
        }
        out
    }

    fn without(&self, other: &RangeDeps) -> RangeDeps {
        let mut entries = Vec::new();
        for (range, ids) in &self.entries {
            let remove: Vec<TxnId> = other
                .entries
                .iter()
                .filter(|(r, _)| r == range)
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect();
            let kept: Vec<TxnId> = ids.iter().filter(|id| !remove.contains(id)).copied().collect();
            if !kept.is_empty() {
                entries.push((range.clone(), kept));
            }
        }
        RangeDeps { entries }
    }

    fn slice(&self, ranges: &Ranges) -> RangeDeps {
        RangeDeps {
            entries: self
                .entries
                .iter()
                .filter(|(range, _)| ranges.intersects(range))
                .cloned()
                .collect(),
        }
    }
}

/// The complete dependency set of one transaction.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Deps {
    pub key_deps: KeyDeps,
    pub range_deps: RangeDeps,
    /// Dependencies carried by id alone (no key/range attribution).
    direct: Vec<TxnId>,
}

impl Deps {
    pub const fn new() -> Deps {
        Deps {
            key_deps: KeyDeps {
                map: BTreeMap::new(),
            },
            range_deps: RangeDeps {
                entries: Vec::new(),
            },
            direct: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_deps.is_empty() && self.range_deps.is_empty() && self.direct.is_empty()
    }

    pub fn insert_key(&mut self, key: Key, id: TxnId) {
        self.key_deps.insert(key, id);
    }

    pub fn insert_range(&mut self, range: KeyRange, id: TxnId) {
        self.range_deps.insert(range, id);
    }

    pub fn insert_direct(&mut self, id: TxnId) {
        if let Err(at) = self.direct.binary_search(&id) {
            self.direct.insert(at, id);
        }
    }

    pub fn direct(&self) -> &[TxnId] {
        &self.direct
    }

    /// Every distinct id in the set, ascending.
    pub fn txn_ids(&self) -> BTreeSet<TxnId> {
        let mut ids = BTreeSet::new();
        for (_, key_ids) in self.key_deps.iter() {
            ids.extend(key_ids.iter().copied());
        }
        for (_, range_ids) in self.range_deps.iter() {
            ids.extend(range_ids.iter().copied());
        }
        ids.extend(self.direct.iter().copied());
        ids
    }

    pub fn contains(&self, id: TxnId) -> bool {
        self.direct.binary_search(&id).is_ok()
            || self.key_deps.iter().any(|(_, ids)| ids.binary_search(&id).is_ok())
            || self
                .range_deps
                .iter()
                .any(|(_, ids)| ids.binary_search(&id).is_ok())
    }

    pub fn max_id(&self) -> Option<TxnId> {
        self.txn_ids().into_iter().next_back()
    }

    pub fn with(&self, other: &Deps) -> Deps {
        Deps {
            key_deps: self.key_deps.union(&other.key_deps),
            range_deps: self.range_deps.union(&other.range_deps),
            direct: merge_ids(&self.direct, &other.direct),
        }
    }

    pub fn without(&self, other: &Deps) -> Deps {
        Deps {
            key_deps: self.key_deps.without(&other.key_deps),
            range_deps: self.range_deps.without(&other.range_deps),
            direct: self
                .direct
                .iter()
                .filter(|id| other.direct.binary_search(id).is_err())
                .copied()
                .collect(),
        }
    }

    /// Drop every occurrence of the given ids, wherever attributed.
    pub fn without_ids(&self, remove: &BTreeSet<TxnId>) -> Deps {
        let mut out = Deps::new();
        for (key, ids) in self.key_deps.iter() {
            for id in ids {
                if !remove.contains(id) {
                    out.insert_key(key.clone(), *id);
                }
            }
        }
        for (range, ids) in self.range_deps.iter() {
            for id in ids {
                if !remove.contains(id) {
                    out.insert_range(range.clone(), *id);
                }
            }
        }
        for id in &self.direct {
            if !remove.contains(id) {
                out.insert_direct(*id);
            }
        }
        out
    }

    /// Restrict to dependencies attributed inside `ranges`. Direct ids are
    /// always retained.
    pub fn slice(&self, ranges: &Ranges) -> Deps {
        Deps {
            key_deps: self.key_deps.slice(ranges),
            range_deps: self.range_deps.slice(ranges),
            direct: self.direct.clone(),
        }
    }

    /// Ids attributed anywhere inside `scope`, plus direct ids.
    pub fn ids_for_scope(&self, scope: &crate::keys::Participants) -> BTreeSet<TxnId> {
        let mut ids: BTreeSet<TxnId> = self.direct.iter().copied().collect();
        for (key, key_ids) in self.key_deps.iter() {
            if scope.contains_key(key) {
                ids.extend(key_ids.iter().copied());
            }
        }
        let scope_ranges = scope.as_ranges();
        for (range, range_ids) in self.range_deps.iter() {
            if scope_ranges.intersects(range) {
                ids.extend(range_ids.iter().copied());
            }
        }
        ids
    }

    /// Ids relevant to a single key: key deps on the key plus intersecting
    /// range deps plus direct ids.
    pub fn ids_for_key(&self, key: &Key) -> BTreeSet<TxnId> {
        let mut ids: BTreeSet<TxnId> = self.key_deps.ids_for(key).iter().copied().collect();
        ids.extend(self.range_deps.ids_intersecting(key));
        ids.extend(self.direct.iter().copied());
        ids
    }
}

impl fmt::Debug for Deps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.txn_ids();
        write!(f, "Deps({} ids: {:?})", ids.len(), ids)
    }
}
