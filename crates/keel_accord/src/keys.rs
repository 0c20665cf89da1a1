//! Keys, ranges, and routes.
//!
//! Byte-string keys with half-open `[start, end)` ranges; an empty end bound
//! means unbounded. Sets of keys and sets of ranges are kept sorted and
//! deduplicated so the algebra below (union, without, slice, intersect) is a
//! linear merge.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque byte-string key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<u8>);

/// Keys used for routing decisions (shard lookup, home shard, CFK index).
pub type RoutingKey = Key;

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "k\"{s}\""),
            Err(_) => write!(f, "k{:02x?}", self.0),
        }
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key(bytes.to_vec())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

/// Compare two exclusive end bounds, treating an empty bound as +infinity.
fn cmp_ends(a: &Key, b: &Key) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

fn min_end(a: &Key, b: &Key) -> Key {
    if cmp_ends(a, b) == Ordering::Greater {
        b.clone()
    } else {
        a.clone()
    }
}

/// Half-open key range `[start, end)`; empty `end` is unbounded.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The whole keyspace.
    pub fn all() -> Self {
        Self::new(Key::new(Vec::new()), Key::new(Vec::new()))
    }

    pub fn contains(&self, key: &Key) -> bool {
        key >= &self.start && (self.end.is_empty() || key < &self.end)
    }

    pub fn is_degenerate(&self) -> bool {
        !self.end.is_empty() && self.start >= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.intersect(other).is_some()
    }

    /// The overlap of two ranges, if non-empty.
    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = self.start.clone().max(other.start.clone());
        let end = min_end(&self.end, &other.end);
        let range = KeyRange { start, end };
        if range.is_degenerate() {
            None
        } else {
            Some(range)
        }
    }

    /// Whether `other` lies fully inside `self`.
    pub fn encloses(&self, other: &KeyRange) -> bool {
        other.start >= self.start && cmp_ends(&other.end, &self.end) != Ordering::Greater
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?},{:?})", self.start, self.end)
    }
}

/// Sorted, deduplicated set of keys.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Keys(Vec<Key>);

impl Keys {
    pub fn empty() -> Self {
        Keys(Vec::new())
    }

    pub fn of(mut keys: Vec<Key>) -> Self {
        keys.sort();
        keys.dedup();
        Keys(keys)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.0.binary_search(key).is_ok()
    }

    pub fn union(&self, other: &Keys) -> Keys {
        let mut out = Vec::with_capacity(self.0.len() + other.0.len());
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                Ordering::Less => {
                    out.push(self.0[i].clone());
                    i += 1;
                }
                Ordering::Greater => {
                    out.push(other.0[j].clone());
                    j += 1;
                }
                Ordering::Equal => {
                    out.push(self.0[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.0[i..]);
        out.extend_from_slice(&other.0[j..]);
        Keys(out)
    }

    pub fn without(&self, other: &Keys) -> Keys {
        Keys(
            self.0
                .iter()
                .filter(|k| !other.contains(k))
                .cloned()
                .collect(),
        )
    }

    /// Keys falling inside any of `ranges`.
    pub fn slice(&self, ranges: &Ranges) -> Keys {
        Keys(
            self.0
                .iter()
                .filter(|k| ranges.contains_key(k))
                .cloned()
                .collect(),
        )
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl FromIterator<Key> for Keys {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        Keys::of(iter.into_iter().collect())
    }
}

/// Sorted set of non-overlapping ranges; adjacent ranges are coalesced.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ranges(Vec<KeyRange>);

impl Ranges {
    pub fn empty() -> Self {
        Ranges(Vec::new())
    }

    pub fn of(ranges: Vec<KeyRange>) -> Self {
        Self::normalize(ranges)
    }

    pub fn single(range: KeyRange) -> Self {
        Ranges(vec![range])
    }

    fn normalize(mut ranges: Vec<KeyRange>) -> Ranges {
        ranges.retain(|r| !r.is_degenerate());
        ranges.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| cmp_ends(&a.end, &b.end)));
        let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match out.last_mut() {
                Some(last)
                    if last.end.is_empty()
                        || range.start <= last.end =>
                {
                    // overlapping or adjacent: extend
                    if cmp_ends(&range.end, &last.end) == Ordering::Greater {
                        last.end = range.end;
                    }
                }
                _ => out.push(range),
            }
        }
        Ranges(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.0.iter()
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        // partition on start, then check the candidate to the left
        let idx = self.0.partition_point(|r| r.start <= *key);
        idx > 0 && self.0[idx - 1].contains(key)
    }

    pub fn intersects(&self, range: &KeyRange) -> bool {
        self.0.iter().any(|r| r.intersect(range).is_some())
    }

    pub fn intersects_ranges(&self, other: &Ranges) -> bool {
        other.0.iter().any(|r| self.intersects(r))
    }

    pub fn union(&self, other: &Ranges) -> Ranges {
        let mut all = Vec::with_capacity(self.0.len() + other.0.len());
        all.extend_from_slice(&self.0);
        all.extend_from_slice(&other.0);
        Self::normalize(all)
    }

    /// The intersection of two range sets.
    pub fn slice(&self, other: &Ranges) -> Ranges {
        let mut out = Vec::new();
        for a in &self.0 {
            for b in &other.0 {
                if let Some(r) = a.intersect(b) {
                    out.push(r);
                }
            }
        }
        Self::normalize(out)
    }

    /// Ranges of `self` not covered by `other`.
    pub fn without(&self, other: &Ranges) -> Ranges {
        let mut out = Vec::new();
        for a in &self.0 {
            let mut cursor = a.start.clone();
            let mut open = true;
            for b in other.0.iter().filter(|b| a.intersect(b).is_some()) {
                if b.start > cursor {
                    out.push(KeyRange {
                        start: cursor.clone(),
                        end: b.start.clone(),
                    });
                }
                if b.end.is_empty() {
                    open = false;
                    break;
                }
                if b.end > cursor {
                    cursor = b.end.clone();
                }
                if !a.end.is_empty() && cursor >= a.end {
                    open = false;
                    break;
                }
            }
            if open {
                let tail = KeyRange {
                    start: cursor,
                    end: a.end.clone(),
                };
                if !tail.is_degenerate() {
                    out.push(tail);
                }
            }
        }
        Self::normalize(out)
    }

    pub fn contains_all(&self, other: &Ranges) -> bool {
        other.0.iter().all(|r| self.encloses(r))
    }

    fn encloses(&self, range: &KeyRange) -> bool {
        // normalization coalesces adjacency, so a single member must enclose
        self.0.iter().any(|r| r.encloses(range))
    }
}

impl fmt::Debug for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl FromIterator<KeyRange> for Ranges {
    fn from_iter<I: IntoIterator<Item = KeyRange>>(iter: I) -> Self {
        Ranges::of(iter.into_iter().collect())
    }
}

/// The participants of a transaction: discrete keys or whole ranges,
/// depending on the transaction's domain.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Participants {
    Keys(Keys),
    Ranges(Ranges),
}

impl Participants {
    pub fn empty_keys() -> Self {
        Participants::Keys(Keys::empty())
    }

    pub fn empty_ranges() -> Self {
        Participants::Ranges(Ranges::empty())
    }

    /// An empty set of the same domain as `self`.
    pub fn empty_like(&self) -> Self {
        match self {
            Participants::Keys(_) => Self::empty_keys(),
            Participants::Ranges(_) => Self::empty_ranges(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Participants::Keys(k) => k.is_empty(),
            Participants::Ranges(r) => r.is_empty(),
        }
    }

    pub fn union(&self, other: &Participants) -> Participants {
        match (self, other) {
            (Participants::Keys(a), Participants::Keys(b)) => Participants::Keys(a.union(b)),
            (Participants::Ranges(a), Participants::Ranges(b)) => {
                Participants::Ranges(a.union(b))
            }
            // mixed domains collapse to ranges
            (a, b) => Participants::Ranges(a.as_ranges().union(&b.as_ranges())),
        }
    }

    pub fn slice(&self, ranges: &Ranges) -> Participants {
        match self {
            Participants::Keys(k) => Participants::Keys(k.slice(ranges)),
            Participants::Ranges(r) => Participants::Ranges(r.slice(ranges)),
        }
    }

    pub fn intersects(&self, ranges: &Ranges) -> bool {
        match self {
            Participants::Keys(k) => k.iter().any(|key| ranges.contains_key(key)),
            Participants::Ranges(r) => r.intersects_ranges(ranges),
        }
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        match self {
            Participants::Keys(k) => k.contains(key),
            Participants::Ranges(r) => r.contains_key(key),
        }
    }

    /// View as ranges: keys become degenerate point ranges.
    pub fn as_ranges(&self) -> Ranges {
        match self {
            Participants::Ranges(r) => r.clone(),
            Participants::Keys(k) => Ranges::of(
                k.iter()
                    .map(|key| {
                        let mut end = key.0.clone();
                        end.push(0);
                        KeyRange::new(key.clone(), Key::new(end))
                    })
                    .collect(),
            ),
        }
    }

    /// The routing keys this participant set touches, for CFK indexing.
    /// Range participants index by range start.
    pub fn routing_keys(&self) -> Vec<RoutingKey> {
        match self {
            Participants::Keys(k) => k.iter().cloned().collect(),
            Participants::Ranges(r) => r.iter().map(|range| range.start.clone()).collect(),
        }
    }

    /// Raw bytes of each member, for digesting.
    pub fn iter_raw(&self) -> Box<dyn Iterator<Item = &[u8]> + '_> {
        match self {
            Participants::Keys(k) => Box::new(k.iter().map(|key| key.as_bytes())),
            Participants::Ranges(r) => Box::new(
                r.iter()
                    .flat_map(|range| [range.start.as_bytes(), range.end.as_bytes()]),
            ),
        }
    }
}

impl fmt::Debug for Participants {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Participants::Keys(k) => write!(f, "{k:?}"),
            Participants::Ranges(r) => write!(f, "{r:?}"),
        }
    }
}

/// The full set of participating keys/ranges plus the distinguished home key.
///
/// A route with `covering = None` is full: it names every participant. A
/// partial route restricts the participants to one shard's view and records
/// which ranges that view covers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub home: RoutingKey,
    pub participants: Participants,
    pub covering: Option<Ranges>,
}

impl Route {
    pub fn full(home: RoutingKey, participants: Participants) -> Self {
        Self {
            home,
            participants,
            covering: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.covering.is_none()
    }

    /// Restrict a route to the given ranges, producing a partial route.
    pub fn slice(&self, ranges: &Ranges) -> Route {
        Route {
            home: self.home.clone(),
            participants: self.participants.slice(ranges),
            covering: Some(match &self.covering {
                None => ranges.clone(),
                Some(covering) => covering.slice(ranges),
            }),
        }
    }

    /// Merge participant knowledge from another route for the same txn.
    /// A full route subsumes any partial one.
    pub fn supplement(&mut self, other: &Route) {
        if self.is_full() {
            return;
        }
        if other.is_full() {
            *self = other.clone();
            return;
        }
        self.participants = self.participants.union(&other.participants);
        self.covering = match (self.covering.take(), &other.covering) {
            (Some(a), Some(b)) => Some(a.union(b)),
            (a, _) => a,
        };
    }

    pub fn covers(&self, ranges: &Ranges) -> bool {
        match &self.covering {
            None => true,
            Some(covering) => covering.contains_all(ranges),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route(home={:?}, {:?}", self.home, self.participants)?;
        match &self.covering {
            None => write!(f, ", full)"),
            Some(covering) => write!(f, ", covering={covering:?})"),
        }
    }
}
