//! Transaction identifiers, timestamps, ballots, and transaction bodies.
//!
//! A `TxnId` is an HLC sample tagged with the transaction's kind, domain, and
//! originating node; it doubles as the transaction's pre-accepted timestamp.
//! Equal identifiers cannot occur: the node id is the final tiebreak and a
//! node never issues the same HLC sample twice.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::keys::{Participants, Ranges};

pub type NodeId = u64;

/// Transaction kind. The ordering of variants is load-bearing only for
/// encoding; conflict semantics are in [`Kind::conflicts_with`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Read,
    Write,
    /// Synthetic happens-before barrier with no user payload.
    SyncPoint,
    /// Barrier that additionally rejects later-arriving transactions with
    /// earlier ids on the same ranges.
    ExclusiveSyncPoint,
    /// A read that is never recovered; driven by its own expiry timeout.
    EphemeralRead,
}

impl Kind {
    pub fn is_write(self) -> bool {
        matches!(self, Kind::Write)
    }

    pub fn is_read(self) -> bool {
        matches!(self, Kind::Read | Kind::EphemeralRead)
    }

    pub fn is_sync_point(self) -> bool {
        matches!(self, Kind::SyncPoint | Kind::ExclusiveSyncPoint)
    }

    /// Whether two transactions on the same key must be ordered relative to
    /// each other. Reads commute with reads; everything else conflicts.
    pub fn conflicts_with(self, other: Kind) -> bool {
        if self.is_sync_point() || other.is_sync_point() {
            return true;
        }
        !(self.is_read() && other.is_read())
    }

    /// The kinds a transaction of this kind must witness as dependencies.
    pub fn witnesses(self, prior: Kind) -> bool {
        self.conflicts_with(prior)
    }

    fn to_bits(self) -> u16 {
        match self {
            Kind::Read => 0,
            Kind::Write => 1,
            Kind::SyncPoint => 2,
            Kind::ExclusiveSyncPoint => 3,
            Kind::EphemeralRead => 4,
        }
    }

    fn from_bits(bits: u16) -> Kind {
        match bits {
            0 => Kind::Read,
            1 => Kind::Write,
            2 => Kind::SyncPoint,
            3 => Kind::ExclusiveSyncPoint,
            _ => Kind::EphemeralRead,
        }
    }
}

/// Whether a transaction addresses discrete keys or whole ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Key,
    Range,
}

const KIND_MASK: u16 = 0x7;
const DOMAIN_BIT: u16 = 0x8;

/// A point in the global order: `(epoch, hlc, flags, node)` compared
/// lexicographically. Used both as transaction ids and execution timestamps.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub epoch: u64,
    pub hlc: u64,
    pub flags: u16,
    pub node: NodeId,
}

impl Timestamp {
    pub const NONE: Timestamp = Timestamp {
        epoch: 0,
        hlc: 0,
        flags: 0,
        node: 0,
    };

    pub const MAX: Timestamp = Timestamp {
        epoch: u64::MAX,
        hlc: u64::MAX,
        flags: u16::MAX,
        node: u64::MAX,
    };

    pub fn new(epoch: u64, hlc: u64, flags: u16, node: NodeId) -> Self {
        Self {
            epoch,
            hlc,
            flags,
            node,
        }
    }

    /// Smallest timestamp strictly greater than `self`, preserving epoch.
    pub fn successor(self) -> Timestamp {
        Timestamp {
            hlc: self.hlc + 1,
            ..self
        }
    }

    pub fn with_epoch_at_least(self, epoch: u64) -> Timestamp {
        if epoch <= self.epoch {
            self
        } else {
            Timestamp { epoch, ..self }
        }
    }

    pub fn is_none(self) -> bool {
        self == Timestamp::NONE
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{},{}]", self.epoch, self.hlc, self.flags, self.node)
    }
}

/// Globally unique transaction identifier. Identical shape to `Timestamp`;
/// the flags carry the kind and domain.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(Timestamp);

impl Default for TxnId {
    fn default() -> Self {
        TxnId::NONE
    }
}

impl TxnId {
    pub const NONE: TxnId = TxnId(Timestamp::NONE);

    pub fn new(epoch: u64, hlc: u64, kind: Kind, domain: Domain, node: NodeId) -> Self {
        let mut flags = kind.to_bits();
        if domain == Domain::Range {
            flags |= DOMAIN_BIT;
        }
        TxnId(Timestamp::new(epoch, hlc, flags, node))
    }

    pub fn epoch(self) -> u64 {
        self.0.epoch
    }

    pub fn hlc(self) -> u64 {
        self.0.hlc
    }

    pub fn node(self) -> NodeId {
        self.0.node
    }

    pub fn kind(self) -> Kind {
        Kind::from_bits(self.0.flags & KIND_MASK)
    }

    pub fn domain(self) -> Domain {
        if self.0.flags & DOMAIN_BIT != 0 {
            Domain::Range
        } else {
            Domain::Key
        }
    }

    /// The id viewed as its own pre-accepted execution timestamp.
    pub fn as_timestamp(self) -> Timestamp {
        self.0
    }

    pub fn is_visible_to(self, other: TxnId) -> bool {
        self.kind().conflicts_with(other.kind())
    }
}

impl From<TxnId> for Timestamp {
    fn from(id: TxnId) -> Timestamp {
        id.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}{:?}{:?}",
            self.kind(),
            self.domain(),
            self.0
        )
    }
}

/// Ballot used to arbitrate between competing coordinators of one
/// transaction. Recovery increments the counter; node id breaks ties.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    pub epoch: u64,
    pub counter: u32,
    pub node: NodeId,
}

impl Ballot {
    pub const ZERO: Ballot = Ballot {
        epoch: 0,
        counter: 0,
        node: 0,
    };

    pub fn initial(epoch: u64, node: NodeId) -> Self {
        Self {
            epoch,
            counter: 0,
            node,
        }
    }

    pub fn next(self, epoch: u64, node: NodeId) -> Ballot {
        Ballot {
            epoch: epoch.max(self.epoch),
            counter: self.counter + 1,
            node,
        }
    }
}

/// A transaction body: the participating keys/ranges plus an opaque update
/// payload interpreted only by the data store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Txn {
    pub kind: Kind,
    pub keys: Participants,
    /// Subset of `keys` the execution phase must read. Empty for pure writes
    /// and sync points.
    pub read_scope: Participants,
    /// Opaque write payload; `None` for reads and sync points.
    pub update: Option<Vec<u8>>,
}

impl Txn {
    /// A transaction with no payload, used for sync points and system
    /// barriers.
    pub fn empty(kind: Kind, keys: Participants) -> Self {
        Self {
            kind,
            read_scope: keys.empty_like(),
            keys,
            update: None,
        }
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for key in self.keys.iter_raw() {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key);
        }
        if let Some(update) = &self.update {
            hasher.update(update);
        }
        *hasher.finalize().as_bytes()
    }

    /// Restrict the body to the parts covered by `ranges`.
    pub fn slice(&self, ranges: &Ranges) -> PartialTxn {
        PartialTxn {
            txn: Txn {
                kind: self.kind,
                keys: self.keys.slice(ranges),
                read_scope: self.read_scope.slice(ranges),
                update: self.update.clone(),
            },
            covering: ranges.clone(),
        }
    }
}

/// A transaction body restricted to one replica's view, together with the
/// ranges that view covers. Coverage widens as messages supplement it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialTxn {
    pub txn: Txn,
    pub covering: Ranges,
}

impl PartialTxn {
    pub fn covers(&self, ranges: &Ranges) -> bool {
        self.covering.contains_all(ranges)
    }

    /// Merge another partial view of the same transaction into this one.
    pub fn supplement(&mut self, other: &PartialTxn) {
        if other.covering.contains_all(&self.covering) {
            *self = other.clone();
            return;
        }
        self.txn.keys = self.txn.keys.union(&other.txn.keys);
        self.txn.read_scope = self.txn.read_scope.union(&other.txn.read_scope);
        if self.txn.update.is_none() {
            self.txn.update = other.txn.update.clone();
        }
        self.covering = self.covering.union(&other.covering);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Participants;

    #[test]
    fn txn_id_total_order_breaks_ties_by_node() {
        let a = TxnId::new(1, 100, Kind::Write, Domain::Key, 1);
        let b = TxnId::new(1, 100, Kind::Write, Domain::Key, 2);
        assert!(a < b);
        let c = TxnId::new(1, 101, Kind::Read, Domain::Key, 1);
        assert!(b < c);
        let d = TxnId::new(2, 0, Kind::Read, Domain::Key, 0);
        assert!(c < d);
    }

    #[test]
    fn kind_and_domain_round_trip_through_flags() {
        for kind in [
            Kind::Read,
            Kind::Write,
            Kind::SyncPoint,
            Kind::ExclusiveSyncPoint,
            Kind::EphemeralRead,
        ] {
            for domain in [Domain::Key, Domain::Range] {
                let id = TxnId::new(3, 42, kind, domain, 7);
                assert_eq!(id.kind(), kind);
                assert_eq!(id.domain(), domain);
            }
        }
    }

    #[test]
    fn conflict_relation() {
        assert!(!Kind::Read.conflicts_with(Kind::Read));
        assert!(Kind::Read.conflicts_with(Kind::Write));
        assert!(Kind::Write.conflicts_with(Kind::Read));
        assert!(Kind::Write.conflicts_with(Kind::Write));
        assert!(Kind::SyncPoint.conflicts_with(Kind::Read));
        assert!(Kind::ExclusiveSyncPoint.conflicts_with(Kind::EphemeralRead));
        assert!(!Kind::EphemeralRead.conflicts_with(Kind::Read));
    }

    #[test]
    fn ballot_order_and_increment() {
        let a = Ballot::initial(1, 3);
        let b = a.next(1, 2);
        assert!(b > a);
        assert_eq!(b.counter, 1);
        let c = b.next(2, 1);
        assert!(c > b);
        assert_eq!(c.epoch, 2);
    }

    #[test]
    fn empty_txn_has_no_reads_or_update() {
        let txn = Txn::empty(Kind::SyncPoint, Participants::empty_keys());
        assert!(txn.read_scope.is_empty());
        assert!(txn.update.is_none());
    }
}
