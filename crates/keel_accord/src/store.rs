//! Command stores.
//!
//! Each store is a single-threaded actor owning a slice of this node's
//! ranges: the per-transaction commands, the per-key summaries, the
//! redundant/durable watermarks, and the progress log. Tasks are closures
//! executed on the actor; a task either completes atomically or re-submits
//! itself. Cross-store references are by TxnId only.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::cfk::CommandsForKey;
use crate::cleanup::{Cleanup, DurableBefore, DurableBounds, RedundantBefore, RedundantBounds};
use crate::command::{AcceptKind, Command, Refusal, WaitingOn};
use crate::deps::Deps;
use crate::keys::{Key, Participants, Ranges, Route};
use crate::latest_deps::{KnownDeps, LatestDeps};
use crate::messages::*;
use crate::node::{Agent, DataStore, Journal, Node, NodeConfig};
use crate::progress::{ProgressEvent, ProgressLog, ProgressPhase};
use crate::status::{Durability, SaveStatus, SummaryStatus};
use crate::txn::{Ballot, Kind, Timestamp, TxnId};

type Task = Box<dyn FnOnce(&mut StoreInner) + Send>;

/// Handle to one store actor. Cloneable; all access goes through the task
/// queue, so no lock is ever held across a suspension point.
#[derive(Clone)]
pub struct CommandStore {
    store_id: u32,
    queue: mpsc::UnboundedSender<Task>,
}

impl CommandStore {
    pub fn new(
        store_id: u32,
        node: crate::txn::NodeId,
        config: NodeConfig,
        data: Arc<dyn DataStore>,
        agent: Arc<dyn Agent>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Task>();
        let mut inner = StoreInner::new(store_id, node, config, data, agent, journal.clone());
        match journal.replay(store_id) {
            Ok(commands) => inner.replay(commands),
            Err(err) => inner
                .agent
                .on_uncaught(err.context(format!("replaying journal for store {store_id}"))),
        }
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task(&mut inner);
            }
        });
        Self { store_id, queue }
    }

    pub fn id(&self) -> u32 {
        self.store_id
    }

    /// Run a closure on the store actor and await its result.
    pub async fn execute<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreInner) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task = Box::new(move |inner| {
            let _ = tx.send(f(inner));
        });
        let _ = self.queue.send(task);
        rx.await.expect("store actor terminated")
    }

    /// Fire-and-forget task submission.
    pub fn enqueue<F>(&self, f: F)
    where
        F: FnOnce(&mut StoreInner) + Send + 'static,
    {
        let _ = self.queue.send(Box::new(f));
    }

    pub async fn install_ranges(&self, epoch: u64, ranges: Ranges) {
        self.execute(move |inner| inner.install_ranges(epoch, ranges))
            .await
    }

    pub async fn progress_tick(&self, now_ms: u64) -> Vec<ProgressEvent> {
        self.execute(move |inner| {
            inner.observe_wall_ms(now_ms);
            inner.progress.tick(now_ms)
        })
        .await
    }

    pub async fn progress_clear(&self, txn_id: TxnId) {
        self.execute(move |inner| inner.progress.clear(txn_id)).await
    }

    pub async fn progress_reschedule(&self, txn_id: TxnId, phase: ProgressPhase, delay_ms: u64) {
        self.execute(move |inner| {
            let deadline = inner.now_ms().saturating_add(delay_ms);
            inner.progress.register(txn_id, phase, deadline);
        })
        .await
    }

    pub async fn route_of(&self, txn_id: TxnId) -> Option<Route> {
        self.execute(move |inner| {
            inner
                .commands
                .get(&txn_id)
                .and_then(|c| c.participants.route.clone())
        })
        .await
    }

    pub async fn erase_ephemeral(&self, txn_id: TxnId) {
        self.execute(move |inner| inner.erase_ephemeral(txn_id)).await
    }

    /// Stable (deps settled) but the outcome never arrived: the coordination
    /// needs taking over.
    pub async fn needs_outcome(&self, txn_id: TxnId) -> bool {
        self.execute(move |inner| {
            inner.commands.get(&txn_id).is_some_and(|c| {
                c.save_status >= SaveStatus::Stable && c.save_status < SaveStatus::PreApplied
            })
        })
        .await
    }

    /// Chase the state of whatever `txn_id` is blocked on: ask peers for the
    /// status of each outstanding dependency and fold replies in. Returns
    /// whether the transaction is still blocked afterwards.
    pub async fn seek_dependencies(&self, node: &Arc<Node>, txn_id: TxnId) -> bool {
        let blocked_on: Vec<TxnId> = self
            .execute(move |inner| {
                inner
                    .commands
                    .get(&txn_id)
                    .and_then(|c| c.waiting_on.as_ref())
                    .map(|w| w.waiting_ids().collect())
                    .unwrap_or_default()
            })
            .await;
        if blocked_on.is_empty() {
            return false;
        }
        let peers: Vec<crate::txn::NodeId> = {
            let topology = node.topology.read().await;
            match topology.current() {
                Some(t) => t.nodes().into_iter().filter(|n| *n != node.id).collect(),
                None => return true,
            }
        };
        for dep in blocked_on {
            let scope = match self
                .execute(move |inner| {
                    inner
                        .commands
                        .get(&dep)
                        .and_then(|c| c.participants.route.as_ref().map(|r| r.participants.clone()))
                })
                .await
            {
                Some(scope) => scope,
                None => Participants::empty_ranges(),
            };
            let request = Request::CheckStatus(CheckStatusReq {
                txn_id: dep,
                scope,
                include_info: true,
            });
            let mut replies = node.broadcast(peers.clone(), request);
            let mut best: Option<CheckStatusOk> = None;
            while let Some((_, reply)) = replies.recv().await {
                if let Ok(Reply::CheckStatus(Ok(ok))) = reply {
                    let stronger = match &best {
                        None => true,
                        Some(current) => crate::status::supersedes(
                            ok.status,
                            ok.accepted,
                            current.status,
                            current.accepted,
                        ),
                    };
                    if stronger {
                        best = Some(ok);
                    }
                }
            }
            if let Some(ok) = best {
                self.execute(move |inner| inner.fold_check_status(dep, ok)).await;
            }
        }
        self.execute(move |inner| {
            inner
                .commands
                .get(&txn_id)
                .and_then(|c| c.waiting_on.as_ref())
                .is_some_and(|w| !w.is_done())
        })
        .await
    }
}

/// The state owned by one store actor. Handlers run synchronously on the
/// actor; this is the `SafeCommandStore` boundary: a `&mut StoreInner` only
/// ever exists inside a task.
pub struct StoreInner {
    pub store_id: u32,
    pub node: crate::txn::NodeId,
    pub config: NodeConfig,
    pub data: Arc<dyn DataStore>,
    pub agent: Arc<dyn Agent>,
    pub journal: Arc<dyn Journal>,
    commands: HashMap<TxnId, Command>,
    cfks: HashMap<Key, CommandsForKey>,
    /// Range-domain transactions (sync points) indexed whole, so key-domain
    /// transactions on any overlapping key witness them.
    range_index: BTreeMap<TxnId, (Ranges, SummaryStatus, Option<Timestamp>)>,
    pub redundant_before: RedundantBefore,
    pub durable_before: DurableBefore,
    /// Reverse dependency index: dep -> commands waiting on it.
    waiters: HashMap<TxnId, BTreeSet<TxnId>>,
    /// Reads parked until the command is ready to execute.
    pending_reads: HashMap<TxnId, Vec<(Participants, oneshot::Sender<ReadOk>)>>,
    /// Outcomes parked until dependencies clear.
    pending_applies: HashMap<TxnId, Vec<u8>>,
    /// Ranges this store serves, per epoch.
    ranges_for_epoch: BTreeMap<u64, Ranges>,
    pub safe_to_read: Ranges,
    pub bootstrap_began_at: TxnId,
    pub progress: ProgressLog,
    cfk_updates_since_prune: usize,
    /// Wall-clock floor for progress deadlines, advanced by the clock of
    /// the owning node through requests.
    last_seen_hlc: u64,
}

impl StoreInner {
    fn new(
        store_id: u32,
        node: crate::txn::NodeId,
        config: NodeConfig,
        data: Arc<dyn DataStore>,
        agent: Arc<dyn Agent>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            store_id,
            node,
            config,
            data,
            agent,
            journal,
            commands: HashMap::new(),
            cfks: HashMap::new(),
            range_index: BTreeMap::new(),
            redundant_before: RedundantBefore::EMPTY,
            durable_before: DurableBefore::EMPTY,
            waiters: HashMap::new(),
            pending_reads: HashMap::new(),
            pending_applies: HashMap::new(),
            ranges_for_epoch: BTreeMap::new(),
            safe_to_read: Ranges::empty(),
            bootstrap_began_at: TxnId::NONE,
            progress: ProgressLog::new(4),
            cfk_updates_since_prune: 0,
            last_seen_hlc: 0,
        }
    }

    fn replay(&mut self, commands: Vec<Command>) {
        for command in commands {
            let txn_id = command.txn_id;
            for key in self.keys_of(&command) {
                self.cfk(&key).update(
                    txn_id,
                    command.save_status.summary(),
                    command.execute_at,
                );
            }
            if command.save_status >= SaveStatus::Stable
                && command.save_status < SaveStatus::PreApplied
            {
                self.register_waiters(txn_id, &command);
            }
            self.commands.insert(txn_id, command);
        }
        let ready: Vec<TxnId> = self.commands.keys().copied().collect();
        for txn_id in ready {
            self.try_execute(txn_id);
        }
    }

    pub fn now_ms(&self) -> u64 {
        crate::clock::decompose(self.last_seen_hlc).0 / 1_000
    }

    fn observe_hlc(&mut self, hlc: u64) {
        self.last_seen_hlc = self.last_seen_hlc.max(hlc);
    }

    fn observe_wall_ms(&mut self, now_ms: u64) {
        let as_hlc = (now_ms * 1_000) << crate::clock::LOGICAL_BITS;
        self.last_seen_hlc = self.last_seen_hlc.max(as_hlc);
    }

    pub fn command(&self, txn_id: TxnId) -> Option<&Command> {
        self.commands.get(&txn_id)
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    fn cfk(&mut self, key: &Key) -> &mut CommandsForKey {
        self.cfks
            .entry(key.clone())
            .or_insert_with(|| CommandsForKey::new(key.clone()))
    }

    /// Ranges this store serves in `epoch` (the newest known at-or-below).
    pub fn owned_ranges(&self, epoch: u64) -> Ranges {
        self.ranges_for_epoch
            .range(..=epoch)
            .next_back()
            .map(|(_, r)| r.clone())
            .unwrap_or_else(Ranges::empty)
    }

    /// Union over every epoch still in the window: a departing owner keeps
    /// its duties until the hand-off is retired.
    pub fn owned_union(&self) -> Ranges {
        self.ranges_for_epoch
            .values()
            .fold(Ranges::empty(), |acc, r| acc.union(r))
    }

    fn latest_ranges(&self) -> Ranges {
        self.ranges_for_epoch
            .values()
            .next_back()
            .cloned()
            .unwrap_or_else(Ranges::empty)
    }

    fn install_ranges(&mut self, epoch: u64, ranges: Ranges) {
        self.safe_to_read = self.safe_to_read.union(&ranges);
        self.ranges_for_epoch.insert(epoch, ranges);
    }

    /// Mark handed-off ranges retired once their epoch is redundant. A later
    /// re-add of the same range starts a fresh bootstrap; nothing recorded
    /// during the earlier tenure is resurrected.
    pub fn retire_ranges(&mut self, ranges: &Ranges) {
        for range in ranges.iter() {
            let retired = RedundantBefore::of(
                range.clone(),
                RedundantBounds {
                    retired: true,
                    ..RedundantBounds::default()
                },
            );
            self.redundant_before = RedundantBefore::merge(&self.redundant_before, &retired);
        }
        self.safe_to_read = self.safe_to_read.without(ranges);
        self.run_cleanup();
    }

    fn keys_of(&self, command: &Command) -> Vec<Key> {
        command
            .participants
            .touches
            .as_ref()
            .map(|t| t.routing_keys())
            .unwrap_or_default()
    }

    // ---- dependency/timestamp computation ----

    /// Local preaccept decision: the smallest executeAt dominating every
    /// conflict on the owned slice, and the conflicting prior ids.
    fn preaccept_decision(&mut self, txn_id: TxnId, scope: &Participants) -> (Timestamp, Deps) {
        let kind = txn_id.kind();
        let mut execute_at = txn_id.as_timestamp();
        let mut deps = Deps::new();
        match scope {
            Participants::Keys(keys) => {
                for key in keys.iter() {
                    let cfk = self.cfk(key);
                    let conflict = cfk.max_conflict(kind);
                    if conflict >= execute_at {
                        execute_at = conflict.successor();
                    }
                    for dep in cfk.deps_for(txn_id, kind) {
                        deps.insert_key(key.clone(), dep);
                    }
                }
            }
            Participants::Ranges(ranges) => {
                // range transactions witness every key summary they overlap
                for (key, cfk) in self.cfks.iter() {
                    if !ranges.contains_key(key) {
                        continue;
                    }
                    let conflict = cfk.max_conflict(kind);
                    if conflict >= execute_at {
                        execute_at = conflict.successor();
                    }
                    for dep in cfk.deps_for(txn_id, kind) {
                        deps.insert_key(key.clone(), dep);
                    }
                }
            }
        }
        // range-domain transactions conflict with anything they overlap
        let scope_ranges = scope.as_ranges();
        for (id, (ranges, status, at)) in self.range_index.iter() {
            if *id == txn_id || *status == SummaryStatus::Invalidated {
                continue;
            }
            if !ranges.intersects_ranges(&scope_ranges) {
                continue;
            }
            if !kind.conflicts_with(id.kind()) {
                continue;
            }
            let conflict = at.unwrap_or_else(|| id.as_timestamp());
            if conflict >= execute_at {
                execute_at = conflict.successor();
            }
            if *id < txn_id {
                for range in ranges.iter() {
                    deps.insert_range(range.clone(), *id);
                }
            }
        }

        // executeAt lives in an epoch no older than the txn's
        execute_at = execute_at.with_epoch_at_least(txn_id.epoch());
        (execute_at, deps)
    }

    /// Conflicts on the transaction's own keys at or below `execute_at`,
    /// witnessed after the original proposal (the slow-path accept
    /// supplement).
    fn conflicts_up_to(&self, txn_id: TxnId, execute_at: Timestamp, scope: &Participants) -> Deps {
        let kind = txn_id.kind();
        let mut deps = Deps::new();
        for (key, cfk) in self.cfks.iter() {
            if !scope.contains_key(key) {
                continue;
            }
            for entry in cfk.entries() {
                if entry.id == txn_id || entry.status == SummaryStatus::Invalidated {
                    continue;
                }
                let at = entry.execute_at.unwrap_or_else(|| entry.id.as_timestamp());
                if at <= execute_at && kind.conflicts_with(entry.id.kind()) {
                    deps.insert_key(key.clone(), entry.id);
                }
            }
        }
        let scope_ranges = scope.as_ranges();
        for (id, (ranges, status, at)) in self.range_index.iter() {
            if *id == txn_id || *status == SummaryStatus::Invalidated {
                continue;
            }
            let at = at.unwrap_or_else(|| id.as_timestamp());
            if at <= execute_at
                && kind.conflicts_with(id.kind())
                && ranges.intersects_ranges(&scope_ranges)
            {
                for range in ranges.iter() {
                    deps.insert_range(range.clone(), *id);
                }
            }
        }
        deps
    }

    fn update_cfk(&mut self, command: &Command) {
        let txn_id = command.txn_id;
        let summary = command.save_status.summary();
        let execute_at = if command.is_decided() {
            command.execute_at
        } else {
            None
        };
        for key in self.keys_of(command) {
            self.cfk(&key).update(txn_id, summary, execute_at);
        }
        if txn_id.domain() == crate::txn::Domain::Range {
            let ranges = command
                .participants
                .touches
                .as_ref()
                .map(|t| t.as_ranges())
                .unwrap_or_else(Ranges::empty);
            self.range_index.insert(txn_id, (ranges, summary, execute_at));
        }
        self.cfk_updates_since_prune += 1;
        if self.cfk_updates_since_prune >= self.config.cfk_prune_interval {
            self.cfk_updates_since_prune = 0;
            self.prune_cfks();
        }
    }

    fn prune_cfks(&mut self) {
        let watermarks: Vec<(Key, TxnId)> = self
            .cfks
            .keys()
            .map(|key| (key.clone(), self.redundant_before.gc_before_for(key)))
            .collect();
        for (key, watermark) in watermarks {
            if watermark != TxnId::NONE {
                self.cfk(&key).prune(watermark);
            }
        }
        let redundant_before = &self.redundant_before;
        self.range_index.retain(|id, (_, status, _)| {
            use crate::cleanup::RedundantStatus;
            *status < SummaryStatus::Applied
                || redundant_before.shard_status(*id) < RedundantStatus::GcBefore
        });
    }

    fn save(&mut self, txn_id: TxnId) {
        if let Some(command) = self.commands.get(&txn_id) {
            if let Err(err) = self.journal.save_command(self.store_id, command) {
                self.agent
                    .on_uncaught(err.context(format!("journaling {txn_id:?}")));
            }
        }
    }

    fn refuse<T>(refusal: Refusal) -> ReplyResult<T> {
        Err(match refusal {
            Refusal::Superseded(promised) => Nack::Rejected { promised },
            Refusal::Redundant => Nack::Redundant,
            Refusal::Truncated => Nack::Redundant,
        })
    }

    // ---- request handlers ----

    pub fn handle_preaccept(&mut self, req: PreAcceptReq, slice: &Ranges) -> ReplyResult<PreAcceptOk> {
        let txn_id = req.txn_id;
        self.observe_hlc(txn_id.hlc());
        let now_ms = self.now_ms();
        let expires_at = now_ms + self.config.preaccept_timeout.as_millis() as u64;
        let owned = self.owned_union().slice(slice);
        let scope = req.txn.txn.keys.slice(&owned);
        let (execute_at, deps) = self.preaccept_decision(txn_id, &scope);

        let command = self
            .commands
            .entry(txn_id)
            .or_insert_with(|| Command::uninitialised(txn_id));
        match command.preaccept(req.ballot, req.txn.clone(), &req.route, execute_at, deps) {
            Ok(()) => {}
            Err(Refusal::Redundant) if command.is_decided() => {
                // preaccept of a decided command: report what was decided
                return Ok(PreAcceptOk {
                    execute_at: command.execute_at_or_txn_id(),
                    deps: command.partial_deps.clone().unwrap_or_default(),
                });
            }
            Err(refusal) => return Self::refuse(refusal),
        }
        command.participants.set_owns(scope);
        if txn_id.kind() == Kind::EphemeralRead {
            command.expires_at = Some(expires_at);
        }

        let command = self.commands.get(&txn_id).expect("just inserted").clone();
        self.update_cfk(&command);
        self.save(txn_id);
        if txn_id.kind() == Kind::EphemeralRead {
            self.progress
                .register(txn_id, ProgressPhase::EphemeralExpiry, expires_at);
        } else {
            let deadline = self.now_ms() + self.config.retry_await_timeout.as_millis() as u64;
            self.progress
                .register(txn_id, ProgressPhase::Undecided, deadline);
        }

        Ok(PreAcceptOk {
            execute_at: command.execute_at_or_txn_id(),
            deps: command.partial_deps.clone().unwrap_or_default(),
        })
    }

    pub fn handle_accept(&mut self, req: AcceptReq, _slice: &Ranges) -> ReplyResult<AcceptOk> {
        let txn_id = req.txn_id;
        self.observe_hlc(txn_id.hlc().max(req.execute_at.hlc));
        let additional = match req.kind {
            AcceptKind::Slow => {
                self.conflicts_up_to(txn_id, req.execute_at, &req.route.participants)
            }
            AcceptKind::Medium | AcceptKind::Invalidate => Deps::new(),
        };
        let command = self
            .commands
            .entry(txn_id)
            .or_insert_with(|| Command::uninitialised(txn_id));
        command.participants.supplement_route(&req.route);
        let recorded = req.deps.with(&additional);
        match command.accept(req.kind, req.ballot, req.execute_at, recorded) {
            Ok(()) => {}
            Err(refusal) => return Self::refuse(refusal),
        }
        let command = self.commands.get(&txn_id).expect("present").clone();
        self.update_cfk(&command);
        self.save(txn_id);
        Ok(AcceptOk {
            additional_deps: additional,
        })
    }

    pub fn handle_commit(&mut self, req: CommitReq, slice: &Ranges) -> ReplyResult<CommitOk> {
        let txn_id = req.txn_id;
        self.observe_hlc(txn_id.hlc().max(req.execute_at.hlc));

        if req.kind == CommitKind::Invalidate {
            let command = self
                .commands
                .entry(txn_id)
                .or_insert_with(|| Command::uninitialised(txn_id));
            match command.invalidate() {
                Ok(()) | Err(Refusal::Redundant) => {}
                Err(refusal) => return Self::refuse(refusal),
            }
            let command = self.commands.get(&txn_id).expect("present").clone();
            self.update_cfk(&command);
            self.save(txn_id);
            self.progress.clear(txn_id);
            // parked reads can never be served; dropping the senders fails
            // the read round over at the coordinator
            self.pending_reads.remove(&txn_id);
            self.pending_applies.remove(&txn_id);
            self.on_command_progressed(txn_id);
            return Ok(CommitOk);
        }

        // the commit must reference a body we hold or carry one
        let has_body = self
            .commands
            .get(&txn_id)
            .and_then(|c| c.partial_txn.as_ref())
            .is_some()
            || req.txn.is_some();
        if !has_body {
            return Err(Nack::Insufficient);
        }

        let owned = self.owned_union().slice(slice);
        let command = self
            .commands
            .entry(txn_id)
            .or_insert_with(|| Command::uninitialised(txn_id));
        command.participants.supplement_route(&req.route);
        if let Some(txn) = &req.txn {
            if txn.txn.digest() != req.txn_digest {
                return Err(Nack::Invalid);
            }
            match &mut command.partial_txn {
                Some(existing) => existing.supplement(txn),
                None => command.partial_txn = Some(txn.clone()),
            }
        }

        match command.commit(req.ballot, req.execute_at, req.deps.clone()) {
            Ok(()) | Err(Refusal::Redundant) => {}
            Err(refusal) => return Self::refuse(refusal),
        }
        let executes = command
            .participants
            .route
            .as_ref()
            .map(|r| r.participants.slice(&owned))
            .unwrap_or_else(Participants::empty_keys);
        command.participants.set_executes(executes);

        if req.kind.is_stable() {
            self.make_stable(txn_id, req.ballot, req.execute_at, req.deps)?;
        } else {
            let deadline = self.now_ms() + self.config.retry_await_timeout.as_millis() as u64;
            self.progress.register(txn_id, ProgressPhase::Undecided, deadline);
        }

        let command = self.commands.get(&txn_id).expect("present").clone();
        self.update_cfk(&command);
        self.save(txn_id);
        self.on_command_progressed(txn_id);
        Ok(CommitOk)
    }

    /// Transition to Stable: compute the waiting-on set by filtering deps
    /// against local ranges and already-settled state.
    fn make_stable(
        &mut self,
        txn_id: TxnId,
        ballot: Ballot,
        execute_at: Timestamp,
        deps: Deps,
    ) -> ReplyResult<()> {
        let command = self.commands.get(&txn_id).expect("caller inserted");
        if command.save_status >= SaveStatus::Stable {
            return Ok(());
        }
        let executes = command
            .participants
            .executes
            .clone()
            .unwrap_or_else(Participants::empty_keys);

        // only deps intersecting what we execute can block us
        let relevant = if executes.is_empty() {
            BTreeSet::new()
        } else {
            deps.ids_for_scope(&executes)
        };
        let mut waiting: Vec<TxnId> = Vec::new();
        for dep in relevant {
            if dep == txn_id || self.dep_is_settled(dep, execute_at) {
                continue;
            }
            waiting.push(dep);
        }

        let waiting_on = WaitingOn::new(waiting);
        let command = self.commands.get_mut(&txn_id).expect("present");
        match command.stable(ballot, execute_at, deps, waiting_on) {
            Ok(()) | Err(Refusal::Redundant) => {}
            Err(refusal) => return Self::refuse(refusal),
        }
        let command = self.commands.get(&txn_id).expect("present").clone();
        self.register_waiters(txn_id, &command);
        if command
            .waiting_on
            .as_ref()
            .is_some_and(|w| !w.is_done())
        {
            let deadline = self.now_ms() + self.config.seek_progress_delay.as_millis() as u64;
            self.progress
                .register(txn_id, ProgressPhase::Awaiting, deadline);
        }
        self.try_execute(txn_id);
        Ok(())
    }

    /// A dependency no longer gates execution when it is applied,
    /// invalidated, truncated, ordered after us, or below the redundancy
    /// watermark.
    fn dep_is_settled(&self, dep: TxnId, execute_at: Timestamp) -> bool {
        if let Some(command) = self.commands.get(&dep) {
            if command.save_status >= SaveStatus::PreApplied {
                return true;
            }
            if command.is_decided() && command.execute_at_or_txn_id() > execute_at {
                return true;
            }
        }
        use crate::cleanup::RedundantStatus;
        self.redundant_before.shard_status(dep) >= RedundantStatus::ShardRedundant
    }

    fn register_waiters(&mut self, txn_id: TxnId, command: &Command) {
        if let Some(waiting_on) = &command.waiting_on {
            for dep in waiting_on.waiting_ids() {
                self.waiters.entry(dep).or_default().insert(txn_id);
            }
        }
    }

    pub fn handle_read(
        &mut self,
        req: ReadReq,
        slice: &Ranges,
    ) -> Result<ReadOk, oneshot::Receiver<ReadOk>> {
        let txn_id = req.txn_id;
        let owned = self.owned_union().slice(slice);
        let scope = req.scope.slice(&owned);
        let ready = self
            .commands
            .get(&txn_id)
            .is_some_and(|c| {
                c.save_status >= SaveStatus::Stable
                    && c.waiting_on.as_ref().is_none_or(WaitingOn::is_done)
            });
        if ready {
            return Ok(ReadOk {
                data: self.data.read(&scope, req.execute_at),
            });
        }
        let (tx, rx) = oneshot::channel();
        self.pending_reads
            .entry(txn_id)
            .or_default()
            .push((scope, tx));
        Err(rx)
    }

    pub fn handle_apply(&mut self, req: ApplyReq, slice: &Ranges) -> ReplyResult<ApplyOk> {
        let txn_id = req.txn_id;
        self.observe_hlc(txn_id.hlc().max(req.execute_at.hlc));
        let owned = self.owned_union().slice(slice);
        let command = self
            .commands
            .entry(txn_id)
            .or_insert_with(|| Command::uninitialised(txn_id));
        command.participants.supplement_route(&req.route);
        command.merge_durability(req.durability);
        if command.save_status >= SaveStatus::PreApplied {
            return Ok(ApplyOk);
        }

        let executes = command
            .participants
            .route
            .as_ref()
            .map(|r| r.participants.slice(&owned))
            .unwrap_or_else(Participants::empty_keys);
        command.participants.set_executes(executes);

        // an apply carries everything needed to reach Stable for replicas
        // that missed the commit round
        if command.save_status < SaveStatus::Committed {
            let _ = command.commit(Ballot::ZERO, req.execute_at, req.deps.clone());
        }
        if self.commands.get(&txn_id).expect("present").save_status < SaveStatus::Stable {
            self.make_stable(txn_id, Ballot::ZERO, req.execute_at, req.deps.clone())?;
        }
        self.pending_applies.insert(txn_id, req.result);
        self.try_execute(txn_id);
        self.save(txn_id);
        Ok(ApplyOk)
    }

    pub fn handle_begin_recovery(
        &mut self,
        req: BeginRecoveryReq,
        slice: &Ranges,
    ) -> ReplyResult<BeginRecoveryOk> {
        let txn_id = req.txn_id;
        self.observe_hlc(txn_id.hlc());
        let command = self
            .commands
            .entry(txn_id)
            .or_insert_with(|| Command::uninitialised(txn_id));
        command.participants.supplement_route(&req.route);
        if let Err(refusal) = command.promise(req.ballot) {
            // a truncated record can no longer promise, but its status is
            // exactly what the recoverer needs to learn: the outcome was
            // settled (and possibly reclaimed) long ago
            if !command.save_status.is_truncated() {
                return Self::refuse(refusal);
            }
        }
        // an undecided, never-accepted command is marked so that any
        // in-flight Accept from the original coordinator becomes defunct
        if command.save_status <= SaveStatus::PreAccepted {
            let _ = command.not_accept(req.ballot, false);
        }
        let command = self.commands.get(&txn_id).expect("present");

        let owned = self.owned_union().slice(slice);
        let scope = req.route.participants.as_ranges().slice(&owned);
        let (known, coordinated, local) = match command.save_status {
            status if status >= SaveStatus::Stable && status < SaveStatus::TruncatedWithOutcome => {
                (KnownDeps::Known, command.partial_deps.clone(), None)
            }
            SaveStatus::Committed => (KnownDeps::Committed, command.partial_deps.clone(), None),
            SaveStatus::AcceptedMedium => {
                (KnownDeps::ProposedFixed, command.partial_deps.clone(), None)
            }
            SaveStatus::AcceptedSlow => {
                (KnownDeps::Proposed, command.partial_deps.clone(), command.partial_deps.clone())
            }
            status if status.is_truncated() => (KnownDeps::Erased, None, None),
            _ => (KnownDeps::Unknown, None, command.partial_deps.clone()),
        };
        let latest = LatestDeps::create(&scope, known, command.accepted, coordinated, local);

        let voted_fast_path = command.save_status >= SaveStatus::PreAccepted
            && command.execute_at == Some(txn_id.as_timestamp());
        let blocking_conflict = {
            let keys = command
                .participants
                .owns
                .clone()
                .map(|owns| owns.routing_keys())
                .unwrap_or_default();
            keys.iter().any(|key| {
                self.cfks
                    .get(key)
                    .is_some_and(|cfk| cfk.has_undecided_conflict_before(txn_id))
            })
        };

        let command = self.commands.get(&txn_id).expect("present");
        Ok(BeginRecoveryOk {
            status: command.save_status,
            accepted: command.accepted,
            execute_at: command.execute_at,
            latest,
            voted_fast_path,
            blocking_conflict,
            result: command.result.clone(),
            route: command.participants.route.clone(),
            txn: command.partial_txn.clone(),
        })
    }

    pub fn handle_check_status(&mut self, req: CheckStatusReq) -> ReplyResult<CheckStatusOk> {
        let Some(command) = self.commands.get(&req.txn_id) else {
            return Err(Nack::Invalid);
        };
        Ok(CheckStatusOk {
            status: command.save_status,
            promised: command.promised,
            accepted: command.accepted,
            execute_at: command.execute_at,
            durability: command.durability,
            route: command.participants.route.clone(),
            txn: req.include_info.then(|| command.partial_txn.clone()).flatten(),
            deps: req.include_info.then(|| command.partial_deps.clone()).flatten(),
            result: command.result.clone(),
        })
    }

    /// Fold a stronger peer status for a blocked dependency into our state.
    pub fn fold_check_status(&mut self, txn_id: TxnId, ok: CheckStatusOk) {
        // truncation-with-outcome still carries everything an apply needs
        if ok.status >= SaveStatus::PreApplied && ok.status <= SaveStatus::TruncatedWithOutcome {
            if let (Some(execute_at), Some(deps), Some(result), Some(route)) =
                (ok.execute_at, ok.deps.clone(), ok.result.clone(), ok.route.clone())
            {
                let slice = self.latest_ranges();
                let _ = self.handle_apply(
                    ApplyReq {
                        txn_id,
                        execute_at,
                        deps,
                        route,
                        result,
                        durability: ok.durability,
                    },
                    &slice,
                );
                return;
            }
        }
        if ok.status == SaveStatus::Invalidated {
            if let Some(command) = self.commands.get_mut(&txn_id) {
                let _ = command.invalidate();
                let command = command.clone();
                self.update_cfk(&command);
                self.on_command_progressed(txn_id);
            }
            return;
        }
        if ok.status >= SaveStatus::PreCommitted {
            if let Some(execute_at) = ok.execute_at {
                let command = self
                    .commands
                    .entry(txn_id)
                    .or_insert_with(|| Command::uninitialised(txn_id));
                let _ = command.pre_commit(execute_at);
                let command = command.clone();
                self.update_cfk(&command);
                self.on_command_progressed(txn_id);
            }
        }
    }

    pub fn handle_fetch_data(&mut self, req: FetchDataReq) -> ReplyResult<FetchDataOk> {
        let Some(command) = self.commands.get(&req.txn_id) else {
            return Err(Nack::Invalid);
        };
        Ok(FetchDataOk {
            txn: command.partial_txn.clone(),
            deps: command.partial_deps.clone(),
            execute_at: command.execute_at,
            status: command.save_status,
        })
    }

    pub fn handle_set_shard_durable(&mut self, req: SetShardDurableReq) -> ReplyResult<()> {
        if let Some(command) = self.commands.get_mut(&req.txn_id) {
            command.merge_durability(req.durability);
        }
        if req.durability >= Durability::MajorityOrInvalidated {
            let universal = req.durability >= Durability::UniversalOrInvalidated;
            for range in req.scope.as_ranges().iter() {
                let bounds = DurableBounds {
                    majority_before: req.txn_id,
                    universal_before: if universal { req.txn_id } else { TxnId::NONE },
                };
                self.durable_before = DurableBefore::merge(
                    &self.durable_before,
                    &DurableBefore::of(range.clone(), bounds),
                );
            }
        }
        self.run_cleanup();
        Ok(())
    }

    pub fn handle_set_globally_durable(&mut self, req: SetGloballyDurableReq) -> ReplyResult<()> {
        self.durable_before = DurableBefore::merge(&self.durable_before, &req.durable_before);
        self.run_cleanup();
        Ok(())
    }

    pub fn handle_query_durable_before(&mut self) -> ReplyResult<QueryDurableBeforeOk> {
        Ok(QueryDurableBeforeOk {
            durable_before: self.durable_before.clone(),
        })
    }

    // ---- execution ----

    /// Execute a command if it is stable with all dependencies settled:
    /// serve parked reads, then apply a parked outcome.
    fn try_execute(&mut self, txn_id: TxnId) {
        let ready = self
            .commands
            .get(&txn_id)
            .is_some_and(|c| {
                c.save_status >= SaveStatus::Stable
                    && c.save_status < SaveStatus::PreApplied
                    && c.waiting_on.as_ref().is_none_or(WaitingOn::is_done)
            });
        if !ready {
            return;
        }
        let execute_at = self
            .commands
            .get(&txn_id)
            .and_then(|c| c.execute_at)
            .expect("stable commands have executeAt");

        if let Some(parked) = self.pending_reads.remove(&txn_id) {
            for (scope, tx) in parked {
                let data = self.data.read(&scope, execute_at);
                let _ = tx.send(ReadOk { data });
            }
        }

        if let Some(result) = self.pending_applies.remove(&txn_id) {
            let command = self.commands.get(&txn_id).expect("present");
            // the outcome bytes stand in for the body on replicas that never
            // received the definition
            let update = command
                .partial_txn
                .as_ref()
                .and_then(|t| t.txn.update.clone())
                .or_else(|| (!result.is_empty()).then(|| result.clone()));
            let executes = command
                .participants
                .executes
                .clone()
                .unwrap_or_else(Participants::empty_keys);
            if let Some(update) = update {
                if !executes.is_empty() {
                    self.data.write(&executes, &update, execute_at);
                }
            }
            let command = self.commands.get_mut(&txn_id).expect("present");
            if command.apply(result).is_ok() {
                let _ = command.applied();
            }
            let command = self.commands.get(&txn_id).expect("present").clone();
            self.update_cfk(&command);
            self.save(txn_id);
            self.progress.clear(txn_id);
            tracing::debug!(?txn_id, ?execute_at, "applied");
            self.on_command_progressed(txn_id);
        }
    }

    /// Propagate a status change to everything waiting on this transaction.
    fn on_command_progressed(&mut self, dep: TxnId) {
        let Some(waiting) = self.waiters.get(&dep).cloned() else {
            return;
        };
        let dep_state = self.commands.get(&dep).map(|c| {
            (
                c.save_status,
                c.is_decided().then(|| c.execute_at_or_txn_id()),
            )
        });
        let mut completed: Vec<TxnId> = Vec::new();
        let mut newly_ready: Vec<TxnId> = Vec::new();
        for waiter in waiting {
            let Some(command) = self.commands.get(&waiter) else {
                completed.push(waiter);
                continue;
            };
            let waiter_at = command.execute_at_or_txn_id();
            let settled = match dep_state {
                Some((status, _)) if status >= SaveStatus::PreApplied => true,
                Some((_, Some(dep_at))) if dep_at > waiter_at => true,
                _ => false,
            };
            if !settled {
                continue;
            }
            completed.push(waiter);
            if let Some(command) = self.commands.get_mut(&waiter) {
                if let Some(waiting_on) = command.waiting_on.as_mut() {
                    if waiting_on.satisfy(dep) {
                        newly_ready.push(waiter);
                    }
                }
            }
        }
        if let Some(set) = self.waiters.get_mut(&dep) {
            for waiter in &completed {
                set.remove(waiter);
            }
            if set.is_empty() {
                self.waiters.remove(&dep);
            }
        }
        for waiter in newly_ready {
            self.try_execute(waiter);
        }
    }

    // ---- maintenance ----

    fn erase_ephemeral(&mut self, txn_id: TxnId) {
        let expired = self
            .commands
            .get(&txn_id)
            .is_some_and(|c| c.is_ephemeral_read() && !c.is_decided());
        if !expired {
            self.progress.clear(txn_id);
            return;
        }
        if let Some(command) = self.commands.remove(&txn_id) {
            for key in self.keys_of(&command) {
                self.cfk(&key).remove(txn_id);
            }
        }
        self.pending_reads.remove(&txn_id);
        self.progress.clear(txn_id);
        tracing::debug!(?txn_id, "erased expired ephemeral read");
    }

    /// Apply cleanup decisions across all commands. Invoked when the
    /// durability or redundancy watermarks move.
    pub fn run_cleanup(&mut self) {
        let ids: Vec<TxnId> = self.commands.keys().copied().collect();
        for txn_id in ids {
            let command = self.commands.get(&txn_id).expect("present");
            let decision = Cleanup::should_cleanup(
                txn_id,
                command.save_status,
                command.durability,
                &command.participants,
                &self.redundant_before,
                &self.durable_before,
            );
            match decision {
                Cleanup::No => {}
                Cleanup::Expunge => {
                    let command = self.commands.remove(&txn_id).expect("present");
                    for key in self.keys_of(&command) {
                        self.cfk(&key).remove(txn_id);
                    }
                    self.range_index.remove(&txn_id);
                    self.progress.clear(txn_id);
                    self.waiters.remove(&txn_id);
                }
                Cleanup::Invalidate => {
                    let command = self.commands.get_mut(&txn_id).expect("present");
                    if command.invalidate().is_ok() {
                        let command = command.clone();
                        self.update_cfk(&command);
                        self.save(txn_id);
                        self.on_command_progressed(txn_id);
                    }
                    self.progress.clear(txn_id);
                }
                other => {
                    let target = other.applies_if_not();
                    let command = self.commands.get_mut(&txn_id).expect("present");
                    command.truncate_to(target);
                    let command = command.clone();
                    self.update_cfk(&command);
                    self.save(txn_id);
                    self.progress.clear(txn_id);
                    self.on_command_progressed(txn_id);
                }
            }
        }
    }

    /// Advance redundancy watermarks for `range` (driven by an applied
    /// exclusive sync point) and GC accordingly.
    pub fn advance_redundant_before(&mut self, range: crate::keys::KeyRange, bounds: RedundantBounds) {
        self.redundant_before = RedundantBefore::merge(
            &self.redundant_before,
            &RedundantBefore::of(range, bounds),
        );
        self.prune_cfks();
        self.run_cleanup();
    }
}

// ---- node-level dispatch ----

/// Route a request to every intersecting store and merge the partial
/// replies.
pub async fn dispatch(node: &Arc<Node>, request: Request) -> Reply {
    // topology gate: requests wait for their epoch to be acknowledged
    let wait_for = request.wait_for_epoch();
    let waiter = {
        let mut manager = node.topology.write().await;
        manager.await_epoch(wait_for)
    };
    if let Some(rx) = waiter {
        let _ = rx.await;
    }

    let scope = request_scope(&request);
    let stores = node.stores_for(&scope).await;
    if stores.is_empty() {
        return nack_reply(&request, Nack::Invalid);
    }

    match request {
        Request::PreAccept(req) => {
            let mut merged: Option<PreAcceptOk> = None;
            let mut nack = None;
            for (store, slice) in stores {
                let req = req.clone();
                match store
                    .execute(move |inner| inner.handle_preaccept(req, &slice))
                    .await
                {
                    Ok(ok) => {
                        merged = Some(match merged {
                            None => ok,
                            Some(previous) => PreAcceptOk {
                                execute_at: previous.execute_at.max(ok.execute_at),
                                deps: previous.deps.with(&ok.deps),
                            },
                        })
                    }
                    Err(n) => nack = Some(n),
                }
            }
            Reply::PreAccept(finish(merged, nack))
        }
        Request::Accept(req) => {
            let mut merged: Option<AcceptOk> = None;
            let mut nack = None;
            for (store, slice) in stores {
                let req = req.clone();
                match store
                    .execute(move |inner| inner.handle_accept(req, &slice))
                    .await
                {
                    Ok(ok) => {
                        merged = Some(match merged {
                            None => ok,
                            Some(previous) => AcceptOk {
                                additional_deps: previous.additional_deps.with(&ok.additional_deps),
                            },
                        })
                    }
                    Err(n) => nack = Some(n),
                }
            }
            Reply::Accept(finish(merged, nack))
        }
        Request::Commit(req) => {
            let mut ok = None;
            let mut nack = None;
            for (store, slice) in stores {
                let req = req.clone();
                match store
                    .execute(move |inner| inner.handle_commit(req, &slice))
                    .await
                {
                    Ok(_) => ok = Some(CommitOk),
                    Err(n) => nack = Some(n),
                }
            }
            Reply::Commit(finish(ok, nack))
        }
        Request::Read(req) => {
            let mut data = BTreeMap::new();
            for (store, slice) in stores {
                let req = req.clone();
                let outcome = store
                    .execute(move |inner| inner.handle_read(req, &slice))
                    .await;
                let ok = match outcome {
                    Ok(ok) => ok,
                    Err(rx) => match rx.await {
                        Ok(ok) => ok,
                        Err(_) => return Reply::Read(Err(Nack::Insufficient)),
                    },
                };
                data.extend(ok.data);
            }
            Reply::Read(Ok(ReadOk { data }))
        }
        Request::Apply(req) => {
            let mut ok = None;
            let mut nack = None;
            for (store, slice) in stores {
                let req = req.clone();
                match store
                    .execute(move |inner| inner.handle_apply(req, &slice))
                    .await
                {
                    Ok(_) => ok = Some(ApplyOk),
                    Err(n) => nack = Some(n),
                }
            }
            Reply::Apply(finish(ok, nack))
        }
        Request::BeginRecovery(req) => {
            let mut merged: Option<BeginRecoveryOk> = None;
            let mut nack = None;
            for (store, slice) in stores {
                let req = req.clone();
                match store
                    .execute(move |inner| inner.handle_begin_recovery(req, &slice))
                    .await
                {
                    Ok(ok) => {
                        merged = Some(match merged {
                            None => ok,
                            Some(previous) => merge_recovery(previous, ok),
                        })
                    }
                    Err(n) => nack = Some(n),
                }
            }
            Reply::BeginRecovery(finish(merged, nack))
        }
        Request::CheckStatus(req) => {
            let mut best: Option<CheckStatusOk> = None;
            let mut nack = None;
            for (store, _) in stores {
                let req = req.clone();
                match store
                    .execute(move |inner| inner.handle_check_status(req))
                    .await
                {
                    Ok(ok) => {
                        let stronger = best.as_ref().is_none_or(|current| {
                            crate::status::supersedes(
                                ok.status,
                                ok.accepted,
                                current.status,
                                current.accepted,
                            )
                        });
                        if stronger {
                            best = Some(ok);
                        }
                    }
                    Err(n) => nack = Some(n),
                }
            }
            Reply::CheckStatus(finish(best, nack))
        }
        Request::FetchData(req) => {
            let mut best: Option<FetchDataOk> = None;
            let mut nack = None;
            for (store, _) in stores {
                let req = req.clone();
                match store.execute(move |inner| inner.handle_fetch_data(req)).await {
                    Ok(ok) => {
                        if best.as_ref().is_none_or(|b| ok.status > b.status) {
                            best = Some(ok);
                        }
                    }
                    Err(n) => nack = Some(n),
                }
            }
            Reply::FetchData(finish(best, nack))
        }
        Request::SetShardDurable(req) => {
            let mut result = Ok(());
            for (store, _) in stores {
                let req = req.clone();
                result = store
                    .execute(move |inner| inner.handle_set_shard_durable(req))
                    .await;
            }
            Reply::SetShardDurable(result)
        }
        Request::SetGloballyDurable(req) => {
            let mut result = Ok(());
            for (store, _) in stores {
                let req = req.clone();
                result = store
                    .execute(move |inner| inner.handle_set_globally_durable(req))
                    .await;
            }
            Reply::SetGloballyDurable(result)
        }
        Request::QueryDurableBefore(_) => {
            let mut merged = DurableBefore::EMPTY;
            for (store, _) in stores {
                let ok = store
                    .execute(|inner| inner.handle_query_durable_before())
                    .await
                    .expect("query is infallible");
                merged = DurableBefore::merge(&merged, &ok.durable_before);
            }
            Reply::QueryDurableBefore(Ok(QueryDurableBeforeOk {
                durable_before: merged,
            }))
        }
    }
}

fn finish<T>(ok: Option<T>, nack: Option<Nack>) -> ReplyResult<T> {
    match (ok, nack) {
        // a rejection anywhere poisons the reply; other nacks only matter
        // if no store succeeded
        (_, Some(Nack::Rejected { promised })) => Err(Nack::Rejected { promised }),
        (_, Some(Nack::Insufficient)) => Err(Nack::Insufficient),
        (Some(ok), _) => Ok(ok),
        (None, Some(nack)) => Err(nack),
        (None, None) => Err(Nack::Invalid),
    }
}

pub(crate) fn merge_recovery(a: BeginRecoveryOk, b: BeginRecoveryOk) -> BeginRecoveryOk {
    let (strong, weak) = if crate::status::supersedes(a.status, a.accepted, b.status, b.accepted) {
        (a, b)
    } else {
        (b, a)
    };
    BeginRecoveryOk {
        status: strong.status,
        accepted: strong.accepted,
        execute_at: strong.execute_at.or(weak.execute_at),
        latest: LatestDeps::merge(&strong.latest, &weak.latest),
        voted_fast_path: strong.voted_fast_path && weak.voted_fast_path,
        blocking_conflict: strong.blocking_conflict || weak.blocking_conflict,
        result: strong.result.or(weak.result),
        route: strong.route.or(weak.route),
        txn: strong.txn.or(weak.txn),
    }
}

fn request_scope(request: &Request) -> Participants {
    match request {
        Request::PreAccept(r) => r.route.participants.clone(),
        Request::Accept(r) => r.route.participants.clone(),
        Request::Commit(r) => r.route.participants.clone(),
        Request::Read(r) => r.scope.clone(),
        Request::Apply(r) => r.route.participants.clone(),
        Request::BeginRecovery(r) => r.route.participants.clone(),
        Request::CheckStatus(r) => r.scope.clone(),
        Request::FetchData(r) => r.scope.clone(),
        Request::SetShardDurable(r) => r.scope.clone(),
        Request::SetGloballyDurable(_) | Request::QueryDurableBefore(_) => {
            Participants::Ranges(Ranges::single(crate::keys::KeyRange::all()))
        }
    }
}

fn nack_reply(request: &Request, nack: Nack) -> Reply {
    match request {
        Request::PreAccept(_) => Reply::PreAccept(Err(nack)),
        Request::Accept(_) => Reply::Accept(Err(nack)),
        Request::Commit(_) => Reply::Commit(Err(nack)),
        Request::Read(_) => Reply::Read(Err(nack)),
        Request::Apply(_) => Reply::Apply(Err(nack)),
        Request::BeginRecovery(_) => Reply::BeginRecovery(Err(nack)),
        Request::CheckStatus(_) => Reply::CheckStatus(Err(nack)),
        Request::FetchData(_) => Reply::FetchData(Err(nack)),
        Request::SetShardDurable(_) => Reply::SetShardDurable(Err(nack)),
        Request::SetGloballyDurable(_) => Reply::SetGloballyDurable(Err(nack)),
        Request::QueryDurableBefore(_) => Reply::QueryDurableBefore(Err(nack)),
    }
}
