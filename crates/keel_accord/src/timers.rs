//! Log-structured timer wheel.
//!
//! Timers collect into contiguous, non-overlapping buckets whose spans grow
//! exponentially with distance from "now" (minimum span `2^bucket_shift`).
//! Insertions and removals in far buckets are constant time; the head bucket
//! is heapified the first time order matters within it, splitting first if it
//! has grown large while its ideal span shrank. `advance` drains expired
//! timers in arbitrary order across buckets (deadline order within the
//! heapified head) and permits the sink to add timers reentrantly.

use std::fmt;

/// Stable handle to a pending timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    deadline: u64,
    generation: u32,
    /// Position within the owning bucket's item vector.
    pos: usize,
    payload: Option<T>,
}

struct Bucket {
    epoch: u64,
    span: u64,
    items: Vec<TimerToken>,
    heapified: bool,
}

impl Bucket {
    fn new(epoch: u64, span: u64) -> Self {
        Self {
            epoch,
            span,
            items: Vec::new(),
            heapified: false,
        }
    }

    fn end(&self) -> u64 {
        self.epoch.saturating_add(self.span)
    }

    fn contains(&self, deadline: u64) -> bool {
        deadline >= self.epoch && deadline < self.end()
    }
}

const NO_WAKE: u64 = u64::MAX;

pub struct LogGroupTimers<T> {
    buckets: Vec<Bucket>,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    bucket_shift: u32,
    min_bucket_span: u64,
    bucket_split_size: usize,
    cur_epoch: u64,
    wake_at: u64,
    timer_count: usize,
}

impl<T> LogGroupTimers<T> {
    /// `bucket_shift` sets the minimum bucket span (`2^shift` time units).
    pub fn new(bucket_shift: u32) -> Self {
        Self::with_split_size(bucket_shift, 256)
    }

    pub fn with_split_size(bucket_shift: u32, bucket_split_size: usize) -> Self {
        assert!(bucket_shift < 31);
        Self {
            buckets: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
            bucket_shift,
            min_bucket_span: 1 << bucket_shift,
            bucket_split_size: bucket_split_size.max(2),
            cur_epoch: 0,
            wake_at: NO_WAKE,
            timer_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.timer_count
    }

    pub fn is_empty(&self) -> bool {
        self.timer_count == 0
    }

    /// The earliest pending deadline, or the head bucket's end when the head
    /// is empty but not yet expired.
    pub fn wake_at(&self) -> Option<u64> {
        if self.wake_at == NO_WAKE {
            None
        } else {
            Some(self.wake_at)
        }
    }

    pub fn should_wake(&self, now: u64) -> bool {
        now >= self.wake_at
    }

    pub fn deadline_of(&self, token: TimerToken) -> Option<u64> {
        let slot = self.slots.get(token.index as usize)?;
        (slot.generation == token.generation && slot.payload.is_some()).then_some(slot.deadline)
    }

    pub fn add(&mut self, deadline: u64, payload: T) -> TimerToken {
        let token = self.add_internal(deadline, payload);
        self.timer_count += 1;
        if deadline < self.wake_at {
            self.wake_at = deadline;
        }
        token
    }

    pub fn update(&mut self, token: TimerToken, deadline: u64) -> bool {
        let Some(slot) = self.slot(token) else {
            return false;
        };
        let prev_deadline = slot.deadline;
        let bucket_index = self.bucket_index_of(prev_deadline);
        let Some(bucket_index) = bucket_index else {
            return false;
        };
        if self.buckets[bucket_index].contains(deadline) {
            self.slots[token.index as usize].deadline = deadline;
            if self.buckets[bucket_index].heapified {
                let pos = self.slots[token.index as usize].pos;
                self.sift(bucket_index, pos);
            }
        } else {
            let payload = self
                .detach(token, bucket_index)
                .expect("live slot must detach");
            // reuse the slot in place so the caller's token stays valid
            let target = self.ensure_bucket(deadline);
            let slot = &mut self.slots[token.index as usize];
            slot.deadline = deadline;
            slot.payload = Some(payload);
            let pos = self.buckets[target].items.len();
            self.slots[token.index as usize].pos = pos;
            self.buckets[target].items.push(token);
            if self.buckets[target].heapified {
                self.sift_up(target, pos);
            }
        }
        self.refresh_wake_at(prev_deadline, deadline);
        true
    }

    pub fn remove(&mut self, token: TimerToken) -> Option<T> {
        let slot = self.slot(token)?;
        let prev_deadline = slot.deadline;
        let bucket_index = self.bucket_index_of(prev_deadline)?;
        let payload = self.detach(token, bucket_index)?;
        self.free.push(token.index);
        self.timer_count -= 1;
        self.refresh_wake_at(prev_deadline, NO_WAKE);
        Some(payload)
    }

    /// Pop the strictly earliest pending timer. Not safe for reentry during
    /// `advance`.
    pub fn poll(&mut self) -> Option<(u64, T)> {
        loop {
            if self.buckets.is_empty() {
                self.wake_at = NO_WAKE;
                return None;
            }
            self.heapify_head();
            if self.buckets[0].items.is_empty() {
                self.buckets.remove(0);
                continue;
            }
            let token = self.buckets[0].items[0];
            let deadline = self.slots[token.index as usize].deadline;
            let payload = self.pop_heap_top(0);
            self.timer_count -= 1;
            self.free.push(token.index);
            match self.buckets[0].items.first() {
                Some(next) => self.wake_at = self.slots[next.index as usize].deadline,
                None => self.wake_at = self.buckets[0].end(),
            }
            return Some((deadline, payload));
        }
    }

    /// Drain every timer with `deadline <= now` into `sink`, in arbitrary
    /// order across buckets. The sink may add timers; additions that are
    /// already expired are drained in the same call.
    pub fn advance(&mut self, now: u64, sink: &mut impl FnMut(&mut Self, u64, T)) {
        let next_epoch = now & !(self.min_bucket_span - 1);
        if next_epoch < self.cur_epoch {
            return;
        }
        self.cur_epoch = next_epoch;

        loop {
            let Some(head) = self.buckets.first() else {
                self.wake_at = NO_WAKE;
                return;
            };
            if head.epoch > now {
                // nothing left expired; wake at the head's start (a lower
                // bound on its unheapified contents) or its end when empty
                self.wake_at = if head.items.is_empty() {
                    head.end()
                } else {
                    head.epoch
                };
                return;
            }

            if head.end() <= now {
                // wholly expired: drain without sorting
                if let Some(token) = self.buckets[0].items.pop() {
                    let slot = &mut self.slots[token.index as usize];
                    let deadline = slot.deadline;
                    let payload = slot.payload.take().expect("live timer in bucket");
                    self.free.push(token.index);
                    self.timer_count -= 1;
                    sink(self, deadline, payload);
                } else {
                    self.buckets.remove(0);
                }
                continue;
            }

            // straddling bucket: drain in deadline order
            self.heapify_head();
            match self.buckets[0].items.first().copied() {
                None => {
                    self.wake_at = self.buckets[0].end();
                    self.buckets.remove(0);
                    continue;
                }
                Some(token) => {
                    let deadline = self.slots[token.index as usize].deadline;
                    if deadline > now {
                        self.wake_at = deadline;
                        return;
                    }
                    let payload = self.pop_heap_top(0);
                    self.free.push(token.index);
                    self.timer_count -= 1;
                    sink(self, deadline, payload);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.slots.clear();
        self.free.clear();
        self.cur_epoch = 0;
        self.wake_at = NO_WAKE;
        self.timer_count = 0;
    }

    fn slot(&self, token: TimerToken) -> Option<&Slot<T>> {
        let slot = self.slots.get(token.index as usize)?;
        (slot.generation == token.generation && slot.payload.is_some()).then_some(slot)
    }

    fn add_internal(&mut self, deadline: u64, payload: T) -> TimerToken {
        let bucket_index = self.ensure_bucket(deadline);
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.deadline = deadline;
                slot.generation = slot.generation.wrapping_add(1);
                slot.payload = Some(payload);
                index
            }
            None => {
                self.slots.push(Slot {
                    deadline,
                    generation: 0,
                    pos: 0,
                    payload: Some(payload),
                });
                (self.slots.len() - 1) as u32
            }
        };
        let token = TimerToken {
            index,
            generation: self.slots[index as usize].generation,
        };
        let pos = self.buckets[bucket_index].items.len();
        self.slots[index as usize].pos = pos;
        self.buckets[bucket_index].items.push(token);
        if self.buckets[bucket_index].heapified {
            self.sift_up(bucket_index, pos);
        }
        token
    }

    /// Remove a live timer from its bucket, returning the payload. The slot
    /// stays reserved for the caller (update re-inserts; remove frees it).
    fn detach(&mut self, token: TimerToken, bucket_index: usize) -> Option<T> {
        let pos = self.slots[token.index as usize].pos;
        let bucket = &mut self.buckets[bucket_index];
        debug_assert_eq!(bucket.items.get(pos), Some(&token));
        let last = bucket.items.len() - 1;
        bucket.items.swap(pos, last);
        bucket.items.pop();
        if pos <= last && pos < self.buckets[bucket_index].items.len() {
            let moved = self.buckets[bucket_index].items[pos];
            self.slots[moved.index as usize].pos = pos;
            if self.buckets[bucket_index].heapified {
                self.sift(bucket_index, pos);
            }
        }
        self.slots[token.index as usize].payload.take()
    }

    fn refresh_wake_at(&mut self, prev_deadline: u64, new_deadline: u64) {
        if new_deadline < self.wake_at {
            self.wake_at = new_deadline;
            return;
        }
        if prev_deadline != self.wake_at {
            return;
        }
        // the timer defining wakeAt moved or left: recompute from the head
        loop {
            let Some(head) = self.buckets.first() else {
                self.wake_at = NO_WAKE;
                return;
            };
            if head.items.is_empty() {
                if head.end() >= self.cur_epoch {
                    self.wake_at = head.end();
                    return;
                }
                self.buckets.remove(0);
                continue;
            }
            self.heapify_head();
            let top = self.buckets[0].items[0];
            self.wake_at = self.slots[top.index as usize].deadline;
            return;
        }
    }

    // ---- bucket management ----

    fn first_epoch(&self, deadline: u64) -> u64 {
        deadline & !(self.min_bucket_span - 1)
    }

    fn ideal_span(&self, epoch: u64) -> u64 {
        if epoch <= self.cur_epoch {
            return self.min_bucket_span;
        }
        let distance = epoch - self.cur_epoch;
        let span = if distance == 0 {
            self.min_bucket_span
        } else {
            1u64 << (63 - distance.leading_zeros())
        };
        span.max(self.min_bucket_span)
    }

    fn min_span(&self, epoch: u64, deadline: u64) -> u64 {
        let distance = deadline - epoch;
        let span = if distance == 0 {
            self.min_bucket_span
        } else {
            (1u64 << (63 - distance.leading_zeros())).saturating_mul(2)
        };
        span.max(self.min_bucket_span)
    }

    fn bucket_index_of(&self, deadline: u64) -> Option<usize> {
        let idx = self.buckets.partition_point(|b| b.epoch <= deadline);
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        self.buckets[idx].contains(deadline).then_some(idx)
    }

    fn ensure_bucket(&mut self, deadline: u64) -> usize {
        if let Some(index) = self.bucket_index_of(deadline) {
            return index;
        }
        if self.buckets.is_empty() {
            let epoch = self.first_epoch(deadline);
            let span = self.ideal_span(epoch).max(self.min_span(epoch, deadline));
            self.buckets.push(Bucket::new(epoch, span));
            return 0;
        }
        if deadline < self.buckets[0].epoch {
            // prepend, keeping contiguity with the current head
            let epoch = self.first_epoch(deadline);
            let span = self.buckets[0].epoch - epoch;
            self.buckets.insert(0, Bucket::new(epoch, span));
            return 0;
        }
        // append buckets until the deadline is covered
        loop {
            let tail = self.buckets.last().expect("non-empty");
            if tail.contains(deadline) {
                return self.buckets.len() - 1;
            }
            let epoch = tail.end();
            let span = self.ideal_span(epoch).max(self.min_span(epoch, deadline));
            self.buckets.push(Bucket::new(epoch, span));
        }
    }

    fn heapify_head(&mut self) {
        if self.buckets.is_empty() || self.buckets[0].heapified {
            return;
        }
        self.maybe_split_head();
        let len = self.buckets[0].items.len();
        self.buckets[0].heapified = true;
        for pos in (0..len / 2).rev() {
            self.sift_down(0, pos);
        }
    }

    /// Split the head before heapifying when it is both large and eligible
    /// to cover a smaller span. Contained timers are redistributed.
    fn maybe_split_head(&mut self) {
        let head = &self.buckets[0];
        if head.items.len() < self.bucket_split_size {
            return;
        }
        let ideal = self.ideal_span(head.epoch);
        if ideal > head.span / 2 {
            return;
        }

        let old_span = head.span;
        let epoch = head.epoch;
        self.buckets[0].span = ideal;

        // successor buckets with doubling spans covering the remainder
        let mut new_buckets = Vec::new();
        let mut cursor = epoch + ideal;
        let end = epoch + old_span;
        let mut next_span = ideal;
        while cursor < end {
            let span = next_span.min(end - cursor);
            let span = if cursor + next_span * 2 > end {
                end - cursor
            } else {
                span
            };
            new_buckets.push(Bucket::new(cursor, span));
            cursor += span;
            next_span = next_span.saturating_mul(2);
        }
        let insert_at = 1;
        for (offset, bucket) in new_buckets.into_iter().enumerate() {
            self.buckets.insert(insert_at + offset, bucket);
        }

        // redistribute: anything no longer inside the shrunk head moves
        let mut pos = 0;
        while pos < self.buckets[0].items.len() {
            let token = self.buckets[0].items[pos];
            let deadline = self.slots[token.index as usize].deadline;
            if self.buckets[0].contains(deadline) {
                self.slots[token.index as usize].pos = pos;
                pos += 1;
                continue;
            }
            let last = self.buckets[0].items.len() - 1;
            self.buckets[0].items.swap(pos, last);
            self.buckets[0].items.pop();
            let target = self
                .bucket_index_of(deadline)
                .expect("split covers the original span");
            debug_assert!(target > 0);
            let new_pos = self.buckets[target].items.len();
            self.slots[token.index as usize].pos = new_pos;
            self.buckets[target].items.push(token);
        }
        // fix positions after swaps
        for (index, token) in self.buckets[0].items.iter().enumerate() {
            self.slots[token.index as usize].pos = index;
        }
    }

    // ---- head-bucket heap ----

    fn deadline_at(&self, bucket: usize, pos: usize) -> u64 {
        let token = self.buckets[bucket].items[pos];
        self.slots[token.index as usize].deadline
    }

    fn heap_swap(&mut self, bucket: usize, a: usize, b: usize) {
        self.buckets[bucket].items.swap(a, b);
        let ta = self.buckets[bucket].items[a];
        let tb = self.buckets[bucket].items[b];
        self.slots[ta.index as usize].pos = a;
        self.slots[tb.index as usize].pos = b;
    }

    fn sift(&mut self, bucket: usize, pos: usize) {
        self.sift_up(bucket, pos);
        self.sift_down(bucket, pos);
    }

    fn sift_up(&mut self, bucket: usize, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.deadline_at(bucket, pos) >= self.deadline_at(bucket, parent) {
                break;
            }
            self.heap_swap(bucket, pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, bucket: usize, mut pos: usize) {
        let len = self.buckets[bucket].items.len();
        loop {
            let left = pos * 2 + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let smallest = if right < len
                && self.deadline_at(bucket, right) < self.deadline_at(bucket, left)
            {
                right
            } else {
                left
            };
            if self.deadline_at(bucket, smallest) >= self.deadline_at(bucket, pos) {
                break;
            }
            self.heap_swap(bucket, pos, smallest);
            pos = smallest;
        }
    }

    fn pop_heap_top(&mut self, bucket: usize) -> T {
        let token = self.buckets[bucket].items[0];
        let last = self.buckets[bucket].items.len() - 1;
        self.heap_swap(bucket, 0, last);
        self.buckets[bucket].items.pop();
        if !self.buckets[bucket].items.is_empty() {
            self.sift_down(bucket, 0);
        }
        self.slots[token.index as usize]
            .payload
            .take()
            .expect("heap holds live timers")
    }
}

impl<T> fmt::Debug for LogGroupTimers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogGroupTimers({} timers, {} buckets, wake_at={:?})",
            self.timer_count,
            self.buckets.len(),
            self.wake_at()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    #[test]
    fn poll_returns_deadline_order() {
        let mut timers = LogGroupTimers::new(4);
        let deadlines = [500u64, 20, 300, 20, 7000, 1];
        for d in deadlines {
            timers.add(d, d);
        }
        let mut polled = Vec::new();
        while let Some((deadline, payload)) = timers.poll() {
            assert_eq!(deadline, payload);
            polled.push(deadline);
        }
        let mut sorted = deadlines.to_vec();
        sorted.sort_unstable();
        assert_eq!(polled, sorted);
        assert!(timers.is_empty());
        assert_eq!(timers.wake_at(), None);
    }

    #[test]
    fn wake_at_tracks_minimum_deadline() {
        let mut timers = LogGroupTimers::new(4);
        let a = timers.add(1000, "a");
        assert_eq!(timers.wake_at(), Some(1000));
        let b = timers.add(100, "b");
        assert_eq!(timers.wake_at(), Some(100));
        timers.remove(b).expect("b pending");
        // wakeAt may fall back to the head bucket's end when the head is
        // empty but not expired; it must never exceed the next deadline
        assert!(timers.wake_at().expect("pending") <= 1000);
        timers.update(a, 50);
        assert_eq!(timers.wake_at(), Some(50));
    }

    #[test]
    fn update_moves_between_buckets() {
        let mut timers = LogGroupTimers::new(4);
        let token = timers.add(10_000, "x");
        timers.add(500, "y");
        assert!(timers.update(token, 20));
        let (deadline, payload) = timers.poll().expect("pending");
        assert_eq!((deadline, payload), (20, "x"));
        let (deadline, payload) = timers.poll().expect("pending");
        assert_eq!((deadline, payload), (500, "y"));
    }

    #[test]
    fn stale_tokens_are_inert() {
        let mut timers = LogGroupTimers::new(4);
        let token = timers.add(100, "x");
        timers.remove(token).expect("live");
        assert!(timers.remove(token).is_none());
        assert!(!timers.update(token, 500));
        // slot reuse must not resurrect the stale handle
        let _other = timers.add(700, "y");
        assert!(timers.remove(token).is_none());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn advance_drains_expired_and_permits_reentrant_add() {
        let mut timers = LogGroupTimers::new(4);
        for d in [10u64, 20, 30, 5_000] {
            timers.add(d, d);
        }
        let mut drained = Vec::new();
        timers.advance(100, &mut |timers, deadline, payload: u64| {
            drained.push((deadline, payload));
            if payload == 10 {
                // reentrant add of an already-expired timer
                timers.add(40, 40u64);
            }
        });
        drained.sort_unstable();
        assert_eq!(drained, vec![(10, 10), (20, 20), (30, 30), (40, 40)]);
        assert_eq!(timers.len(), 1);
        assert!(timers.wake_at().expect("pending") <= 5_000);
        assert!(!timers.should_wake(4_000));
    }

    #[test]
    fn advance_is_monotone() {
        let mut timers = LogGroupTimers::new(4);
        timers.add(100, ());
        let mut count = 0;
        timers.advance(200, &mut |_, _, _| count += 1);
        // a smaller now is a no-op
        timers.advance(50, &mut |_, _, _| count += 10);
        assert_eq!(count, 1);
    }

    #[test]
    fn stress_mixed_operations_preserve_multiset() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut timers = LogGroupTimers::with_split_size(4, 16);
        let mut live: BTreeMap<u64, (TimerToken, u64)> = BTreeMap::new();
        let mut next_id = 0u64;
        let mut drained: Vec<(u64, u64)> = Vec::new();
        let mut removed = 0usize;
        let mut now = 0u64;

        for _ in 0..10_000 {
            let op = rng.gen_range(0..100);
            if op < 50 {
                let deadline = now + rng.gen_range(0..86_400_000u64);
                let id = next_id;
                next_id += 1;
                let token = timers.add(deadline, id);
                live.insert(id, (token, deadline));
            } else if op < 75 {
                if let Some(&id) = live.keys().next() {
                    let (token, _) = live[&id];
                    let deadline = now + rng.gen_range(0..86_400_000u64);
                    assert!(timers.update(token, deadline));
                    live.insert(id, (token, deadline));
                }
            } else if op < 90 {
                if let Some(&id) = live.keys().last() {
                    let (token, _) = live.remove(&id).expect("tracked");
                    assert_eq!(timers.remove(token), Some(id));
                    removed += 1;
                }
            } else {
                now += rng.gen_range(0..10_000_000u64);
                let mut batch = Vec::new();
                timers.advance(now, &mut |_, deadline, id| {
                    batch.push((deadline, id));
                });
                for (deadline, id) in &batch {
                    // every drained timer was expired at the advance point
                    assert!(*deadline <= now);
                    let (_, tracked) = live.remove(id).expect("drained timer was live");
                    assert_eq!(tracked, *deadline);
                }
                drained.extend(batch);
            }
        }

        // whatever remains is still pollable, in deadline order
        let mut last = 0;
        let mut polled = 0usize;
        while let Some((deadline, id)) = timers.poll() {
            assert!(deadline >= last);
            last = deadline;
            let (_, tracked) = live.remove(&id).expect("polled timer was live");
            assert_eq!(tracked, deadline);
            polled += 1;
        }
        assert!(live.is_empty(), "timers lost: {live:?}");
        // conservation: added = drained + removed + polled
        assert_eq!(next_id as usize, drained.len() + removed + polled);
    }

    #[test]
    fn split_preserves_all_timers() {
        // tiny split size forces the head bucket to split on heapify
        let mut timers = LogGroupTimers::with_split_size(2, 4);
        let count = 64u64;
        for i in 0..count {
            timers.add(i * 37 % 1024, i);
        }
        let mut seen = Vec::new();
        let mut last = 0;
        while let Some((deadline, _)) = timers.poll() {
            assert!(deadline >= last);
            last = deadline;
            seen.push(deadline);
        }
        assert_eq!(seen.len(), count as usize);
    }
}
