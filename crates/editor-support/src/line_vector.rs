//! Ordered weak index of line objects.
//!
//! [`LineVector`] keeps every materialized line object of a document, weakly, sorted by current
//! line number, so a line number can be mapped back to the *same* line object for as long as
//! anybody holds it. Storage is a gap buffer: consecutive insertions around the same place are
//! cheap, and lookups binary search over logical indices.
//!
//! Lines carry a [`DisposeNotice`]; dropping a line bumps the vector's dead-slot counter, and
//! once enough slots are dead (an absolute minimum and one eighth of the live slots) the next
//! operation compacts the buffer.
//!
//! Line numbers are read from the lines themselves. If a search ever observes them out of
//! order, the vector is flagged unsorted and falls back to linear scans until the next
//! compaction re-sorts it.
//!
//! Access goes through [`LineVector::lock`], which is exclusive and not reentrant: a second
//! acquisition from the holding thread fails with [`SupportError::RecursiveLock`].

use crate::error::{Result, SupportError};
use crate::sync::{lock, wait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};

/// A line object that knows its current line number.
pub trait NumberedLine: Send + Sync {
    /// Current (0-based) line number.
    fn line_number(&self) -> usize;
}

/// Held by every line stored in a [`LineVector`]; reports the line's drop to the vector.
#[derive(Debug)]
pub struct DisposeNotice {
    collected: Arc<AtomicUsize>,
}

impl Drop for DisposeNotice {
    fn drop(&mut self) {
        self.collected.fetch_add(1, Ordering::AcqRel);
    }
}

/// Deferred work run while holding the vector lock.
pub type LineUpdate<L> = Box<dyn FnOnce(&mut LineVectorGuard<'_, L>) + Send>;

/// Creates the line object for a line number that has none yet.
pub type LineCreator<'c, L> = &'c mut dyn FnMut(usize) -> Result<Arc<L>>;

struct Slots<L> {
    items: Vec<Weak<L>>,
    gap_start: usize,
    gap_end: usize,
    unsorted: bool,
}

impl<L> Slots<L> {
    fn gap_len(&self) -> usize {
        self.gap_end - self.gap_start
    }

    fn len(&self) -> usize {
        self.items.len() - self.gap_len()
    }

    fn physical(&self, idx: usize) -> usize {
        if idx < self.gap_start {
            idx
        } else {
            idx + self.gap_len()
        }
    }

    fn get(&self, idx: usize) -> Option<Arc<L>> {
        self.items[self.physical(idx)].upgrade()
    }

    fn insert(&mut self, idx: usize, line: Weak<L>) {
        if self.gap_len() == 0 {
            let grow = (self.len() / 2).max(8);
            let mut items = Vec::with_capacity(self.items.len() + grow);
            items.extend(self.items.drain(..idx));
            items.extend((0..grow).map(|_| Weak::new()));
            items.append(&mut self.items);
            self.items = items;
            self.gap_start = idx;
            self.gap_end = idx + grow;
        } else {
            let gap = self.gap_len();
            if idx < self.gap_start {
                self.items[idx..self.gap_end].rotate_right(gap);
            } else if idx > self.gap_start {
                let end = self.gap_end + (idx - self.gap_start);
                self.items[self.gap_start..end].rotate_left(gap);
            }
            self.gap_start = idx;
            self.gap_end = idx + gap;
        }

        self.items[self.gap_start] = line;
        self.gap_start += 1;
    }

    fn live(&self) -> Vec<Arc<L>> {
        (0..self.len()).filter_map(|idx| self.get(idx)).collect()
    }

    fn rebuild(&mut self, lines: Vec<Arc<L>>) {
        self.items = lines.iter().map(Arc::downgrade).collect();
        self.gap_start = self.items.len();
        self.gap_end = self.items.len();
    }
}

enum Search<L> {
    Found(Arc<L>),
    Missing(usize),
}

/// Weak, ordered index of line objects.
pub struct LineVector<L: NumberedLine + 'static> {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
    slots: Mutex<Slots<L>>,
    pending: Mutex<VecDeque<LineUpdate<L>>>,
    collected: Arc<AtomicUsize>,
    min_gc: usize,
}

impl<L: NumberedLine + 'static> std::fmt::Debug for LineVector<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = lock(&self.slots);
        f.debug_struct("LineVector")
            .field("slots", &slots.len())
            .field("collected", &self.collected.load(Ordering::Acquire))
            .field("unsorted", &slots.unsorted)
            .finish()
    }
}

impl<L: NumberedLine + 'static> LineVector<L> {
    /// Create an empty vector compacting after at least `min_gc` dead slots.
    pub fn new(min_gc: usize) -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
            slots: Mutex::new(Slots {
                items: Vec::new(),
                gap_start: 0,
                gap_end: 0,
                unsorted: false,
            }),
            pending: Mutex::new(VecDeque::new()),
            collected: Arc::new(AtomicUsize::new(0)),
            min_gc,
        }
    }

    /// A notice to embed in a newly created line.
    pub fn dispose_notice(&self) -> DisposeNotice {
        DisposeNotice {
            collected: self.collected.clone(),
        }
    }

    /// Acquire exclusive access.
    ///
    /// Blocks while another thread holds the lock; fails if the calling thread holds it.
    pub fn lock(&self) -> Result<LineVectorGuard<'_, L>> {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        loop {
            match *owner {
                None => {
                    *owner = Some(me);
                    return Ok(LineVectorGuard { vector: self });
                }
                Some(holder) if holder == me => return Err(SupportError::RecursiveLock),
                Some(_) => owner = wait(&self.released, owner),
            }
        }
    }

    /// Run `update` under the lock: right now if the lock is free, otherwise when the current
    /// holder releases it (including when the caller itself is the holder).
    pub fn request_update(&self, update: LineUpdate<L>) {
        {
            let owner = lock(&self.owner);
            if owner.is_some() {
                lock(&self.pending).push_back(update);
                return;
            }
        }
        match self.lock() {
            Ok(mut guard) => update(&mut guard),
            Err(_) => lock(&self.pending).push_back(update),
        }
    }

    /// Whether a search detected out-of-order line numbers since the last compaction.
    pub fn is_unsorted(&self) -> bool {
        lock(&self.slots).unsorted
    }

    /// Number of lines dropped since the last compaction.
    pub fn collected_count(&self) -> usize {
        self.collected.load(Ordering::Acquire)
    }

    fn release(&self, guard: &mut LineVectorGuard<'_, L>) {
        loop {
            let next = {
                let mut owner = lock(&self.owner);
                let next = lock(&self.pending).pop_front();
                if next.is_none() {
                    *owner = None;
                    self.released.notify_all();
                }
                next
            };
            match next {
                Some(update) => update(guard),
                None => return,
            }
        }
    }
}

/// Exclusive access to a [`LineVector`]; pending updates run when it is dropped.
pub struct LineVectorGuard<'a, L: NumberedLine + 'static> {
    vector: &'a LineVector<L>,
}

impl<L: NumberedLine + 'static> LineVectorGuard<'_, L> {
    /// Find the line object for `line`, creating it with `creator` if there is none.
    ///
    /// Without a creator this is an existence check that never modifies the vector.
    pub fn find_or_create(
        &mut self,
        line: usize,
        creator: Option<LineCreator<'_, L>>,
    ) -> Result<Option<Arc<L>>> {
        self.maybe_compact();

        let insert_at = match self.search(line) {
            Search::Found(existing) => return Ok(Some(existing)),
            Search::Missing(idx) => idx,
        };
        let Some(creator) = creator else {
            return Ok(None);
        };

        let created = creator(line)?;
        lock(&self.vector.slots).insert(insert_at, Arc::downgrade(&created));
        Ok(Some(created))
    }

    /// Existing line object for `line`, if any.
    pub fn find(&mut self, line: usize) -> Option<Arc<L>> {
        match self.search(line) {
            Search::Found(existing) => Some(existing),
            Search::Missing(_) => None,
        }
    }

    /// Live line objects with `start <= line_number <= end`, in order.
    pub fn lines_in_range(&mut self, start: usize, end: usize) -> Vec<Arc<L>> {
        if start > end {
            return Vec::new();
        }
        if self.vector.is_unsorted() {
            return self
                .lines()
                .into_iter()
                .filter(|line| (start..=end).contains(&line.line_number()))
                .collect();
        }

        let first = match self.search(start) {
            Search::Found(_) => self.first_index_at_least(start),
            Search::Missing(idx) => idx,
        };

        let slots = lock(&self.vector.slots);
        let mut result = Vec::new();
        for idx in first..slots.len() {
            let Some(line) = slots.get(idx) else {
                continue;
            };
            let number = line.line_number();
            if number > end {
                break;
            }
            if number >= start {
                result.push(line);
            }
        }
        result
    }

    /// All live line objects in index order.
    pub fn lines(&mut self) -> Vec<Arc<L>> {
        lock(&self.vector.slots).live()
    }

    /// Number of slots, dead ones included.
    pub fn slot_count(&self) -> usize {
        lock(&self.vector.slots).len()
    }

    /// Remove dead slots (re-sorting if the vector was flagged unsorted).
    pub fn compact(&mut self) {
        let collected = self.vector.collected.load(Ordering::Acquire);
        let mut slots = lock(&self.vector.slots);
        let mut live = slots.live();
        if slots.unsorted {
            live.sort_by_key(|line| line.line_number());
            slots.unsorted = false;
            log::debug!("line vector re-sorted {} lines", live.len());
        }
        log::trace!(
            "line vector compaction: {} slots -> {}",
            slots.len(),
            live.len()
        );
        slots.rebuild(live);
        self.vector.collected.fetch_sub(collected, Ordering::AcqRel);
    }

    fn maybe_compact(&mut self) {
        let collected = self.vector.collected.load(Ordering::Acquire);
        let slots = lock(&self.vector.slots).len();
        let live = slots.saturating_sub(collected);
        if collected > self.vector.min_gc.max(live / 8) {
            self.compact();
        }
    }

    fn first_index_at_least(&self, line: usize) -> usize {
        let slots = lock(&self.vector.slots);
        let mut lo = 0;
        let mut hi = slots.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match live_near(&slots, mid, lo, hi) {
                Some((idx, found)) if found.line_number() < line => lo = idx + 1,
                Some((idx, _)) => hi = idx,
                None => break,
            }
        }
        lo
    }

    fn search(&mut self, line: usize) -> Search<L> {
        let mut slots = lock(&self.vector.slots);
        if slots.unsorted {
            return linear_search(&slots, line);
        }

        let mut lo = 0;
        let mut hi = slots.len();
        let mut low_bound = 0;
        let mut high_bound = usize::MAX;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let Some((idx, found)) = live_near(&slots, mid, lo, hi) else {
                break;
            };
            let number = found.line_number();
            if number < low_bound || number > high_bound {
                log::warn!("line vector out of order at slot {}; using linear search", idx);
                slots.unsorted = true;
                return linear_search(&slots, line);
            }
            match number.cmp(&line) {
                std::cmp::Ordering::Less => {
                    lo = idx + 1;
                    low_bound = number;
                }
                std::cmp::Ordering::Greater => {
                    hi = idx;
                    high_bound = number;
                }
                std::cmp::Ordering::Equal => {
                    // Several objects may share a number after lines merged; take the first.
                    let mut first = (idx, found);
                    for prev in (0..first.0).rev() {
                        match slots.get(prev) {
                            Some(candidate) if candidate.line_number() == line => {
                                first = (prev, candidate)
                            }
                            Some(_) => break,
                            None => continue,
                        }
                    }
                    return Search::Found(first.1);
                }
            }
        }
        Search::Missing(lo)
    }
}

impl<L: NumberedLine + 'static> Drop for LineVectorGuard<'_, L> {
    fn drop(&mut self) {
        let vector = self.vector;
        vector.release(self);
    }
}

/// A live slot in `[lo, hi)`, preferring `mid` then the slots after it.
fn live_near<L>(slots: &Slots<L>, mid: usize, lo: usize, hi: usize) -> Option<(usize, Arc<L>)> {
    (mid..hi)
        .chain((lo..mid).rev())
        .find_map(|idx| slots.get(idx).map(|line| (idx, line)))
}

fn linear_search<L: NumberedLine>(slots: &Slots<L>, line: usize) -> Search<L> {
    let mut insert_at = 0;
    for idx in 0..slots.len() {
        if let Some(candidate) = slots.get(idx) {
            let number = candidate.line_number();
            if number == line {
                return Search::Found(candidate);
            }
            if number < line {
                insert_at = idx + 1;
            }
        }
    }
    Search::Missing(insert_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[derive(Debug)]
    struct TestLine {
        number: AtomicUsize,
        _notice: DisposeNotice,
    }

    impl NumberedLine for TestLine {
        fn line_number(&self) -> usize {
            self.number.load(Ordering::Acquire)
        }
    }

    fn create(vector: &LineVector<TestLine>, line: usize) -> Arc<TestLine> {
        let mut guard = vector.lock().unwrap();
        let notice = vector.dispose_notice();
        let mut notice = Some(notice);
        let mut creator = |n: usize| {
            Ok(Arc::new(TestLine {
                number: AtomicUsize::new(n),
                _notice: notice.take().expect("creator called once"),
            }))
        };
        guard
            .find_or_create(line, Some(&mut creator))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_lookup_is_identity_stable() {
        let vector = LineVector::new(4);
        let lines: Vec<_> = (0..50).map(|n| create(&vector, n * 2)).collect();

        let mut guard = vector.lock().unwrap();
        for (i, line) in lines.iter().enumerate() {
            let found = guard.find_or_create(i * 2, None).unwrap().unwrap();
            assert!(Arc::ptr_eq(&found, line));
        }
        let before = guard.slot_count();
        assert!(guard.find_or_create(7, None).unwrap().is_none());
        assert_eq!(guard.slot_count(), before);
    }

    #[test]
    fn test_random_insertion_order_stays_sorted() {
        let vector = LineVector::new(4);
        let mut numbers: Vec<usize> = (0..200).collect();
        numbers.shuffle(&mut StdRng::seed_from_u64(3));
        let lines: Vec<_> = numbers.iter().map(|&n| create(&vector, n)).collect();

        let mut guard = vector.lock().unwrap();
        let ordered: Vec<usize> = guard.lines().iter().map(|l| l.line_number()).collect();
        assert_eq!(ordered, (0..200).collect::<Vec<_>>());
        assert!(!vector.is_unsorted());
        drop(guard);
        drop(lines);
    }

    #[test]
    fn test_collected_lines_are_compacted_and_survivors_found() {
        let vector = LineVector::new(2);
        let all: Vec<_> = (0..64).map(|n| create(&vector, n)).collect();
        let kept: Vec<_> = all.iter().step_by(4).cloned().collect();
        drop(all);
        assert_eq!(vector.collected_count(), 48);

        let mut guard = vector.lock().unwrap();
        // The lookup triggers compaction first.
        assert!(guard.find_or_create(1, None).unwrap().is_none());
        assert_eq!(guard.slot_count(), 16);
        for line in &kept {
            let found = guard.find(line.line_number()).unwrap();
            assert!(Arc::ptr_eq(&found, line));
        }
        drop(guard);
        assert_eq!(vector.collected_count(), 0);
    }

    #[test]
    fn test_lines_in_range() {
        let vector = LineVector::new(4);
        let _lines: Vec<_> = [1, 3, 5, 7, 9].iter().map(|&n| create(&vector, n)).collect();

        let mut guard = vector.lock().unwrap();
        let numbers: Vec<usize> = guard
            .lines_in_range(3, 8)
            .iter()
            .map(|l| l.line_number())
            .collect();
        assert_eq!(numbers, vec![3, 5, 7]);
        assert!(guard.lines_in_range(10, 20).is_empty());
        assert_eq!(guard.lines_in_range(0, 1).len(), 1);
    }

    #[test]
    fn test_recursive_lock_is_an_error() {
        let vector: LineVector<TestLine> = LineVector::new(4);
        let _guard = vector.lock().unwrap();
        assert!(matches!(vector.lock(), Err(SupportError::RecursiveLock)));
    }

    #[test]
    fn test_recursive_lock_from_creator_fails_cleanly() {
        let vector: Arc<LineVector<TestLine>> = Arc::new(LineVector::new(4));
        let inner = vector.clone();
        let mut guard = vector.lock().unwrap();
        let mut creator = |_n: usize| -> Result<Arc<TestLine>> {
            inner.lock()?;
            unreachable!()
        };
        let err = guard.find_or_create(0, Some(&mut creator)).unwrap_err();
        assert!(matches!(err, SupportError::RecursiveLock));
        assert_eq!(guard.slot_count(), 0);
    }

    #[test]
    fn test_pending_update_runs_on_release() {
        let vector: Arc<LineVector<TestLine>> = Arc::new(LineVector::new(4));
        let line = create(&vector, 4);
        let seen = Arc::new(AtomicUsize::new(usize::MAX));

        let guard = vector.lock().unwrap();
        let seen_in_update = seen.clone();
        vector.request_update(Box::new(move |guard: &mut LineVectorGuard<'_, TestLine>| {
            let lines = guard.lines();
            seen_in_update.store(lines.len(), Ordering::SeqCst);
        }));
        assert_eq!(seen.load(Ordering::SeqCst), usize::MAX);
        drop(guard);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // With the lock free the update runs immediately.
        let seen_now = seen.clone();
        vector.request_update(Box::new(move |_: &mut LineVectorGuard<'_, TestLine>| {
            seen_now.store(7, Ordering::SeqCst)
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        drop(line);
    }

    #[test]
    fn test_out_of_order_numbers_degrade_to_linear_search() {
        let vector = LineVector::new(100);
        let lines: Vec<_> = (0..16).map(|n| create(&vector, n * 10)).collect();
        // Renumber a line behind the vector's back.
        lines[12].number.store(5, Ordering::SeqCst);

        let mut guard = vector.lock().unwrap();
        let found = guard.find(130).unwrap();
        assert!(Arc::ptr_eq(&found, &lines[13]));
        assert!(vector.is_unsorted());
        let found = guard.find(5).unwrap();
        assert!(Arc::ptr_eq(&found, &lines[12]));

        guard.compact();
        assert!(!vector.is_unsorted());
        let ordered: Vec<usize> = guard.lines().iter().map(|l| l.line_number()).collect();
        let mut sorted = ordered.clone();
        sorted.sort_unstable();
        assert_eq!(ordered, sorted);
    }
}
