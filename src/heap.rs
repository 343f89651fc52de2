use crate::dissim::MergeKey;
use log::warn;

const NOT_IN_HEAP: usize = usize::MAX;

/// Binary min-heap of region labels keyed by their cached [`MergeKey`].
///
/// `positions[label]` is the back-index of `label` (its slot in `entries`), which makes
/// arbitrary removal and repositioning O(log n).
#[derive(Debug, Clone, Default)]
pub struct CandidateHeap {
    entries: Vec<MergeKey>,
    positions: Vec<usize>,
}

impl CandidateHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heapifies `keys` in O(n). Each key's `label` identifies its region.
    pub fn build<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = MergeKey>,
    {
        let mut heap = Self {
            entries: keys.into_iter().collect(),
            positions: Vec::new(),
        };
        for pos in 0..heap.entries.len() {
            let label = heap.entries[pos].label;
            heap.set_position(label, pos);
        }
        heap.heapify();
        heap
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, label: u32) -> bool {
        self.position(label).is_some()
    }

    pub fn peek(&self) -> Option<&MergeKey> {
        self.entries.first()
    }

    pub fn key(&self, label: u32) -> Option<MergeKey> {
        self.position(label).map(|pos| self.entries[pos])
    }

    pub fn labels(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|k| k.label)
    }

    pub fn insert(&mut self, key: MergeKey) {
        debug_assert!(!self.contains(key.label), "label {} already in heap", key.label);
        let pos = self.entries.len();
        self.entries.push(key);
        self.set_position(key.label, pos);
        self.sift_up(pos);
    }

    /// Removes `label`: the last entry takes its slot and is fixed up and down from there.
    pub fn remove(&mut self, label: u32) -> Option<MergeKey> {
        let pos = self.position(label)?;
        let last = self.entries.len() - 1;
        self.swap(pos, last);
        let removed = self.entries.pop();
        self.positions[label as usize] = NOT_IN_HEAP;
        if pos < self.entries.len() {
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }
        removed
    }

    /// Sets the key of `key.label`, inserting it when absent, and repositions it.
    pub fn update(&mut self, key: MergeKey) {
        match self.position(key.label) {
            Some(pos) => {
                self.entries[pos] = key;
                let pos = self.sift_up(pos);
                self.sift_down(pos);
            }
            None => self.insert(key),
        }
    }

    /// Scans for parent/child ordering violations and repairs them in place.
    ///
    /// Violations are anomalies, not failures: they are logged and fixed by re-running the
    /// down-fix over the whole heap. Returns the number of violations found.
    pub fn verify_heap(&mut self) -> usize {
        let violations = (1..self.entries.len())
            .filter(|&pos| self.entries[pos].is_better(&self.entries[(pos - 1) / 2]))
            .count();
        if violations > 0 {
            warn!(
                "candidate heap of {} entries had {violations} ordering violations, repairing",
                self.entries.len()
            );
            self.heapify();
        }
        violations
    }

    pub fn is_valid(&self) -> bool {
        (1..self.entries.len())
            .all(|pos| !self.entries[pos].is_better(&self.entries[(pos - 1) / 2]))
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(pos, key)| self.position(key.label) == Some(pos))
    }

    fn heapify(&mut self) {
        for pos in (0..self.entries.len() / 2).rev() {
            self.sift_down(pos);
        }
    }

    fn position(&self, label: u32) -> Option<usize> {
        match self.positions.get(label as usize) {
            Some(&pos) if pos != NOT_IN_HEAP => Some(pos),
            _ => None,
        }
    }

    fn set_position(&mut self, label: u32, pos: usize) {
        let index = label as usize;
        if index >= self.positions.len() {
            self.positions.resize(index + 1, NOT_IN_HEAP);
        }
        self.positions[index] = pos;
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions[self.entries[a].label as usize] = a;
        self.positions[self.entries[b].label as usize] = b;
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.entries[pos].is_better(&self.entries[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) -> usize {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut best = pos;
            if left < len && self.entries[left].is_better(&self.entries[best]) {
                best = left;
            }
            if right < len && self.entries[right].is_better(&self.entries[best]) {
                best = right;
            }
            if best == pos {
                return pos;
            }
            self.swap(pos, best);
            pos = best;
        }
    }

    #[cfg(test)]
    fn overwrite_slot(&mut self, pos: usize, dissim: f64) {
        self.entries[pos].dissim = dissim;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn key(label: u32, dissim: f64, npix: u32) -> MergeKey {
        MergeKey {
            dissim,
            npix,
            label,
        }
    }

    #[test]
    fn pops_in_key_order() {
        let mut heap = CandidateHeap::build([
            key(1, 3.0, 2),
            key(2, 1.0, 2),
            key(3, 1.0, 5),
            key(4, f64::INFINITY, 0),
            key(5, 1.0, 5),
        ]);
        assert!(heap.is_valid());
        let mut order = Vec::new();
        while let Some(top) = heap.peek().copied() {
            order.push(top.label);
            heap.remove(top.label);
        }
        assert_eq!(order, vec![3, 5, 2, 1, 4]);
    }

    #[test]
    fn arbitrary_remove_and_update_keep_invariant() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut heap = CandidateHeap::new();
        for label in 1..=200u32 {
            heap.insert(key(label, rng.random_range(0.0..10.0), rng.random_range(1..50)));
        }
        for _ in 0..500 {
            let label = rng.random_range(1..=200u32);
            match rng.random_range(0..3) {
                0 => {
                    heap.remove(label);
                }
                1 => heap.update(key(label, rng.random_range(0.0..10.0), 3)),
                _ => {
                    if !heap.contains(label) {
                        heap.insert(key(label, rng.random_range(0.0..10.0), 1));
                    }
                }
            }
            assert!(heap.is_valid());
        }
        heap.remove(1);
        assert!(!heap.contains(1));
        assert_eq!(heap.key(1), None);
    }

    #[test]
    fn verify_repairs_violations() {
        let mut heap = CandidateHeap::build((1..=31).map(|l| key(l, l as f64, 1)));
        assert_eq!(heap.verify_heap(), 0);
        heap.overwrite_slot(20, -1.0);
        heap.overwrite_slot(5, 100.0);
        assert!(!heap.is_valid());
        assert!(heap.verify_heap() > 0);
        assert!(heap.is_valid());
        assert_eq!(heap.peek().map(|k| k.dissim), Some(-1.0));
    }
}
