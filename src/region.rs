use crate::dissim::MergeKey;
use crate::forest::LabelForest;
use std::collections::BTreeSet;

/// Cached best merge candidates of a region.
///
/// `labels[0]` is the partner a merge would pick; the remaining labels tie with it on
/// dissimilarity. `key` is the region's own heap key derived from that choice.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidates {
    pub labels: Vec<u32>,
    pub key: MergeKey,
}

impl Candidates {
    pub fn none(label: u32) -> Self {
        Self {
            labels: Vec::new(),
            key: MergeKey::none(label),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, label: u32) -> bool {
        self.labels.contains(&label)
    }

    pub fn partner(&self) -> Option<u32> {
        self.labels.first().copied()
    }
}

/// Aggregate statistics and adjacency of one region.
#[derive(Debug, Clone)]
pub struct Region {
    pub label: u32,
    pub active: bool,
    pub npix: u32,
    /// Per-band sums.
    pub sum: Vec<f64>,
    /// Per-band sums of squares, empty when not accumulated.
    pub sumsq: Vec<f64>,
    /// Per-band sums of `x·ln(x)` over positive values, empty when not accumulated.
    pub sumxlogx: Vec<f64>,
    pub boundary_npix: u32,
    /// Dissimilarity of the most recent merge into this region.
    pub merge_threshold: f64,
    /// Largest pixel edge value inside the region.
    pub max_edge: f32,
    /// Small region, merged pre-emptively without edge weighting.
    pub init_merge: bool,
    pub neighbors: BTreeSet<u32>,
    pub best_neighbor: Candidates,
    pub best_region: Candidates,
    /// 0 while active, otherwise the label this region was merged into.
    pub merge_region_label: u32,
}

impl Region {
    fn new(label: u32, nbands: usize, sumsq: bool, sumxlogx: bool) -> Self {
        Self {
            label,
            active: true,
            npix: 0,
            sum: vec![0.0; nbands],
            sumsq: if sumsq { vec![0.0; nbands] } else { vec![] },
            sumxlogx: if sumxlogx { vec![0.0; nbands] } else { vec![] },
            boundary_npix: 0,
            merge_threshold: 0.0,
            max_edge: 0.0,
            init_merge: false,
            neighbors: BTreeSet::new(),
            best_neighbor: Candidates::none(label),
            best_region: Candidates::none(label),
            merge_region_label: 0,
        }
    }

    pub fn mean(&self, band: usize) -> f64 {
        if self.npix == 0 {
            0.0
        } else {
            self.sum[band] / self.npix as f64
        }
    }

    /// Band-averaged standard deviation, 0 without sums of squares.
    pub fn std_dev(&self) -> f64 {
        if self.sumsq.is_empty() || self.npix == 0 {
            return 0.0;
        }
        let n = self.npix as f64;
        let total: f64 = self
            .sum
            .iter()
            .zip(&self.sumsq)
            .map(|(s, sq)| {
                let mean = s / n;
                (sq / n - mean * mean).max(0.0).sqrt()
            })
            .sum();
        total / self.sum.len() as f64
    }

    fn add_stats(&mut self, other: &Region) {
        self.npix += other.npix;
        self.sum
            .iter_mut()
            .zip(&other.sum)
            .for_each(|(a, b)| *a += b);
        self.sumsq
            .iter_mut()
            .zip(&other.sumsq)
            .for_each(|(a, b)| *a += b);
        self.sumxlogx
            .iter_mut()
            .zip(&other.sumxlogx)
            .for_each(|(a, b)| *a += b);
        self.max_edge = self.max_edge.max(other.max_edge);
    }
}

/// Outcome of [`RegionTable::merge`]: the change-set update propagation starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub survivor: u32,
    pub absorbed: u32,
    /// Neighbours of the survivor after the merge.
    pub neighbors: Vec<u32>,
}

/// Region arena of one partition. Region `label` lives at index `label - 1`; regions are never
/// removed, only deactivated, until [`RegionTable::compact`] renumbers them.
#[derive(Debug, Clone)]
pub struct RegionTable {
    regions: Vec<Region>,
    forest: LabelForest,
    nbands: usize,
    sumsq: bool,
    sumxlogx: bool,
    initial_merge_npix: u32,
    nactive: u32,
    max_threshold: f64,
}

impl RegionTable {
    pub fn new(nbands: usize, sumsq: bool, sumxlogx: bool, initial_merge_npix: u32) -> Self {
        Self {
            regions: Vec::new(),
            forest: LabelForest::default(),
            nbands,
            sumsq,
            sumxlogx,
            initial_merge_npix,
            nactive: 0,
            max_threshold: 0.0,
        }
    }

    pub fn nbands(&self) -> usize {
        self.nbands
    }

    pub fn has_sumsq(&self) -> bool {
        self.sumsq
    }

    pub fn has_sumxlogx(&self) -> bool {
        self.sumxlogx
    }

    /// Number of labels, active or not.
    pub fn len(&self) -> u32 {
        self.regions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn nactive(&self) -> u32 {
        self.nactive
    }

    pub fn max_threshold(&self) -> f64 {
        self.max_threshold
    }

    pub fn set_max_threshold(&mut self, threshold: f64) {
        self.max_threshold = self.max_threshold.max(threshold);
    }

    pub fn add_region(&mut self) -> u32 {
        let label = self.regions.len() as u32 + 1;
        self.regions
            .push(Region::new(label, self.nbands, self.sumsq, self.sumxlogx));
        self.forest.extend_to(label);
        self.nactive += 1;
        label
    }

    pub fn add_regions(&mut self, count: u32) {
        self.regions.reserve(count as usize);
        for _ in 0..count {
            self.add_region();
        }
    }

    #[inline]
    pub fn region(&self, label: u32) -> &Region {
        debug_assert!(
            label > 0 && label <= self.len(),
            "label {label} not in 1..={}",
            self.len()
        );
        &self.regions[label as usize - 1]
    }

    #[inline]
    pub fn region_mut(&mut self, label: u32) -> &mut Region {
        debug_assert!(
            label > 0 && label <= self.len(),
            "label {label} not in 1..={}",
            self.len()
        );
        &mut self.regions[label as usize - 1]
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn active(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().filter(|r| r.active)
    }

    pub fn active_labels(&self) -> Vec<u32> {
        self.active().map(|r| r.label).collect()
    }

    pub fn npix_total(&self) -> u64 {
        self.active().map(|r| r.npix as u64).sum()
    }

    /// Adds one pixel's feature vector and edge value to region `label`.
    pub fn accumulate(&mut self, label: u32, features: &[f32], edge: f32) {
        debug_assert_eq!(features.len(), self.nbands);
        let initial_merge_npix = self.initial_merge_npix;
        let region = self.region_mut(label);
        region.npix += 1;
        for (band, &x) in features.iter().enumerate() {
            let x = x as f64;
            region.sum[band] += x;
            if let Some(sq) = region.sumsq.get_mut(band) {
                *sq += x * x;
            }
            if let Some(xlx) = region.sumxlogx.get_mut(band) {
                if x > 0.0 {
                    *xlx += x * x.ln();
                }
            }
        }
        region.max_edge = region.max_edge.max(edge);
        region.init_merge = region.npix < initial_merge_npix;
    }

    /// Records a symmetric adjacency between two distinct labels.
    pub fn add_adjacency(&mut self, a: u32, b: u32) {
        if a == b || a == 0 || b == 0 {
            return;
        }
        self.region_mut(a).neighbors.insert(b);
        self.region_mut(b).neighbors.insert(a);
    }

    /// Merges region `b` into region `a`.
    ///
    /// Both must be active and distinct. `a` absorbs the statistics and neighbours of `b`,
    /// third parties adjacent to `b` become adjacent to `a`, and `b` turns into a forwarding
    /// entry pointing at `a`.
    pub fn merge(&mut self, a: u32, b: u32, threshold: f64) -> Merged {
        assert!(a != b, "cannot merge region {a} with itself");
        assert!(
            self.region(a).active && self.region(b).active,
            "merge of inactive regions {a} <- {b}"
        );
        let absorbed = std::mem::replace(
            self.region_mut(b),
            Region::new(b, 0, false, false),
        );
        for &n in &absorbed.neighbors {
            if n == a {
                continue;
            }
            let third = self.region_mut(n);
            third.neighbors.remove(&b);
            third.neighbors.insert(a);
        }
        let initial_merge_npix = self.initial_merge_npix;
        let survivor = self.region_mut(a);
        survivor.add_stats(&absorbed);
        survivor.neighbors.remove(&b);
        survivor
            .neighbors
            .extend(absorbed.neighbors.iter().copied().filter(|&n| n != a));
        survivor.merge_threshold = threshold;
        survivor.init_merge = survivor.npix < initial_merge_npix;
        let neighbors: Vec<u32> = survivor.neighbors.iter().copied().collect();

        // the absorbed record keeps its statistics for output but loses adjacency
        let gone = self.region_mut(b);
        *gone = Region {
            active: false,
            merge_region_label: a,
            neighbors: BTreeSet::new(),
            best_neighbor: Candidates::none(b),
            best_region: Candidates::none(b),
            ..absorbed
        };
        self.forest.union(a, b);
        self.nactive -= 1;
        self.set_max_threshold(threshold);
        Merged {
            survivor: a,
            absorbed: b,
            neighbors,
        }
    }

    /// Active label `label` ended up in.
    pub fn find(&mut self, label: u32) -> u32 {
        self.forest.find(label)
    }

    pub fn find_shared(&self, label: u32) -> u32 {
        self.forest.find_shared(label)
    }

    /// `(old, active)` for every inactive label, with the forwarding chain collapsed to one
    /// hop. The inactive records' `merge_region_label` are collapsed as well.
    pub fn resolve_merged(&mut self) -> Vec<(u32, u32)> {
        let mut map = Vec::new();
        for index in 0..self.regions.len() {
            if self.regions[index].active {
                continue;
            }
            let label = index as u32 + 1;
            let active = self.forest.find(label);
            self.regions[index].merge_region_label = active;
            map.push((label, active));
        }
        map
    }

    /// Renumbers the active regions to `1..=nactive` in label order and drops the inactive
    /// ones. Returns the old-to-new map indexed by old label (entry 0 is 0); merged-away labels
    /// map to the new label of the region they ended up in.
    pub fn compact(&mut self) -> Vec<u32> {
        let mut new_label = vec![0u32; self.regions.len() + 1];
        let mut next = 0u32;
        for region in &self.regions {
            if region.active {
                next += 1;
                new_label[region.label as usize] = next;
            }
        }
        for label in 1..=self.len() {
            if new_label[label as usize] == 0 {
                let active = self.forest.find(label);
                new_label[label as usize] = new_label[active as usize];
            }
        }
        let old = std::mem::take(&mut self.regions);
        self.regions = old
            .into_iter()
            .filter(|r| r.active)
            .map(|mut r| {
                r.label = new_label[r.label as usize];
                r.neighbors = r.neighbors.iter().map(|&n| new_label[n as usize]).collect();
                r.best_neighbor = Candidates::none(r.label);
                r.best_region = Candidates::none(r.label);
                r
            })
            .collect();
        self.forest = LabelForest::new(self.len());
        self.nactive = self.len();
        new_label
    }

    /// Appends a compacted table, shifting its labels by `offset`, which must equal the current
    /// label count so labels stay dense.
    pub fn append(&mut self, other: RegionTable, offset: u32) {
        assert_eq!(offset, self.len(), "appended labels must stay dense");
        assert_eq!(other.nactive, other.len(), "only compacted tables can be appended");
        assert_eq!(other.nbands, self.nbands);
        self.regions.extend(other.regions.into_iter().map(|mut r| {
            r.label += offset;
            r.neighbors = r.neighbors.iter().map(|&n| n + offset).collect();
            r.best_neighbor = Candidates::none(r.label);
            r.best_region = Candidates::none(r.label);
            r
        }));
        self.forest.extend_to(self.len());
        self.nactive += other.nactive;
        self.max_threshold = self.max_threshold.max(other.max_threshold);
    }

    /// Rebuilds a region from decoded parts. Used by the wire codec.
    pub(crate) fn push_decoded(&mut self, mut region: Region) {
        let label = self.len() + 1;
        region.label = label;
        region.active = true;
        region.merge_region_label = 0;
        region.best_neighbor = Candidates::none(label);
        region.best_region = Candidates::none(label);
        self.regions.push(region);
        self.forest.extend_to(label);
        self.nactive += 1;
    }

    pub(crate) fn blank_region(&self) -> Region {
        Region::new(0, self.nbands, self.sumsq, self.sumxlogx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: u32) -> RegionTable {
        let mut table = RegionTable::new(1, true, false, 0);
        table.add_regions(n);
        for label in 1..=n {
            table.accumulate(label, &[label as f32], 0.0);
        }
        for label in 1..n {
            table.add_adjacency(label, label + 1);
        }
        table
    }

    #[test]
    fn merge_moves_statistics_and_adjacency() {
        let mut table = chain(4);
        let merged = table.merge(2, 3, 0.5);
        assert_eq!(merged.neighbors, vec![1, 4]);
        let b = table.region(3);
        assert!(!b.active);
        assert_eq!(b.merge_region_label, 2);
        let a = table.region(2);
        assert_eq!(a.npix, 2);
        assert_eq!(a.sum, vec![5.0]);
        assert_eq!(a.sumsq, vec![13.0]);
        assert!(!a.neighbors.contains(&3));
        assert!(table.region(4).neighbors.contains(&2));
        assert!(!table.region(4).neighbors.contains(&3));
        assert_eq!(table.nactive(), 3);
        assert_eq!(table.max_threshold(), 0.5);
    }

    #[test]
    fn npix_conserved_over_merges() {
        let mut table = chain(6);
        table.merge(1, 2, 1.0);
        table.merge(4, 5, 1.0);
        table.merge(1, 3, 2.0);
        assert_eq!(table.npix_total(), 6);
        assert_eq!(table.nactive(), 3);
    }

    #[test]
    fn resolve_collapses_chains() {
        let mut table = chain(4);
        table.merge(3, 4, 1.0);
        table.merge(2, 3, 1.0);
        let map = table.resolve_merged();
        assert_eq!(map, vec![(3, 2), (4, 2)]);
        assert_eq!(table.region(4).merge_region_label, 2);
    }

    #[test]
    fn compact_renumbers_densely() {
        let mut table = chain(5);
        table.merge(1, 2, 1.0);
        table.merge(4, 5, 1.0);
        let map = table.compact();
        assert_eq!(map, vec![0, 1, 1, 2, 3, 3]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.nactive(), 3);
        assert_eq!(table.region(2).neighbors.iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(table.region(3).npix, 2);
    }

    #[test]
    fn append_offsets_labels() {
        let mut left = chain(2);
        let right = chain(3);
        left.append(right, 2);
        assert_eq!(left.len(), 5);
        assert_eq!(left.nactive(), 5);
        assert_eq!(left.region(4).neighbors.iter().copied().collect::<Vec<_>>(), vec![3, 5]);
    }
}
