//! Local region growing: repeatedly merge the globally best candidate pair of a partition.

use crate::common::Config;
use crate::dissim::{DissimEvaluator, MergeKey};
use crate::heap::CandidateHeap;
use crate::region::{Candidates, Merged, RegionTable};
use log::{debug, error};
use std::collections::BTreeSet;

/// Why [`Grower::grow`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The active region count reached the target.
    Target,
    /// The best remaining merge is above the configured merge threshold.
    Threshold,
    /// No region has a merge candidate left.
    NoCandidates,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowOutcome {
    pub merges: u32,
    pub stop: StopReason,
}

/// Which heap produced a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeKind {
    Neighbor,
    Region,
}

fn partner_key(candidates: &Candidates) -> Option<MergeKey> {
    candidates.partner().map(|partner| MergeKey {
        dissim: candidates.key.dissim,
        npix: candidates.key.npix,
        label: partner,
    })
}

/// Folds candidate `label` at dissimilarity `dissim` into `current` when it is strictly better
/// than the current partner, or ties with it on dissimilarity.
fn offer(
    current: &Candidates,
    owner: u32,
    owner_npix: u32,
    label: u32,
    npix: u32,
    dissim: f64,
) -> Option<Candidates> {
    let offered = MergeKey {
        dissim,
        npix: owner_npix + npix,
        label,
    };
    match partner_key(current) {
        Some(best) if !offered.is_better(&best) => {
            if dissim == best.dissim && !current.contains(label) {
                let mut labels = current.labels.clone();
                labels.push(label);
                Some(Candidates {
                    labels,
                    key: current.key,
                })
            } else {
                None
            }
        }
        Some(best) => {
            let mut labels = vec![label];
            if dissim == best.dissim {
                labels.extend(current.labels.iter().copied().filter(|&l| l != label));
            }
            Some(Candidates {
                labels,
                key: MergeKey {
                    dissim,
                    npix: offered.npix,
                    label: owner,
                },
            })
        }
        None if dissim.is_finite() => Some(Candidates {
            labels: vec![label],
            key: MergeKey {
                dissim,
                npix: offered.npix,
                label: owner,
            },
        }),
        None => None,
    }
}

/// Drives the merges of one partition.
///
/// The neighbor heap holds every active region keyed by its best adjacent candidate. The region
/// heap, used only while spectral clustering is on, holds the regions large enough for
/// non-adjacent merges, keyed by their best candidate among each other.
pub struct Grower {
    eval: DissimEvaluator,
    nghbr_heap: CandidateHeap,
    region_heap: CandidateHeap,
    spclust_active: bool,
    spclust_min_npix: u32,
    spclust_max_nregions: u32,
    merge_threshold: Option<f64>,
    heap_check: bool,
}

impl Grower {
    pub fn new(config: &Config, eval: DissimEvaluator) -> Self {
        Self {
            eval,
            nghbr_heap: CandidateHeap::new(),
            region_heap: CandidateHeap::new(),
            spclust_active: false,
            spclust_min_npix: config.spclust_min_npix,
            spclust_max_nregions: config.spclust_max_nregions,
            merge_threshold: config.merge_threshold,
            heap_check: config.heap_check,
        }
    }

    pub fn nghbr_heap(&self) -> &CandidateHeap {
        &self.nghbr_heap
    }

    pub fn region_heap(&self) -> &CandidateHeap {
        &self.region_heap
    }

    pub fn spclust_active(&self) -> bool {
        self.spclust_active
    }

    /// Computes every active region's best neighbor from scratch and builds the neighbor heap.
    /// Must be called again whenever the table was changed behind the grower's back.
    pub fn init(&mut self, table: &mut RegionTable) {
        let labels = table.active_labels();
        let mut keys = Vec::with_capacity(labels.len());
        for &label in &labels {
            let best = self.best_neighbor(table, label);
            keys.push(best.key);
            table.region_mut(label).best_neighbor = best;
        }
        self.nghbr_heap = CandidateHeap::build(keys);
        self.region_heap = CandidateHeap::new();
        self.spclust_active = false;
        let inactive: Vec<u32> = table.regions().filter(|r| !r.active).map(|r| r.label).collect();
        for label in inactive {
            let region = table.region_mut(label);
            region.best_neighbor = Candidates::none(label);
            region.best_region = Candidates::none(label);
        }
    }

    /// Merges until the active count is at or below `target`, the merge threshold is exceeded,
    /// or no candidates remain.
    pub fn grow(&mut self, table: &mut RegionTable, target: u32) -> GrowOutcome {
        let mut merges = 0;
        let stop = loop {
            if table.nactive() <= target {
                break StopReason::Target;
            }
            self.start_spclust(table);
            let Some((label, partner, dissim)) = self.next_merge(table) else {
                break StopReason::NoCandidates;
            };
            if let Some(max) = self.merge_threshold {
                if dissim > max {
                    break StopReason::Threshold;
                }
            }
            self.merge(table, label.min(partner), label.max(partner), dissim);
            merges += 1;
        };
        if self.heap_check {
            self.verify();
        }
        debug!(
            "grow: {merges} merges, {} regions left, stop {stop:?}",
            table.nactive()
        );
        GrowOutcome { merges, stop }
    }

    /// Runs the heap self-check on both heaps. Returns the number of repaired violations.
    pub fn verify(&mut self) -> usize {
        self.nghbr_heap.verify_heap() + self.region_heap.verify_heap()
    }

    fn eligible(&self, table: &RegionTable, label: u32) -> bool {
        let region = table.region(label);
        region.active && region.npix >= self.spclust_min_npix
    }

    fn start_spclust(&mut self, table: &mut RegionTable) {
        if self.spclust_active
            || !self.eval.spclust_enabled()
            || table.nactive() > self.spclust_max_nregions
        {
            return;
        }
        let eligible: Vec<u32> = table
            .active_labels()
            .into_iter()
            .filter(|&l| self.eligible(table, l))
            .collect();
        let mut keys = Vec::with_capacity(eligible.len());
        for &label in &eligible {
            let best = self.best_region(table, label, &eligible);
            keys.push(best.key);
            table.region_mut(label).best_region = best;
        }
        self.region_heap = CandidateHeap::build(keys);
        self.spclust_active = true;
        debug!("spectral clustering on with {} regions", eligible.len());
    }

    /// The pair the next merge would join, and its dissimilarity.
    fn next_merge(&self, table: &RegionTable) -> Option<(u32, u32, f64)> {
        let nghbr_top = self.nghbr_heap.peek().copied();
        let region_top = if self.spclust_active {
            self.region_heap.peek().copied()
        } else {
            None
        };
        let (top, kind) = match (nghbr_top, region_top) {
            (Some(n), Some(r)) if r.dissim < n.dissim => (r, MergeKind::Region),
            (Some(n), _) => (n, MergeKind::Neighbor),
            (None, Some(r)) => (r, MergeKind::Region),
            (None, None) => return None,
        };
        if top.is_none() {
            return None;
        }
        let region = table.region(top.label);
        let candidates = match kind {
            MergeKind::Neighbor => &region.best_neighbor,
            MergeKind::Region => &region.best_region,
        };
        match candidates.partner() {
            Some(partner) => Some((top.label, partner, top.dissim)),
            None => {
                error!(
                    "region {} heads the {kind:?} heap at dissimilarity {} with no candidate",
                    top.label, top.dissim
                );
                panic!("empty best-candidate set for region {}", top.label);
            }
        }
    }

    /// Merges `b` into `a` and brings both heaps up to date.
    pub fn merge(&mut self, table: &mut RegionTable, a: u32, b: u32, dissim: f64) -> Merged {
        self.nghbr_heap.remove(b);
        self.region_heap.remove(b);
        let merged = table.merge(a, b, dissim);
        self.update_neighbors(table, &merged);
        if self.spclust_active {
            self.update_regions(table, &merged);
        }
        merged
    }

    /// Best adjacent candidates of `label`, from scratch.
    pub fn best_neighbor(&self, table: &RegionTable, label: u32) -> Candidates {
        let region = table.region(label);
        let mut best = Candidates::none(label);
        for &n in &region.neighbors {
            let other = table.region(n);
            let dissim = self.eval.neighbor(region, other);
            if let Some(better) = offer(&best, label, region.npix, n, other.npix, dissim) {
                best = better;
            }
        }
        best
    }

    fn best_region(&self, table: &RegionTable, label: u32, eligible: &[u32]) -> Candidates {
        let region = table.region(label);
        let mut best = Candidates::none(label);
        for &other_label in eligible {
            if other_label == label {
                continue;
            }
            let other = table.region(other_label);
            let dissim = self.eval.nonadjacent(region, other);
            if let Some(better) = offer(&best, label, region.npix, other_label, other.npix, dissim)
            {
                best = better;
            }
        }
        best
    }

    /// Two-pass update of the neighbor heap after a merge.
    ///
    /// Pass one walks the survivor's neighbours: those whose best candidates pointed at the
    /// survivor or the absorbed region go into the induced set, the others are offered the
    /// survivor as a candidate. Pass two recomputes the survivor and the induced set from
    /// scratch.
    fn update_neighbors(&mut self, table: &mut RegionTable, merged: &Merged) {
        let (a, b) = (merged.survivor, merged.absorbed);
        let mut stale: BTreeSet<u32> = BTreeSet::from([a]);
        for &n in &merged.neighbors {
            let current = &table.region(n).best_neighbor;
            if current.contains(a) || current.contains(b) {
                stale.insert(n);
                continue;
            }
            let region = table.region(n);
            let survivor = table.region(a);
            let dissim = self.eval.neighbor(region, survivor);
            if let Some(better) = offer(current, n, region.npix, a, survivor.npix, dissim) {
                self.nghbr_heap.update(better.key);
                table.region_mut(n).best_neighbor = better;
            }
        }
        for label in stale {
            let best = self.best_neighbor(table, label);
            self.nghbr_heap.update(best.key);
            table.region_mut(label).best_neighbor = best;
        }
    }

    /// Same two passes as [`Grower::update_neighbors`], over the region heap.
    fn update_regions(&mut self, table: &mut RegionTable, merged: &Merged) {
        let (a, b) = (merged.survivor, merged.absorbed);
        let survivor_eligible = self.eligible(table, a);
        let mut stale = BTreeSet::new();
        if survivor_eligible {
            stale.insert(a);
        } else {
            self.region_heap.remove(a);
        }
        let members: Vec<u32> = self.region_heap.labels().filter(|&l| l != a).collect();
        for &r in &members {
            let current = &table.region(r).best_region;
            if current.contains(a) || current.contains(b) {
                stale.insert(r);
                continue;
            }
            if !survivor_eligible {
                continue;
            }
            let region = table.region(r);
            let survivor = table.region(a);
            let dissim = self.eval.nonadjacent(region, survivor);
            if let Some(better) = offer(current, r, region.npix, a, survivor.npix, dissim) {
                self.region_heap.update(better.key);
                table.region_mut(r).best_region = better;
            }
        }
        let mut eligible = members;
        if survivor_eligible {
            eligible.push(a);
        }
        for label in stale {
            let best = self.best_region(table, label, &eligible);
            self.region_heap.update(best.key);
            table.region_mut(label).best_region = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single band 1-D strip of regions, one pixel each.
    fn strip(values: &[f32]) -> RegionTable {
        let mut table = RegionTable::new(1, false, false, 0);
        for &v in values {
            let label = table.add_region();
            table.accumulate(label, &[v], 0.0);
        }
        for label in 1..values.len() as u32 {
            table.add_adjacency(label, label + 1);
        }
        table
    }

    fn grower(config: &Config) -> Grower {
        Grower::new(config, DissimEvaluator::new(config, 1.0))
    }

    fn assert_caches_fresh(grower: &Grower, table: &RegionTable) {
        for label in table.active_labels() {
            let cached = &table.region(label).best_neighbor;
            let fresh = grower.best_neighbor(table, label);
            assert_eq!(cached.key, fresh.key, "stale key for region {label}");
            assert_eq!(grower.nghbr_heap().key(label), Some(fresh.key));
        }
        assert!(grower.nghbr_heap().is_valid());
    }

    #[test]
    #[should_panic(expected = "empty best-candidate set")]
    fn heap_head_without_partner_is_fatal() {
        let config = Config::default();
        let mut table = strip(&[0.0, 0.1, 5.0]);
        let mut grower = grower(&config);
        grower.init(&mut table);
        for label in 1..=3 {
            table.region_mut(label).best_neighbor.labels.clear();
        }
        grower.grow(&mut table, 1);
    }

    #[test]
    fn merges_most_similar_first() {
        let config = Config::default();
        let mut table = strip(&[0.0, 0.1, 5.0, 5.2, 9.0]);
        let mut grower = grower(&config);
        grower.init(&mut table);
        let outcome = grower.grow(&mut table, 3);
        assert_eq!(outcome, GrowOutcome { merges: 2, stop: StopReason::Target });
        assert_eq!(table.find(2), 1);
        assert_eq!(table.find(4), 3);
        assert_eq!(table.region(1).npix, 2);
        assert_caches_fresh(&grower, &table);
    }

    #[test]
    fn equal_dissimilarity_prefers_larger_then_lower_label() {
        let config = Config::default();
        // 1 and 2 are equal, 3 and 4 are equal: both pairs have dissimilarity 0
        let mut table = strip(&[1.0, 1.0, 8.0, 8.0]);
        table.accumulate(3, &[8.0], 0.0);
        let mut grower = grower(&config);
        grower.init(&mut table);
        grower.grow(&mut table, 3);
        // pair (3, 4) has the larger combined count
        assert!(!table.region(4).active);
        assert!(table.region(2).active);
        grower.grow(&mut table, 2);
        assert!(!table.region(2).active);
        assert_eq!(table.region(2).merge_region_label, 1);
    }

    #[test]
    fn threshold_stops_growing() {
        let config = Config {
            merge_threshold: Some(0.5),
            ..Config::default()
        };
        let mut table = strip(&[0.0, 0.0, 3.0, 3.0]);
        let mut grower = grower(&config);
        grower.init(&mut table);
        let outcome = grower.grow(&mut table, 1);
        assert_eq!(outcome.stop, StopReason::Threshold);
        assert_eq!(table.nactive(), 2);
        assert_eq!(table.npix_total(), 4);
    }

    #[test]
    fn isolated_regions_run_out_of_candidates() {
        let config = Config::default();
        let mut table = RegionTable::new(1, false, false, 0);
        for v in [1.0, 2.0] {
            let label = table.add_region();
            table.accumulate(label, &[v], 0.0);
        }
        let mut grower = grower(&config);
        grower.init(&mut table);
        assert_eq!(grower.grow(&mut table, 1).stop, StopReason::NoCandidates);
    }

    #[test]
    fn caches_stay_fresh_over_long_runs() {
        let config = Config::default();
        let values: Vec<f32> = (0..64).map(|i| ((i * 37) % 23) as f32).collect();
        let mut table = strip(&values);
        // a few long-range adjacencies
        table.add_adjacency(1, 40);
        table.add_adjacency(10, 60);
        let mut grower = grower(&config);
        grower.init(&mut table);
        for target in (1..64).rev().step_by(7) {
            grower.grow(&mut table, target);
            assert_caches_fresh(&grower, &table);
            assert_eq!(table.npix_total(), 64);
        }
    }

    #[test]
    fn spectral_clustering_joins_distant_regions() {
        let config = Config {
            spclust_wght: 1.0,
            spclust_min_npix: 1,
            ..Config::default()
        };
        // 1 and 3 are identical but separated by a very different region
        let mut table = strip(&[4.0, 100.0, 4.0]);
        let mut grower = grower(&config);
        grower.init(&mut table);
        grower.grow(&mut table, 2);
        assert!(grower.spclust_active());
        assert_eq!(table.find(3), 1);
        assert!(grower.region_heap().is_valid());
        assert!(!grower.region_heap().contains(3));
    }
}
