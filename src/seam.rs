//! Seam bookkeeping and artifact elimination across the cuts of a combined partition.

use crate::common::{Config, Neighborhood};
use crate::dissim::DissimEvaluator;
use crate::extent::{neighbor_offsets, Axis, Cut};
use crate::region::RegionTable;
use crate::section::PixelSection;
use log::debug;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeamStats {
    /// Pixel pairs straddling the cut.
    pub npix: u32,
    /// Sum of the pairs' normalized edge values.
    pub edge_sum: f64,
}

impl SeamStats {
    pub fn mean_edge(&self) -> f64 {
        if self.npix == 0 {
            0.0
        } else {
            self.edge_sum / self.npix as f64
        }
    }

    fn absorb(&mut self, other: &SeamStats) {
        self.npix += other.npix;
        self.edge_sum += other.edge_sum;
    }
}

/// Region pairs touching across one cut, keyed `(smaller, larger)` label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeamTable {
    pairs: BTreeMap<(u32, u32), SeamStats>,
}

/// Index pairs `(near, far)` of valid neighbouring pixels on either side of `cut` in `slab`,
/// the two-pixel-thick section straddling it.
pub fn cross_pairs(
    slab: &PixelSection,
    cut: &Cut,
    neighborhood: Neighborhood,
) -> Vec<(usize, usize)> {
    let (w, h, d) = slab.extent().size();
    let across: Vec<(isize, isize, isize)> = neighbor_offsets(neighborhood, d > 1)
        .into_iter()
        .filter(|&(dx, dy, dz)| match cut.axis {
            Axis::Col => dx == 1,
            Axis::Row => dy == 1,
            Axis::Slice => dz == 1,
        })
        .collect();
    let (near_w, near_h, near_d) = match cut.axis {
        Axis::Col => (1, h, d),
        Axis::Row => (w, 1, d),
        Axis::Slice => (w, h, 1),
    };
    let valid = slab.valid();
    let index = |x: usize, y: usize, z: usize| (z * h + y) * w + x;
    let mut pairs = Vec::new();
    for z in 0..near_d {
        for y in 0..near_h {
            for x in 0..near_w {
                let a = index(x, y, z);
                if !valid[a] {
                    continue;
                }
                for &(dx, dy, dz) in &across {
                    let (nx, ny, nz) = (x as isize + dx, y as isize + dy, z as isize + dz);
                    if nx < 0
                        || ny < 0
                        || nz < 0
                        || nx >= w as isize
                        || ny >= h as isize
                        || nz >= d as isize
                    {
                        continue;
                    }
                    let b = index(nx as usize, ny as usize, nz as usize);
                    if valid[b] {
                        pairs.push((a, b));
                    }
                }
            }
        }
    }
    pairs
}

impl SeamTable {
    /// Collects the region pairs of `slab` across `cut`. Edge values are divided by
    /// `edge_scale`.
    pub fn from_slab(
        slab: &PixelSection,
        cut: &Cut,
        neighborhood: Neighborhood,
        edge_scale: f32,
    ) -> Self {
        let scale = if edge_scale > 0.0 { edge_scale as f64 } else { 1.0 };
        let labels = slab.labels();
        let edges = slab.edges();
        let mut table = SeamTable::default();
        for (a, b) in cross_pairs(slab, cut, neighborhood) {
            if labels[a] == 0 || labels[b] == 0 || labels[a] == labels[b] {
                continue;
            }
            let edge = (edges[a] as f64 + edges[b] as f64) / 2.0 / scale;
            table.add(labels[a], labels[b], edge);
        }
        table
    }

    pub fn add(&mut self, a: u32, b: u32, edge: f64) {
        let stats = self.pairs.entry((a.min(b), a.max(b))).or_default();
        stats.npix += 1;
        stats.edge_sum += edge;
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, a: u32, b: u32) -> Option<&SeamStats> {
        self.pairs.get(&(a.min(b), a.max(b)))
    }

    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32, &SeamStats)> {
        self.pairs.iter().map(|(&(a, b), stats)| (a, b, stats))
    }

    /// Re-keys the pairs by the active labels their regions ended up in, dropping pairs that
    /// now lie inside one region.
    pub fn resolve(&self, table: &RegionTable) -> SeamTable {
        let mut resolved = SeamTable::default();
        for (a, b, stats) in self.pairs() {
            let (a, b) = (table.find_shared(a), table.find_shared(b));
            if a != b {
                resolved
                    .pairs
                    .entry((a.min(b), a.max(b)))
                    .or_default()
                    .absorb(stats);
            }
        }
        resolved
    }

    /// Records every pair as a region adjacency.
    pub fn add_adjacencies(&self, table: &mut RegionTable) {
        for (a, b, _) in self.pairs() {
            let (a, b) = (table.find(a), table.find(b));
            table.add_adjacency(a, b);
        }
    }
}

/// Merges region pairs whose shared seam looks like a cut artifact rather than a real
/// boundary.
pub struct ArtifactEliminator<'a> {
    eval: &'a DissimEvaluator,
    min_seam_npix: u32,
    seam_edge_threshold: f64,
    min_region_npix: u32,
}

impl<'a> ArtifactEliminator<'a> {
    pub fn new(config: &Config, eval: &'a DissimEvaluator) -> Self {
        Self {
            eval,
            min_seam_npix: config.min_seam_npix,
            seam_edge_threshold: config.seam_edge_threshold as f64,
            min_region_npix: config.min_seam_edge_region_size,
        }
    }

    fn qualifies(&self, table: &RegionTable, a: u32, b: u32, stats: &SeamStats) -> bool {
        stats.npix >= self.min_seam_npix
            && stats.mean_edge() <= self.seam_edge_threshold
            && table.region(a).npix.max(table.region(b).npix) >= self.min_region_npix
    }

    /// Runs over the seam of one cut and returns the number of merges. The smaller label
    /// survives; after each merge the survivor's seam neighbours are scanned again.
    pub fn eliminate(&self, table: &mut RegionTable, seam: &SeamTable) -> u32 {
        let seam = seam.resolve(table);
        let mut adjacency: BTreeMap<u32, BTreeMap<u32, SeamStats>> = BTreeMap::new();
        for (a, b, stats) in seam.pairs() {
            adjacency.entry(a).or_default().insert(b, *stats);
            adjacency.entry(b).or_default().insert(a, *stats);
        }

        let mut merges = 0;
        let labels: Vec<u32> = adjacency.keys().copied().collect();
        for label in labels {
            let mut region = table.find(label);
            loop {
                let Some(seam_neighbors) = adjacency.get(&region) else {
                    break;
                };
                let Some(other) = seam_neighbors
                    .iter()
                    .find(|&(&n, stats)| self.qualifies(table, region, n, stats))
                    .map(|(&n, _)| n)
                else {
                    break;
                };
                let (a, b) = (region.min(other), region.max(other));
                let dissim = self.eval.neighbor(table.region(a), table.region(b));
                table.merge(a, b, dissim);
                merges += 1;

                let absorbed = adjacency.remove(&b).unwrap_or_default();
                for (n, stats) in absorbed {
                    if let Some(map) = adjacency.get_mut(&n) {
                        map.remove(&b);
                    }
                    if n == a {
                        continue;
                    }
                    adjacency.entry(a).or_default().entry(n).or_default().absorb(&stats);
                    adjacency.entry(n).or_default().entry(a).or_default().absorb(&stats);
                }
                region = a;
            }
        }
        if merges > 0 {
            debug!("artifact elimination merged {merges} region pairs");
        }
        merges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;
    use crate::protocol::PixelData;

    /// A 2 x `rows` slab across a column cut at 1.
    fn slab(left: &[u32], right: &[u32], edge: f32) -> PixelSection {
        let rows = left.len();
        let extent = Extent::new(2, rows, 1);
        let mut labels = Vec::new();
        for (l, r) in left.iter().zip(right) {
            labels.push(*l);
            labels.push(*r);
        }
        let mut section = PixelSection::blank(extent, 1);
        section
            .import(&PixelData {
                extent,
                valid: vec![true; 2 * rows],
                objects: vec![0; 2 * rows],
                features: vec![0.0; 2 * rows],
                edges: vec![edge; 2 * rows],
                labels,
            })
            .unwrap();
        section
    }

    fn col_cut() -> Cut {
        Cut {
            axis: Axis::Col,
            at: 1,
        }
    }

    fn regions(sizes: &[u32]) -> RegionTable {
        let mut table = RegionTable::new(1, false, false, 0);
        for &npix in sizes {
            let label = table.add_region();
            for _ in 0..npix {
                table.accumulate(label, &[label as f32], 0.0);
            }
        }
        table
    }

    #[test]
    fn seam_pairs_by_neighborhood() {
        let slab = slab(&[1, 1, 1], &[2, 2, 3], 0.5);
        let four = SeamTable::from_slab(&slab, &col_cut(), Neighborhood::Four, 1.0);
        assert_eq!(four.get(1, 2).map(|s| s.npix), Some(2));
        assert_eq!(four.get(3, 1).map(|s| s.npix), Some(1));
        assert_eq!(four.get(1, 2).map(|s| s.mean_edge()), Some(0.5));
        let eight = SeamTable::from_slab(&slab, &col_cut(), Neighborhood::Eight, 1.0);
        assert_eq!(eight.get(1, 2).map(|s| s.npix), Some(5));
        assert_eq!(eight.get(1, 3).map(|s| s.npix), Some(2));
    }

    #[test]
    fn merges_quiet_seam_between_large_regions() {
        let config = Config {
            min_seam_npix: 2,
            min_seam_edge_region_size: 10,
            seam_edge_threshold: 0.1,
            ..Config::default()
        };
        let eval = DissimEvaluator::new(&config, 1.0);
        let eliminator = ArtifactEliminator::new(&config, &eval);
        let seam = SeamTable::from_slab(
            &slab(&[1, 1, 1], &[2, 2, 2], 0.0),
            &col_cut(),
            Neighborhood::Four,
            1.0,
        );

        let mut table = regions(&[12, 8]);
        assert_eq!(eliminator.eliminate(&mut table, &seam), 1);
        assert_eq!(table.find(2), 1);
        assert_eq!(table.region(1).npix, 20);

        // both regions too small
        let mut table = regions(&[4, 8]);
        assert_eq!(eliminator.eliminate(&mut table, &seam), 0);

        // strong edge along the seam
        let loud = SeamTable::from_slab(
            &slab(&[1, 1, 1], &[2, 2, 2], 0.5),
            &col_cut(),
            Neighborhood::Four,
            1.0,
        );
        let mut table = regions(&[12, 8]);
        assert_eq!(eliminator.eliminate(&mut table, &loud), 0);
    }

    #[test]
    fn merges_cascade_along_one_seam() {
        let config = Config {
            min_seam_npix: 2,
            min_seam_edge_region_size: 10,
            seam_edge_threshold: 0.1,
            ..Config::default()
        };
        let eval = DissimEvaluator::new(&config, 1.0);
        let eliminator = ArtifactEliminator::new(&config, &eval);
        // (1, 4) only reaches two pairs once 1 absorbed 2, and 3 is only reachable through 4
        let mut seam = SeamTable::default();
        for (a, b) in [(1, 2), (1, 2), (1, 4), (2, 4), (4, 3), (4, 3)] {
            seam.add(a, b, 0.0);
        }
        let mut table = regions(&[12, 3, 3, 3]);
        let merges = eliminator.eliminate(&mut table, &seam);
        assert_eq!(merges, 3);
        assert_eq!(table.nactive(), 1);
        assert_eq!(table.npix_total(), 21);
    }

    #[test]
    fn resolve_follows_merges() {
        let mut seam = SeamTable::default();
        seam.add(1, 3, 0.5);
        seam.add(2, 3, 0.5);
        seam.add(1, 2, 0.5);
        let mut table = regions(&[1, 1, 1]);
        table.merge(1, 2, 0.0);
        let resolved = seam.resolve(&table);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved.get(1, 3).map(|s| s.npix), Some(2));
    }
}
