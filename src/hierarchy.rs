//! Segmentation hierarchy emitted at the root once the recursion converged.
//!
//! Level 0 is the converged root table. Every further level keeps merging the same table, so
//! all levels share the level-0 label space: a level-0 label is either still active at a
//! level or forwards to the active label it was merged into.

use crate::common::{split_length_to_ranges, Config};
use crate::dissim::DissimEvaluator;
use crate::error::Error;
use crate::extent::{neighbor_offsets, Extent};
use crate::grow::{Grower, StopReason};
use crate::raster::RasterSink;
use crate::region::{Region, RegionTable};
use crate::results::{
    write_object_records, write_region_records, ObjectRecord, OutputFlags, RegionRecord,
};
use bytes::BufMut;
use log::info;
use rayon::current_num_threads;
use rayon::prelude::*;

/// One emitted hierarchy level.
#[derive(Clone, Debug)]
pub struct Level {
    pub index: usize,
    /// Active regions at this level.
    pub nregions: u32,
    /// Largest merge dissimilarity seen up to this level.
    pub max_threshold: f64,
    /// One record per level-0 region label, in label order.
    pub regions: Vec<RegionRecord>,
    /// One record per level-0 object label, in label order.
    pub objects: Vec<ObjectRecord>,
    class_lut: Vec<u32>,
    object_lut: Vec<u32>,
}

impl Level {
    pub fn nobjects(&self) -> usize {
        self.objects.iter().filter(|o| o.is_active()).count()
    }

    /// Active label of level-0 region `label` at this level.
    pub fn class_of(&self, label: u32) -> u32 {
        self.class_lut.get(label as usize).copied().unwrap_or(0)
    }

    pub fn object_of(&self, label: u32) -> u32 {
        self.object_lut.get(label as usize).copied().unwrap_or(0)
    }
}

/// Result of a segmentation run: the level-0 label maps and the hierarchy levels.
#[derive(Clone, Debug)]
pub struct Segmentation {
    extent: Extent,
    nbands: usize,
    output: OutputFlags,
    class_map: Vec<u32>,
    object_map: Vec<u32>,
    levels: Vec<Level>,
}

impl Segmentation {
    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn nbands(&self) -> usize {
        self.nbands
    }

    pub fn output(&self) -> &OutputFlags {
        &self.output
    }

    pub fn nlevels(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&Level> {
        self.levels.get(index)
    }

    fn checked_level(&self, index: usize) -> Result<&Level, Error> {
        self.levels.get(index).ok_or(Error::IndexOutOfBounds(index))
    }

    /// Region label of every pixel at `level`, column fastest. 0 for invalid pixels.
    pub fn class_map(&self, level: usize) -> Result<Vec<u32>, Error> {
        let level = self.checked_level(level)?;
        Ok(self.class_map.iter().map(|&l| level.class_of(l)).collect())
    }

    pub fn object_map(&self, level: usize) -> Result<Vec<u32>, Error> {
        let level = self.checked_level(level)?;
        Ok(self.object_map.iter().map(|&l| level.object_of(l)).collect())
    }

    pub fn write_label_maps(
        &self,
        level: usize,
        classes: &mut dyn RasterSink,
        objects: &mut dyn RasterSink,
    ) -> Result<(), Error> {
        let level = self.checked_level(level)?;
        let (w, h, d) = self.extent.size();
        for slice in 0..d {
            for row in 0..h {
                for col in 0..w {
                    let index = (slice * h + row) * w + col;
                    classes.put_label(col, row, slice, level.class_of(self.class_map[index]));
                    objects.put_label(col, row, slice, level.object_of(self.object_map[index]));
                }
            }
        }
        Ok(())
    }

    /// Writes the region and object record streams of `level`.
    pub fn write_records<B: BufMut>(
        &self,
        level: usize,
        regions: &mut B,
        objects: &mut B,
    ) -> Result<(), Error> {
        let level = self.checked_level(level)?;
        write_region_records(regions, &level.regions, &self.output);
        write_object_records(objects, &level.objects, &self.output);
        Ok(())
    }
}

/// Boundary pixel count of every label of `map`, indexed by label.
fn boundary_counts(
    map: &[u32],
    extent: &Extent,
    offsets: &[(isize, isize, isize)],
    nlabels: usize,
) -> Vec<u32> {
    let (w, h, d) = extent.size();
    let ranges = split_length_to_ranges(h * d, current_num_threads());
    ranges
        .into_par_iter()
        .map(|rows| {
            let mut counts = vec![0u32; nlabels + 1];
            for r in rows {
                let (y, z) = (r % h, r / h);
                for x in 0..w {
                    let label = map[r * w + x];
                    if label == 0 {
                        continue;
                    }
                    let boundary = offsets.iter().any(|&(dx, dy, dz)| {
                        let (nx, ny, nz) = (x as isize + dx, y as isize + dy, z as isize + dz);
                        if nx < 0 || ny < 0 || nz < 0 {
                            return false;
                        }
                        let (nx, ny, nz) = (nx as usize, ny as usize, nz as usize);
                        if nx >= w || ny >= h || nz >= d {
                            return false;
                        }
                        let other = map[(nz * h + ny) * w + nx];
                        other != 0 && other != label
                    });
                    if boundary {
                        counts[label as usize] += 1;
                    }
                }
            }
            counts
        })
        .reduce(
            || vec![0u32; nlabels + 1],
            |mut a, b| {
                a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                a
            },
        )
}

fn lut(table: &mut RegionTable) -> Vec<u32> {
    (0..=table.len()).map(|label| table.find(label)).collect()
}

fn object_record(region: &Region) -> ObjectRecord {
    if !region.active {
        return ObjectRecord {
            label: region.label,
            merge_region_label: region.merge_region_label,
            ..ObjectRecord::default()
        };
    }
    ObjectRecord {
        label: region.label,
        merge_region_label: 0,
        npix: region.npix,
        sum: region.sum.clone(),
        sumsq: region.sumsq.clone(),
        sumxlogx: region.sumxlogx.clone(),
        std_dev: region.std_dev(),
    }
}

/// Builds the hierarchy from the converged root.
pub(crate) struct HierarchyBuilder<'a> {
    config: &'a Config,
    extent: Extent,
    nbands: usize,
    class_map: Vec<u32>,
    object_map: Vec<u32>,
    regions: RegionTable,
    objects: RegionTable,
    /// Level-0 region label of every object.
    classes: Vec<u32>,
}

impl<'a> HierarchyBuilder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a Config,
        extent: Extent,
        nbands: usize,
        class_map: Vec<u32>,
        object_map: Vec<u32>,
        regions: RegionTable,
        objects: RegionTable,
        classes: Vec<u32>,
    ) -> Self {
        Self {
            config,
            extent,
            nbands,
            class_map,
            object_map,
            regions,
            objects,
            classes,
        }
    }

    pub fn build(mut self, eval: DissimEvaluator) -> Segmentation {
        let mut grower = Grower::new(self.config, eval);
        grower.init(&mut self.regions);
        let mut levels = vec![self.emit(0)];
        let final_nregions = self.config.final_nregions;
        let mut last = self.regions.nactive();
        while last > final_nregions {
            let target = ((last as f64 * self.config.level_factor as f64).ceil() as u32)
                .clamp(final_nregions, last - 1);
            let outcome = grower.grow(&mut self.regions, target);
            if outcome.merges == 0 {
                break;
            }
            self.merge_objects();
            levels.push(self.emit(levels.len()));
            last = self.regions.nactive();
            if outcome.stop != StopReason::Target {
                break;
            }
        }
        Segmentation {
            extent: self.extent,
            nbands: self.nbands,
            output: self.config.output,
            class_map: self.class_map,
            object_map: self.object_map,
            levels,
        }
    }

    /// Unions adjacent objects whose regions now share a label. The smaller object label
    /// survives.
    fn merge_objects(&mut self) {
        let mut pairs = Vec::new();
        for object in self.objects.active() {
            let class = self.regions.find_shared(self.classes[object.label as usize - 1]);
            for &n in object.neighbors.range(object.label + 1..) {
                if self.regions.find_shared(self.classes[n as usize - 1]) == class {
                    pairs.push((object.label, n, class));
                }
            }
        }
        for (a, b, class) in pairs {
            let (a, b) = (self.objects.find(a), self.objects.find(b));
            if a != b {
                let threshold = self.regions.region(class).merge_threshold;
                self.objects.merge(a.min(b), a.max(b), threshold);
            }
        }
    }

    fn emit(&mut self, index: usize) -> Level {
        let class_lut = lut(&mut self.regions);
        let object_lut = lut(&mut self.objects);
        let nlabels = self.regions.len() as usize;

        let map: Vec<u32> = self.class_map.iter().map(|&l| class_lut[l as usize]).collect();
        let offsets = neighbor_offsets(self.config.neighborhood, self.extent.is_3d());
        let boundary = boundary_counts(&map, &self.extent, &offsets, nlabels);
        for label in self.regions.active_labels() {
            self.regions.region_mut(label).boundary_npix = boundary[label as usize];
        }
        self.regions.resolve_merged();
        self.objects.resolve_merged();

        let mut object_lists = vec![Vec::new(); nlabels + 1];
        for object in self.objects.active() {
            let class = class_lut[self.classes[object.label as usize - 1] as usize];
            object_lists[class as usize].push(object.label);
        }

        let regions: Vec<RegionRecord> = self
            .regions
            .regions()
            .map(|region| {
                if !region.active {
                    return RegionRecord {
                        label: region.label,
                        merge_region_label: region.merge_region_label,
                        ..RegionRecord::default()
                    };
                }
                RegionRecord {
                    label: region.label,
                    merge_region_label: 0,
                    npix: region.npix,
                    sum: region.sum.clone(),
                    sumsq: region.sumsq.clone(),
                    sumxlogx: region.sumxlogx.clone(),
                    std_dev: region.std_dev(),
                    threshold: region.merge_threshold,
                    boundary_npix: region.boundary_npix,
                    neighbors: region.neighbors.iter().copied().collect(),
                    objects: std::mem::take(&mut object_lists[region.label as usize]),
                }
            })
            .collect();
        let objects: Vec<ObjectRecord> = self.objects.regions().map(object_record).collect();

        let level = Level {
            index,
            nregions: self.regions.nactive(),
            max_threshold: self.regions.max_threshold(),
            regions,
            objects,
            class_lut,
            object_lut,
        };
        info!(
            "level {}: {} regions, {} objects, max threshold {:.6}",
            level.index,
            level.nregions,
            level.nobjects(),
            level.max_threshold
        );
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Neighborhood;
    use crate::connectivity::label_components;

    /// Builds the level-0 tables of a class map the way the root does.
    fn builder<'a>(
        config: &'a Config,
        w: usize,
        h: usize,
        values: &[f32],
        class_map: Vec<u32>,
    ) -> HierarchyBuilder<'a> {
        let extent = Extent::new(w, h, 1);
        let nclasses = *class_map.iter().max().unwrap();
        let mut regions = RegionTable::new(1, false, false, 0);
        regions.add_regions(nclasses);
        let valid = vec![true; w * h];
        let (object_map, nobjects) =
            label_components(extent.size(), &valid, config.neighborhood, |a, b| {
                class_map[a] == class_map[b]
            });
        let mut objects = RegionTable::new(1, false, false, 0);
        objects.add_regions(nobjects);
        let mut classes = vec![0; nobjects as usize];
        for (i, &v) in values.iter().enumerate() {
            regions.accumulate(class_map[i], &[v], 0.0);
            objects.accumulate(object_map[i], &[v], 0.0);
            classes[object_map[i] as usize - 1] = class_map[i];
        }
        let offsets = neighbor_offsets(config.neighborhood, false);
        for y in 0..h {
            for x in 0..w {
                for &(dx, dy, _) in &offsets {
                    let (nx, ny) = (x as isize + dx, y as isize + dy);
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let (a, b) = (y * w + x, ny as usize * w + nx as usize);
                    regions.add_adjacency(class_map[a], class_map[b]);
                    objects.add_adjacency(object_map[a], object_map[b]);
                }
            }
        }
        HierarchyBuilder::new(config, extent, 1, class_map, object_map, regions, objects, classes)
    }

    #[test]
    fn levels_shrink_to_final_count() {
        let config = Config {
            converge_nregions: 4,
            final_nregions: 1,
            level_factor: 0.5,
            ..Config::default()
        };
        #[rustfmt::skip]
        let values = [
            1.0, 1.0, 9.0, 9.0,
            1.0, 1.0, 9.0, 9.0,
            2.0, 2.0, 7.0, 7.0,
            2.0, 2.0, 7.0, 7.0,
        ];
        let class_map = vec![1, 1, 2, 2, 1, 1, 2, 2, 3, 3, 4, 4, 3, 3, 4, 4];
        let seg =
            builder(&config, 4, 4, &values, class_map).build(DissimEvaluator::new(&config, 8.0));

        let counts: Vec<u32> = seg.levels().iter().map(|l| l.nregions).collect();
        assert_eq!(counts, vec![4, 2, 1]);
        let level1 = seg.level(1).unwrap();
        // 1 and 3 are the closest pair, then 2 and 4
        assert_eq!(level1.class_of(3), 1);
        assert_eq!(level1.class_of(4), 2);
        assert_eq!(level1.regions[2].merge_region_label, 1);
        assert_eq!(level1.regions[0].npix, 8);
        assert_eq!(level1.regions[0].boundary_npix, 4);
        assert_eq!(level1.nobjects(), 2);
        assert!(seg.levels().windows(2).all(|w| w[0].max_threshold <= w[1].max_threshold));

        let last = seg.level(2).unwrap();
        assert_eq!(last.regions[0].npix, 16);
        assert_eq!(last.regions[0].boundary_npix, 0);
        assert_eq!(last.regions[0].objects, vec![1]);
        assert_eq!(seg.class_map(2).unwrap(), vec![1; 16]);
    }

    #[test]
    fn separated_objects_of_one_class_stay_apart() {
        let config = Config {
            converge_nregions: 2,
            final_nregions: 1,
            neighborhood: Neighborhood::Four,
            ..Config::default()
        };
        // class 1 on both ends, class 2 in between
        let values = [1.0, 5.0, 1.2];
        let eval = DissimEvaluator::new(&config, 4.0);
        let seg = builder(&config, 3, 1, &values, vec![1, 2, 1]).build(eval);
        let level0 = seg.level(0).unwrap();
        assert_eq!(level0.nobjects(), 3);
        assert_eq!(level0.regions[0].objects, vec![1, 3]);
        let last = seg.level(seg.nlevels() - 1).unwrap();
        assert_eq!(last.nregions, 1);
        assert_eq!(last.nobjects(), 1);
        assert_eq!(seg.object_map(seg.nlevels() - 1).unwrap(), vec![1, 1, 1]);
    }

    #[test]
    fn missing_level_is_an_error() {
        let config = Config::default();
        let eval = DissimEvaluator::new(&config, 1.0);
        let seg = builder(&config, 2, 1, &[1.0, 2.0], vec![1, 2]).build(eval);
        assert_eq!(seg.class_map(7), Err(Error::IndexOutOfBounds(7)));
    }
}
