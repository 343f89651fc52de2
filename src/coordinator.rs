//! Entry point of a segmentation job.

use crate::common::Config;
use crate::error::Error;
use crate::hierarchy::{HierarchyBuilder, Segmentation};
use crate::protocol::ObjectReport;
use crate::raster::RasterSource;
use crate::region::RegionTable;
use crate::task::{Task, TaskContext};
use log::info;
use std::sync::Arc;

/// Owns the root task of the recursion tree and drives it from the calling thread.
///
/// ```
/// use hseg::{Config, Coordinator, MemoryRaster};
/// use std::sync::Arc;
///
/// let raster = MemoryRaster::from_rows(4, 1, vec![1.0, 1.0, 8.0, 8.0]).unwrap();
/// let config = Config {
///     converge_nregions: 2,
///     final_nregions: 1,
///     ..Config::default()
/// };
/// let mut coordinator = Coordinator::new(Arc::new(raster), config).unwrap();
/// coordinator.grow().unwrap();
/// assert_eq!(coordinator.class_labels().unwrap(), vec![1, 1, 2, 2]);
/// let segmentation = coordinator.finish().unwrap();
/// assert_eq!(segmentation.nlevels(), 2);
/// ```
pub struct Coordinator {
    root: Task,
    ctx: TaskContext,
    grown: bool,
    class_offset: i32,
    object_offset: i32,
    objects: Option<ObjectReport>,
}

impl Coordinator {
    pub fn new(source: Arc<dyn RasterSource>, config: Config) -> Result<Self, Error> {
        let ctx = TaskContext::new(config, source)?;
        Ok(Self {
            root: Task::root(ctx.clone()),
            ctx,
            grown: false,
            class_offset: 0,
            object_offset: 0,
            objects: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Runs the recursive segmentation until the root holds at most `converge_nregions`
    /// regions. Does nothing the second time.
    pub fn grow(&mut self) -> Result<(), Error> {
        if self.grown {
            return Ok(());
        }
        self.root.grow(self.ctx.config.converge_nregions)?;
        self.grown = true;
        info!(
            "converged to {} regions from {} initial regions",
            self.nregions(),
            self.root.global_nregions()
        );
        Ok(())
    }

    fn ensure_grown(&self) -> Result<(), Error> {
        if self.grown {
            Ok(())
        } else {
            Err(Error::InvalidConfig(
                "the segmentation has not been grown yet".to_string(),
            ))
        }
    }

    /// Active regions at the root.
    pub fn nregions(&self) -> u32 {
        self.root.table().nactive()
    }

    /// Whether the root holds the whole label map itself.
    pub fn resident(&self) -> bool {
        self.root.is_resident()
    }

    pub fn table(&self) -> &RegionTable {
        self.root.table()
    }

    /// Adds `offset` to every non-zero region label of the pixels, all the way down the tree.
    pub fn apply_class_label_offset(&mut self, offset: i32) -> Result<(), Error> {
        self.ensure_grown()?;
        self.root.apply_label_offset(offset)?;
        self.class_offset = self.class_offset.wrapping_add(offset);
        Ok(())
    }

    pub fn apply_object_label_offset(&mut self, offset: i32) -> Result<(), Error> {
        self.ensure_objects()?;
        self.root.apply_object_label_offset(offset)?;
        self.object_offset = self.object_offset.wrapping_add(offset);
        Ok(())
    }

    fn ensure_objects(&mut self) -> Result<(), Error> {
        self.ensure_grown()?;
        if self.objects.is_none() {
            let mut report = self.root.label_objects()?;
            let offset = self.class_offset;
            report
                .classes
                .iter_mut()
                .for_each(|class| *class = class.wrapping_add_signed(-offset));
            self.objects = Some(report);
        }
        Ok(())
    }

    /// Region label map of the whole raster, column fastest.
    pub fn class_labels(&mut self) -> Result<Vec<u32>, Error> {
        self.ensure_grown()?;
        let whole = *self.root.extent();
        Ok(self.root.pixels(&whole, false)?.labels().to_vec())
    }

    /// Region-object label map of the whole raster. Labels the objects first if needed.
    pub fn object_labels(&mut self) -> Result<Vec<u32>, Error> {
        self.ensure_objects()?;
        let whole = *self.root.extent();
        Ok(self.root.pixels(&whole, false)?.objects().to_vec())
    }

    /// Emits the hierarchy and tears the task tree down. Label offsets applied earlier are
    /// undone first, so the maps use the table's labels.
    pub fn finish(mut self) -> Result<Segmentation, Error> {
        self.ensure_grown()?;
        if self.class_offset != 0 {
            self.root.apply_label_offset(self.class_offset.wrapping_neg())?;
            self.class_offset = 0;
        }
        if self.object_offset != 0 {
            self.root
                .apply_object_label_offset(self.object_offset.wrapping_neg())?;
            self.object_offset = 0;
        }
        self.ensure_objects()?;

        let whole = *self.root.extent();
        let pixels = self.root.pixels(&whole, false)?;
        self.root.close()?;

        let regions = std::mem::replace(self.root.table_mut(), self.ctx.layout.empty_table());
        let objects = self.objects.take().ok_or_else(|| {
            Error::InvalidConfig("region-objects were not labeled".to_string())
        })?;
        let builder = HierarchyBuilder::new(
            &self.ctx.config,
            whole,
            self.ctx.layout.nbands,
            pixels.labels().to_vec(),
            pixels.objects().to_vec(),
            regions,
            objects.table,
            objects.classes,
        );
        Ok(builder.build(self.ctx.evaluator()))
    }
}

/// Segments `source` in one go: grows, labels the region-objects and emits the hierarchy.
pub fn segment(source: Arc<dyn RasterSource>, config: Config) -> Result<Segmentation, Error> {
    let mut coordinator = Coordinator::new(source, config)?;
    coordinator.grow()?;
    coordinator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::MemoryRaster;

    fn stripes() -> Arc<MemoryRaster> {
        #[rustfmt::skip]
        let values = vec![
            1.0, 1.0, 5.0, 5.0, 1.0, 1.0,
            1.0, 1.0, 5.0, 5.0, 1.0, 1.0,
        ];
        Arc::new(MemoryRaster::from_rows(6, 2, values).unwrap())
    }

    #[test]
    fn requires_grow_first() {
        let mut coordinator = Coordinator::new(stripes(), Config::default()).unwrap();
        assert!(matches!(
            coordinator.apply_class_label_offset(3),
            Err(Error::InvalidConfig(_))
        ));
        assert!(coordinator.class_labels().is_err());
    }

    #[test]
    fn class_offset_is_undone_by_finish() {
        let config = Config {
            converge_nregions: 3,
            final_nregions: 2,
            ..Config::default()
        };
        let mut coordinator = Coordinator::new(stripes(), config).unwrap();
        coordinator.grow().unwrap();
        assert_eq!(coordinator.nregions(), 3);
        assert!(coordinator.resident());
        coordinator.apply_class_label_offset(10).unwrap();
        let labels = coordinator.class_labels().unwrap();
        assert!(labels.iter().all(|&l| (11..=13).contains(&l)));
        let objects = coordinator.object_labels().unwrap();
        assert_eq!(objects, vec![1, 1, 2, 2, 3, 3, 1, 1, 2, 2, 3, 3]);

        let seg = coordinator.finish().unwrap();
        let level0 = seg.level(0).unwrap();
        assert_eq!(seg.class_map(0).unwrap()[..6], [1, 1, 2, 2, 3, 3]);
        assert_eq!(level0.regions[0].objects, vec![1]);
        let last = seg.level(seg.nlevels() - 1).unwrap();
        assert_eq!(last.nregions, 2);
        assert_eq!(last.class_of(2), 1);
        assert_eq!(last.class_of(3), 3);
        assert_eq!(last.nobjects(), 2);
        assert_eq!(last.regions[0].objects, vec![1]);
        assert_eq!(last.regions[2].objects, vec![3]);
        assert_eq!(seg.object_map(1).unwrap()[..6], [1, 1, 1, 1, 3, 3]);
    }

    #[test]
    fn segment_runs_end_to_end() {
        let config = Config {
            converge_nregions: 2,
            final_nregions: 1,
            ..Config::default()
        };
        let seg = segment(stripes(), config).unwrap();
        assert_eq!(seg.nlevels(), 2);
        assert_eq!(seg.level(1).unwrap().regions[0].npix, 12);
    }
}
