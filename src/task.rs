//! Partition tasks: one per node of the recursion tree.
//!
//! A task owns an extent of the raster. Leaves load their pixels and grow regions from them.
//! Other tasks split their extent, delegate the halves to child tasks running on their own
//! threads, combine the children's region tables and repair the seams between them. Tasks
//! small enough to stay resident pull their children's pixels up and let them exit; larger
//! ones keep their children alive and relay every pixel-level request down the tree.

use crate::common::Config;
use crate::dissim::DissimEvaluator;
use crate::error::Error;
use crate::extent::{Cut, Extent};
use crate::grow::Grower;
use crate::protocol::{Layout, ObjectReport, PixelData, RegionReport, Request, Response};
use crate::raster::RasterSource;
use crate::region::RegionTable;
use crate::seam::{cross_pairs, ArtifactEliminator, SeamTable};
use crate::section::PixelSection;
use crate::transport::{Endpoint, Link};
use log::{debug, error};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Lifecycle of a task. A leaf goes `Init -> Growing -> LevelReady`; a parent goes
/// `Init -> AwaitingChildren -> Combining -> Growing -> ArtifactElimination -> LevelReady`.
/// Any state may end in `Done`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Loading pixels or spawning children.
    Init,
    /// Running the local grower.
    Growing,
    /// Waiting for the children's region tables.
    AwaitingChildren,
    /// Merging the children's tables into one.
    Combining,
    ArtifactElimination,
    /// Converged, labels compacted; the region table can be reported.
    LevelReady,
    Done,
}

impl TaskState {
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (_, Done)
                | (Init, Growing)
                | (Init, AwaitingChildren)
                | (AwaitingChildren, Combining)
                | (Combining, Growing)
                | (Growing, ArtifactElimination)
                | (Growing, LevelReady)
                | (ArtifactElimination, LevelReady)
        )
    }
}

/// Read-only state shared by every task of a job.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<Config>,
    pub source: Arc<dyn RasterSource>,
    pub layout: Layout,
    /// Largest band range of the raster, used to normalize edge values.
    pub edge_scale: f32,
    next_id: Arc<AtomicU32>,
}

impl TaskContext {
    pub fn new(config: Config, source: Arc<dyn RasterSource>) -> Result<Self, Error> {
        config.validate()?;
        let nbands = source.nbands();
        if nbands == 0 || source.extent().npix() == 0 {
            return Err(Error::Raster("raster has no bands or no pixels".to_string()));
        }
        let edge_scale = (0..nbands)
            .map(|band| source.max(band) - source.min(band))
            .fold(0.0f32, f32::max);
        Ok(Self {
            layout: Layout::new(&config, nbands),
            config: Arc::new(config),
            source,
            edge_scale: if edge_scale > 0.0 { edge_scale } else { 1.0 },
            next_id: Arc::new(AtomicU32::new(1)),
        })
    }

    pub fn evaluator(&self) -> DissimEvaluator {
        DissimEvaluator::new(&self.config, self.edge_scale)
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct Child {
    extent: Extent,
    link: Link,
}

pub struct Task {
    id: u32,
    depth: u8,
    extent: Extent,
    ctx: TaskContext,
    state: TaskState,
    section: Option<PixelSection>,
    children: Vec<Child>,
    cuts: Vec<Cut>,
    table: RegionTable,
    global_nregions: u32,
}

impl Task {
    pub fn new(id: u32, depth: u8, extent: Extent, ctx: TaskContext) -> Self {
        Self {
            id,
            depth,
            extent,
            table: ctx.layout.empty_table(),
            ctx,
            state: TaskState::Init,
            section: None,
            children: Vec::new(),
            cuts: Vec::new(),
            global_nregions: 0,
        }
    }

    pub fn root(ctx: TaskContext) -> Self {
        let extent = ctx.source.extent();
        Self::new(0, 0, extent, ctx)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut RegionTable {
        &mut self.table
    }

    /// Initial region count of the subtree.
    pub fn global_nregions(&self) -> u32 {
        self.global_nregions
    }

    /// Whether this task holds the pixels of its extent itself.
    pub fn is_resident(&self) -> bool {
        self.section.is_some()
    }

    pub fn nchildren(&self) -> usize {
        self.children.len()
    }

    pub fn is_leaf(&self) -> bool {
        if !self.extent.can_split() {
            return true;
        }
        match self.ctx.config.recursion_levels {
            0 => self.extent.npix() <= self.ctx.config.max_leaf_pixels,
            levels => self.depth + 1 >= levels,
        }
    }

    fn transition(&mut self, next: TaskState) {
        debug!("task {}: {:?} -> {:?}", self.id, self.state, next);
        debug_assert!(
            self.state.can_advance_to(next),
            "task {}: {:?} cannot advance to {:?}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    /// Converges the subtree to at most `target` regions with labels `1..=n`.
    pub fn grow(&mut self, target: u32) -> Result<(), Error> {
        let config = Arc::clone(&self.ctx.config);
        if self.is_leaf() {
            let mut section = PixelSection::load(self.ctx.source.as_ref(), self.extent);
            let mut table = self.ctx.layout.empty_table();
            self.global_nregions = section.seed(config.init_mode, config.neighborhood, &mut table);
            self.table = table;
            self.section = Some(section);
            self.transition(TaskState::Growing);
            self.grow_table(target);
            self.transition(TaskState::LevelReady);
            return self.compact_and_relay();
        }

        let (extents, cuts) = self.extent.split();
        self.cuts = cuts;
        for extent in extents {
            let child = self.spawn_child(extent)?;
            self.children.push(child);
        }

        self.transition(TaskState::AwaitingChildren);
        let mut reports = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            let request = Request::Grow {
                target: config.min_nregions,
            };
            reports.push(child.link.request(&request)?.into_regions()?);
        }

        self.transition(TaskState::Combining);
        self.combine(reports)?;
        if self.extent.npix() <= config.max_resident_pixels {
            self.gather_children()?;
        }
        let mut seams = Vec::with_capacity(self.cuts.len());
        for cut in self.cuts.clone() {
            let seam = self.seam_table(&cut)?;
            seam.add_adjacencies(&mut self.table);
            seams.push(seam);
        }
        self.transition(TaskState::Growing);
        self.grow_table(target);

        self.transition(TaskState::ArtifactElimination);
        let eval = self.ctx.evaluator();
        let eliminator = ArtifactEliminator::new(&config, &eval);
        for seam in &seams {
            if eliminator.eliminate(&mut self.table, seam) > 0 {
                let pairs = self.table.resolve_merged();
                self.relabel(&pairs)?;
            }
        }

        self.transition(TaskState::LevelReady);
        self.compact_and_relay()
    }

    fn spawn_child(&self, extent: Extent) -> Result<Child, Error> {
        let id = self.ctx.next_id();
        let task = Task::new(id, self.depth + 1, extent, self.ctx.clone());
        let link = Link::spawn(id, self.ctx.layout, move |endpoint| task.serve(endpoint))?;
        Ok(Child { extent, link })
    }

    /// Appends the children's tables in child order. Each child's labels are shifted by the
    /// label count of the children before it, and the child is told to shift its pixels.
    fn combine(&mut self, reports: Vec<RegionReport>) -> Result<(), Error> {
        let mut table = self.ctx.layout.empty_table();
        let mut global = 0;
        for (child, report) in self.children.iter_mut().zip(reports) {
            let offset = table.len();
            if offset > 0 && !report.table.is_empty() {
                let request = Request::ApplyLabelOffset {
                    offset: offset as i32,
                };
                child.link.request(&request)?.into_ack()?;
            }
            global += report.global_nregions;
            table.append(report.table, offset);
        }
        self.table = table;
        self.global_nregions = global;
        Ok(())
    }

    /// Pulls every child's pixels into a resident section and shuts the children down.
    fn gather_children(&mut self) -> Result<(), Error> {
        let mut section = PixelSection::blank(self.extent, self.ctx.layout.nbands);
        for child in &mut self.children {
            let request = Request::FetchPixels {
                extent: child.extent,
                features: true,
            };
            let data = child.link.request(&request)?.into_pixels()?;
            section.import(&data)?;
        }
        self.shutdown_children()?;
        self.section = Some(section);
        debug!("task {}: pixels resident", self.id);
        Ok(())
    }

    pub fn shutdown_children(&mut self) -> Result<(), Error> {
        for child in self.children.drain(..) {
            child.link.shutdown()?;
        }
        Ok(())
    }

    /// Shuts the subtree down. The task keeps its resident pixels and table.
    pub fn close(&mut self) -> Result<(), Error> {
        self.shutdown_children()?;
        self.transition(TaskState::Done);
        Ok(())
    }

    fn grow_table(&mut self, target: u32) {
        let mut grower = Grower::new(&self.ctx.config, self.ctx.evaluator());
        grower.init(&mut self.table);
        grower.grow(&mut self.table, target);
        if let Some(section) = &self.section {
            debug_assert_eq!(
                self.table.npix_total(),
                section.nvalid() as u64,
                "task {}: region pixel counts do not add up",
                self.id
            );
        }
    }

    fn seam_table(&mut self, cut: &Cut) -> Result<SeamTable, Error> {
        let slab = self.extent.seam_slab(cut);
        let pixels = self.pixels(&slab, true)?;
        Ok(SeamTable::from_slab(
            &pixels,
            cut,
            self.ctx.config.neighborhood,
            self.ctx.edge_scale,
        ))
    }

    fn compact_and_relay(&mut self) -> Result<(), Error> {
        let map = self.table.compact();
        let pairs: Vec<(u32, u32)> = map
            .iter()
            .enumerate()
            .skip(1)
            .filter(|&(old, &new)| old as u32 != new)
            .map(|(old, &new)| (old as u32, new))
            .collect();
        debug!(
            "task {}: {} regions after compaction, {} labels changed",
            self.id,
            self.table.len(),
            pairs.len()
        );
        self.relabel(&pairs)
    }

    /// Section holding the pixels of `extent`, which must lie inside this task's extent.
    pub fn pixels(&mut self, extent: &Extent, features: bool) -> Result<PixelSection, Error> {
        if self.extent.intersect(extent) != Some(*extent) {
            return Err(Error::IndicesOutOfBounds {
                col: extent.col0 + extent.ncols,
                row: extent.row0 + extent.nrows,
                slice: extent.slice0 + extent.nslices,
            });
        }
        let mut out = PixelSection::blank(*extent, self.ctx.layout.nbands);
        if let Some(section) = &self.section {
            out.import(&section.export(extent, features))?;
            return Ok(out);
        }
        for child in &mut self.children {
            let Some(part) = child.extent.intersect(extent) else {
                continue;
            };
            let request = Request::FetchPixels {
                extent: part,
                features,
            };
            out.import(&child.link.request(&request)?.into_pixels()?)?;
        }
        Ok(out)
    }

    fn fetch_pixels(&mut self, extent: &Extent, features: bool) -> Result<PixelData, Error> {
        if let Some(section) = &self.section {
            if self.extent.intersect(extent) == Some(*extent) {
                return Ok(section.export(extent, features));
            }
        }
        Ok(self.pixels(extent, features)?.export(extent, features))
    }

    /// Adds `offset` to every non-zero region label of the subtree's pixels.
    pub fn apply_label_offset(&mut self, offset: i32) -> Result<(), Error> {
        if let Some(section) = &mut self.section {
            section.offset_labels(offset);
            return Ok(());
        }
        self.broadcast(&Request::ApplyLabelOffset { offset })
    }

    pub fn apply_object_label_offset(&mut self, offset: i32) -> Result<(), Error> {
        if let Some(section) = &mut self.section {
            section.offset_objects(offset);
            return Ok(());
        }
        self.broadcast(&Request::ApplyObjectLabelOffset { offset })
    }

    /// Replaces region labels of the subtree's pixels, `(old, new)` pairs.
    pub fn relabel(&mut self, pairs: &[(u32, u32)]) -> Result<(), Error> {
        if pairs.is_empty() {
            return Ok(());
        }
        if let Some(section) = &mut self.section {
            section.relabel(pairs);
            return Ok(());
        }
        self.broadcast(&Request::Relabel {
            pairs: pairs.to_vec(),
        })
    }

    pub fn relabel_objects(&mut self, pairs: &[(u32, u32)]) -> Result<(), Error> {
        if pairs.is_empty() {
            return Ok(());
        }
        if let Some(section) = &mut self.section {
            section.relabel_objects(pairs);
            return Ok(());
        }
        self.broadcast(&Request::RelabelObjects {
            pairs: pairs.to_vec(),
        })
    }

    fn broadcast(&mut self, request: &Request) -> Result<(), Error> {
        for child in &mut self.children {
            child.link.request(request)?.into_ack()?;
        }
        Ok(())
    }

    /// Labels the region-objects of the subtree as `1..=n` and returns their table.
    ///
    /// Children label their own objects; their labels are offset like region labels, and
    /// objects of the same region touching across a cut are joined.
    pub fn label_objects(&mut self) -> Result<ObjectReport, Error> {
        let neighborhood = self.ctx.config.neighborhood;
        if let Some(section) = &mut self.section {
            return Ok(section.label_objects(neighborhood, &self.ctx.layout));
        }

        let mut reports = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            reports.push(child.link.request(&Request::LabelObjects)?.into_objects()?);
        }
        let mut table = self.ctx.layout.empty_table();
        let mut classes = Vec::new();
        for (child, report) in self.children.iter_mut().zip(reports) {
            let offset = table.len();
            if offset > 0 && !report.table.is_empty() {
                let request = Request::ApplyObjectLabelOffset {
                    offset: offset as i32,
                };
                child.link.request(&request)?.into_ack()?;
            }
            table.append(report.table, offset);
            classes.extend(report.classes);
        }

        for cut in self.cuts.clone() {
            let slab_extent = self.extent.seam_slab(&cut);
            let slab = self.pixels(&slab_extent, false)?;
            let (labels, objects) = (slab.labels(), slab.objects());
            for (a, b) in cross_pairs(&slab, &cut, neighborhood) {
                let (oa, ob) = (table.find(objects[a]), table.find(objects[b]));
                if oa == ob {
                    continue;
                }
                if labels[a] == labels[b] {
                    table.merge(oa.min(ob), oa.max(ob), 0.0);
                } else {
                    table.add_adjacency(oa, ob);
                }
            }
        }

        let map = table.compact();
        let mut compacted = vec![0u32; table.len() as usize];
        let mut pairs = Vec::new();
        for (old, &new) in map.iter().enumerate().skip(1) {
            compacted[new as usize - 1] = classes[old - 1];
            if old as u32 != new {
                pairs.push((old as u32, new));
            }
        }
        self.relabel_objects(&pairs)?;
        Ok(ObjectReport {
            table,
            classes: compacted,
        })
    }

    fn handle(&mut self, request: Request) -> Result<Response, Error> {
        let response = match request {
            Request::Grow { target } => {
                self.grow(target)?;
                let table = std::mem::replace(&mut self.table, self.ctx.layout.empty_table());
                Response::Regions(RegionReport {
                    global_nregions: self.global_nregions,
                    table,
                })
            }
            Request::ApplyLabelOffset { offset } => {
                self.apply_label_offset(offset)?;
                Response::Ack
            }
            Request::Relabel { pairs } => {
                self.relabel(&pairs)?;
                Response::Ack
            }
            Request::FetchPixels { extent, features } => {
                Response::Pixels(self.fetch_pixels(&extent, features)?)
            }
            Request::LabelObjects => Response::Objects(self.label_objects()?),
            Request::ApplyObjectLabelOffset { offset } => {
                self.apply_object_label_offset(offset)?;
                Response::Ack
            }
            Request::RelabelObjects { pairs } => {
                self.relabel_objects(&pairs)?;
                Response::Ack
            }
            Request::Shutdown => {
                self.close()?;
                Response::Ack
            }
        };
        Ok(response)
    }

    /// Event loop of a child task: answers its parent's requests until told to shut down.
    pub fn serve(mut self, endpoint: Endpoint) {
        while let Some(frame) = endpoint.recv() {
            let shutdown = matches!(frame, Ok(Request::Shutdown));
            let response = match frame.and_then(|request| self.handle(request)) {
                Ok(response) => response,
                Err(e) => {
                    error!("task {}: {e}", self.id);
                    Response::Failed(e.to_string())
                }
            };
            if endpoint.send(&response).is_err() || shutdown {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::MemoryRaster;

    fn ctx(config: Config, raster: MemoryRaster) -> TaskContext {
        TaskContext::new(config, Arc::new(raster)).unwrap()
    }

    fn quadrants() -> MemoryRaster {
        #[rustfmt::skip]
        let values = vec![
            1.0, 1.0, 9.0, 9.0,
            1.0, 1.0, 9.0, 9.0,
            4.0, 4.0, 6.0, 6.0,
            4.0, 4.0, 6.0, 6.0,
        ];
        MemoryRaster::from_rows(4, 4, values).unwrap()
    }

    #[test]
    fn leaf_decision() {
        let config = Config {
            recursion_levels: 2,
            ..Config::default()
        };
        let ctx = ctx(config, quadrants());
        let root = Task::root(ctx.clone());
        assert!(!root.is_leaf());
        let child = Task::new(1, 1, Extent::new(2, 2, 1), ctx.clone());
        assert!(child.is_leaf());
        let pixel = Task::new(2, 0, Extent::new(1, 1, 1), ctx);
        assert!(pixel.is_leaf());
    }

    #[test]
    fn resident_parent_gathers_children() {
        let config = Config {
            recursion_levels: 2,
            min_nregions: 1,
            converge_nregions: 4,
            final_nregions: 1,
            ..Config::default()
        };
        let mut root = Task::root(ctx(config, quadrants()));
        root.grow(4).unwrap();
        assert_eq!(root.state(), TaskState::LevelReady);
        assert!(root.is_resident());
        assert_eq!(root.nchildren(), 0);
        assert_eq!(root.table().nactive(), 4);
        assert_eq!(root.global_nregions(), 16);
        assert!(root.table().active().all(|r| r.npix == 4));
    }

    #[test]
    fn non_resident_parent_relays() {
        let config = Config {
            recursion_levels: 2,
            min_nregions: 1,
            converge_nregions: 4,
            final_nregions: 1,
            max_resident_pixels: 0,
            ..Config::default()
        };
        let mut root = Task::root(ctx(config, quadrants()));
        root.grow(4).unwrap();
        assert!(!root.is_resident());
        assert_eq!(root.nchildren(), 4);
        let whole = *root.extent();
        let pixels = root.pixels(&whole, false).unwrap();
        let mut labels = pixels.labels().to_vec();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels, vec![1, 2, 3, 4]);
        root.close().unwrap();
        assert_eq!(root.state(), TaskState::Done);
        assert_eq!(root.nchildren(), 0);
    }

    #[test]
    fn parent_states_pass_through_growing() {
        use TaskState::*;
        let parent = [
            Init,
            AwaitingChildren,
            Combining,
            Growing,
            ArtifactElimination,
            LevelReady,
            Done,
        ];
        assert!(parent.windows(2).all(|w| w[0].can_advance_to(w[1])));
        assert!(!Combining.can_advance_to(ArtifactElimination));
        assert!(!Init.can_advance_to(LevelReady));
        assert!(Init.can_advance_to(Done));
    }

    #[test]
    fn deep_non_resident_tree_serves_pixels() {
        let (w, h) = (20, 17);
        let values = (0..w * h)
            .map(|i| (if i % w < 11 { 2.0 } else { 7.0 }) + (i / w) as f32 * 0.01)
            .collect();
        let config = Config {
            recursion_levels: 3,
            min_nregions: 4,
            converge_nregions: 4,
            final_nregions: 1,
            max_resident_pixels: 0,
            ..Config::default()
        };
        let raster = MemoryRaster::from_rows(w, h, values).unwrap();
        let mut root = Task::root(ctx(config, raster));
        root.grow(4).unwrap();
        assert_eq!(root.state(), TaskState::LevelReady);
        assert!(!root.is_resident());
        assert_eq!(root.global_nregions(), (w * h) as u32);

        root.apply_label_offset(100).unwrap();
        let whole = *root.extent();
        let pixels = root.pixels(&whole, false).unwrap();
        assert_eq!(pixels.labels().len(), w * h);
        assert!(pixels.labels().iter().all(|&l| l > 100 && l <= 104));

        let corner = Extent {
            col0: 9,
            row0: 7,
            ncols: 4,
            nrows: 3,
            ..whole
        };
        let part = root.pixels(&corner, false).unwrap();
        assert_eq!(part.labels().len(), 12);
        root.close().unwrap();
    }
}
