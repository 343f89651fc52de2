use crate::error::Error;
use crate::results::OutputFlags;
use std::ops::Range;

/// Region-pair dissimilarity criterion, computed over the regions' accumulated statistics.
///
/// Every criterion except `StdDevIncrease` and `Entropy` works on band sums and pixel counts
/// only. Those two need the optional sums of squares and `x·log(x)` sums respectively, which
/// must then be enabled in [`Config`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DissimCriterion {
    /// Sum of absolute differences of band means.
    OneNorm,
    /// Euclidean distance between band means.
    TwoNorm,
    /// Largest absolute band-mean difference.
    InfinityNorm,
    /// Angle between the band-mean vectors, in radians.
    SpectralAngle,
    /// Square root of the band-averaged increase of the squared error caused by merging.
    ///
    /// This is the classic hierarchical stepwise optimization criterion and the default.
    BandSumMse,
    /// Increase of the band-averaged standard deviation caused by merging.
    StdDevIncrease,
    /// Pixel-count weighted increase of the bands' distance from a uniform intensity
    /// distribution (log pixel count minus entropy) caused by merging.
    Entropy,
}

impl DissimCriterion {
    pub fn requires_sumsq(&self) -> bool {
        matches!(self, DissimCriterion::StdDevIncrease)
    }

    pub fn requires_sumxlogx(&self) -> bool {
        matches!(self, DissimCriterion::Entropy)
    }
}

/// Pixel adjacency used for region adjacency and connected components.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Neighborhood {
    /// Face neighbours: 4 in 2-D, 6 in 3-D.
    Four,
    /// Face, edge and corner neighbours: 8 in 2-D, 26 in 3-D.
    Eight,
}

/// How a leaf partition seeds its initial regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitMode {
    /// Every valid pixel starts as its own region.
    Pixel,
    /// Every connected component of identical feature vectors starts as one region.
    Components,
}

/// Main config for the segmentation.
///
/// One instance is built by the caller, validated once, and cloned into every partition task.
/// There is no global parameter state.
#[derive(Clone, Debug)]
pub struct Config {
    /// Dissimilarity criterion driving every merge decision.
    pub dissim_criterion: DissimCriterion,
    /// Pixel adjacency.
    pub neighborhood: Neighborhood,
    /// Region seeding mode for leaf partitions.
    pub init_mode: InitMode,
    /// Depth of the recursion tree, root included. 1 means no recursion at all.
    ///
    /// 0 derives the depth from `max_leaf_pixels`: sections are split until they hold at most
    /// that many pixels.
    pub recursion_levels: u8,
    /// Pixel count below which a section is a leaf when `recursion_levels` is 0.
    pub max_leaf_pixels: usize,
    /// Sections holding at most this many pixels keep their pixel data resident after their
    /// children converged (the children hand their pixels up and exit). Larger sections only
    /// keep region tables and talk to their children for pixel-level work.
    pub max_resident_pixels: usize,
    /// Region count every non-root partition converges to before reporting to its parent.
    pub min_nregions: u32,
    /// Region count the root converges to before the first hierarchy level is emitted.
    pub converge_nregions: u32,
    /// Region count of the last hierarchy level.
    pub final_nregions: u32,
    /// After a level with `n` regions, the next level is emitted at `ceil(n * level_factor)`.
    pub level_factor: f32,
    /// Optional upper bound on the merge dissimilarity. Growing stops once the best remaining
    /// merge is above it, whatever the region count.
    pub merge_threshold: Option<f64>,
    /// Relative weight of non-adjacent (spectral clustering) merges. 0 disables them.
    ///
    /// A non-adjacent candidate competes with dissimilarity `d / spclust_wght`.
    pub spclust_wght: f32,
    /// Only regions with at least this many pixels take part in spectral clustering.
    pub spclust_min_npix: u32,
    /// Spectral clustering only runs once the active region count is at or below this.
    pub spclust_max_nregions: u32,
    /// Edge weighting factor in `[0, 1]`. 0 disables edge weighting.
    pub edge_wght: f32,
    /// Regions smaller than this are flagged for initial merging.
    pub initial_merge_npix: u32,
    /// Divisor applied to the dissimilarity of two flagged regions.
    pub initial_merge_divisor: f64,
    /// Seam-averaged edge value at or below which a region pair across a cut is merged by
    /// artifact elimination.
    pub seam_edge_threshold: f32,
    /// Minimum seam pixel count of a region pair for artifact elimination to consider it.
    pub min_seam_npix: u32,
    /// At least one region of a seam pair must hold this many pixels to be merged.
    pub min_seam_edge_region_size: u32,
    /// Accumulate per-band sums of squares.
    pub sumsq: bool,
    /// Accumulate per-band `x·log(x)` sums.
    pub sumxlogx: bool,
    /// Fields written to the per-level result records.
    pub output: OutputFlags,
    /// Expected neighbour count per region, used to size outgoing region-table buffers.
    pub neighbor_estimate: usize,
    /// Run the heap self-check after every grow.
    pub heap_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dissim_criterion: DissimCriterion::BandSumMse,
            neighborhood: Neighborhood::Four,
            init_mode: InitMode::Pixel,
            recursion_levels: 0,
            max_leaf_pixels: 4096,
            max_resident_pixels: 1 << 20,
            min_nregions: 256,
            converge_nregions: 64,
            final_nregions: 2,
            level_factor: 0.5,
            merge_threshold: None,
            spclust_wght: 0.0,
            spclust_min_npix: 16,
            spclust_max_nregions: 1024,
            edge_wght: 0.0,
            initial_merge_npix: 0,
            initial_merge_divisor: 10.0,
            seam_edge_threshold: 0.05,
            min_seam_npix: 4,
            min_seam_edge_region_size: 16,
            sumsq: false,
            sumxlogx: false,
            output: OutputFlags::default(),
            neighbor_estimate: 8,
            heap_check: cfg!(debug_assertions),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if self.converge_nregions == 0 || self.min_nregions == 0 {
            return invalid("region count targets must be positive");
        }
        if self.final_nregions == 0 || self.final_nregions > self.converge_nregions {
            return invalid("final_nregions must be in 1..=converge_nregions");
        }
        if !(self.level_factor > 0.0 && self.level_factor < 1.0) {
            return invalid("level_factor must be in (0, 1)");
        }
        if !(0.0..=1.0).contains(&self.spclust_wght) {
            return invalid("spclust_wght must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.edge_wght) {
            return invalid("edge_wght must be in [0, 1]");
        }
        if self.initial_merge_divisor <= 0.0 {
            return invalid("initial_merge_divisor must be positive");
        }
        if self.recursion_levels == 0 && self.max_leaf_pixels == 0 {
            return invalid("max_leaf_pixels must be positive when recursion_levels is 0");
        }
        if self.dissim_criterion.requires_sumsq() && !self.sumsq {
            return invalid("the selected criterion needs sumsq");
        }
        if self.dissim_criterion.requires_sumxlogx() && !self.sumxlogx {
            return invalid("the selected criterion needs sumxlogx");
        }
        if self.output.sumsq && !self.sumsq {
            return invalid("sumsq output needs sumsq accumulation");
        }
        if self.output.sumxlogx && !self.sumxlogx {
            return invalid("sumxlogx output needs sumxlogx accumulation");
        }
        if self.output.std_dev && !self.sumsq {
            return invalid("std_dev output needs sumsq accumulation");
        }
        Ok(())
    }
}

pub(crate) fn split_length_to_ranges(length: usize, splits: usize) -> Vec<Range<usize>> {
    let chunk_size = length / splits;
    let rem = length % splits;
    (0..splits)
        .scan((rem, 0usize), |(r, acc), _split| {
            let mut size = chunk_size;
            if *r > 0 {
                *r -= 1;
                size += 1;
            }
            let out = (*acc, *acc + size);
            *acc += size;
            Some(out.0..out.1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_length_covers_everything() {
        let ranges = split_length_to_ranges(11, 3);
        assert_eq!(ranges, vec![0..4, 4..8, 8..11]);
        let ranges = split_length_to_ranges(2, 2);
        assert_eq!(ranges, vec![0..1, 1..2]);
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn criterion_statistics_are_checked() {
        let config = Config {
            dissim_criterion: DissimCriterion::StdDevIncrease,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        let config = Config {
            sumsq: true,
            ..config
        };
        assert_eq!(config.validate(), Ok(()));
    }
}
