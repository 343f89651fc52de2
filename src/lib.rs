//! Hierarchical region-growing segmentation in Rust.
//!
//! The engine partitions a raster of feature vectors into a hierarchy of spatially contiguous
//! regions by repeatedly merging the most similar pair of adjacent regions (hierarchical
//! stepwise optimization), optionally interleaved with merges of similar non-adjacent regions
//! (spectral clustering).
//!
//! Large rasters are split recursively. Every section of the recursion tree is a task running
//! on its own thread; leaves grow their pixels into regions, parents combine the children's
//! region tables, keep growing and repair the merge artifacts left along the cuts between
//! their children. Tasks talk to each other only through a small binary message protocol.
//!
//! The following example segments a small single band raster:
//!
//! ```rust
//! use hseg::{segment, Config, LabelMap, MemoryRaster};
//! use std::sync::Arc;
//!
//! let values = vec![
//!     1.0, 1.0, 9.0, 9.0,
//!     1.0, 1.0, 9.0, 9.0,
//!     4.0, 4.0, 6.0, 6.0,
//!     4.0, 4.0, 6.0, 6.0,
//! ];
//! let raster = MemoryRaster::from_rows(4, 4, values).unwrap();
//! let config = Config {
//!     converge_nregions: 4,
//!     final_nregions: 1,
//!     ..Config::default()
//! };
//! let segmentation = segment(Arc::new(raster), config).unwrap();
//! assert_eq!(segmentation.level(0).unwrap().nregions, 4);
//!
//! let mut classes = LabelMap::new(4, 4, 1);
//! let mut objects = LabelMap::new(4, 4, 1);
//! segmentation.write_label_maps(0, &mut classes, &mut objects).unwrap();
//! assert_eq!(classes.get(3, 3, 0), 4);
//! ```
//!
//! Diagnostics go through the `log` facade; install any logger to see them. The union-find
//! hot loops use the `assume!` macro to skip bounds checks in release builds, so it's
//! recommended to run this in release build.

pub mod arrays;
pub mod common;
pub mod connectivity;
pub mod coordinator;
pub mod dissim;
pub mod error;
pub mod extent;
pub mod forest;
pub mod grow;
pub mod heap;
pub mod hierarchy;
pub mod protocol;
pub mod raster;
pub mod region;
pub mod results;
pub mod seam;
pub mod section;
pub mod task;
pub mod transport;

pub use common::{Config, DissimCriterion, InitMode, Neighborhood};
pub use coordinator::{segment, Coordinator};
pub use error::Error;
pub use hierarchy::{Level, Segmentation};
pub use raster::{LabelMap, MemoryRaster, RasterSink, RasterSource};
pub use results::OutputFlags;
