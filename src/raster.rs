//! Boundary to the raster collaborator.
//!
//! File formats and drivers live outside this crate. The engine only needs to read feature
//! values and validity for the pixels of a section, and to write label maps back.

use crate::error::Error;
use crate::extent::Extent;

/// Read access to the input raster. Shared read-only by all partition tasks.
pub trait RasterSource: Send + Sync {
    fn ncols(&self) -> usize;
    fn nrows(&self) -> usize;
    fn nslices(&self) -> usize {
        1
    }
    fn nbands(&self) -> usize;
    fn value(&self, col: usize, row: usize, slice: usize, band: usize) -> f32;
    fn is_valid(&self, col: usize, row: usize, slice: usize) -> bool;
    fn min(&self, band: usize) -> f32;
    fn max(&self, band: usize) -> f32;
    /// Precomputed edge strength, if the source carries an edge band.
    fn edge(&self, _col: usize, _row: usize, _slice: usize) -> Option<f32> {
        None
    }

    fn extent(&self) -> Extent {
        Extent::new(self.ncols(), self.nrows(), self.nslices())
    }
}

/// Write access for label maps.
pub trait RasterSink {
    fn put_label(&mut self, col: usize, row: usize, slice: usize, label: u32);
}

/// Band-planar in-memory raster.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    ncols: usize,
    nrows: usize,
    nslices: usize,
    nbands: usize,
    bands: Vec<Vec<f32>>,
    mask: Option<Vec<bool>>,
    no_data: Option<f32>,
    edges: Option<Vec<f32>>,
    min: Vec<f32>,
    max: Vec<f32>,
}

impl MemoryRaster {
    pub fn new(
        ncols: usize,
        nrows: usize,
        nslices: usize,
        bands: Vec<Vec<f32>>,
    ) -> Result<Self, Error> {
        let npix = ncols * nrows * nslices;
        if npix == 0 || bands.is_empty() {
            return Err(Error::Raster("empty raster".to_string()));
        }
        if let Some(band) = bands.iter().find(|b| b.len() != npix) {
            return Err(Error::DimensionMismatch {
                expected: npix,
                actual: band.len(),
            });
        }
        let mut raster = Self {
            ncols,
            nrows,
            nslices,
            nbands: bands.len(),
            bands,
            mask: None,
            no_data: None,
            edges: None,
            min: vec![],
            max: vec![],
        };
        raster.update_min_max();
        Ok(raster)
    }

    /// Single band 2-D raster from row-major values.
    pub fn from_rows(ncols: usize, nrows: usize, values: Vec<f32>) -> Result<Self, Error> {
        Self::new(ncols, nrows, 1, vec![values])
    }

    pub fn with_mask(mut self, mask: Vec<bool>) -> Result<Self, Error> {
        if mask.len() != self.npix() {
            return Err(Error::DimensionMismatch {
                expected: self.npix(),
                actual: mask.len(),
            });
        }
        self.mask = Some(mask);
        self.update_min_max();
        Ok(self)
    }

    pub fn with_no_data(mut self, no_data: f32) -> Self {
        self.no_data = Some(no_data);
        self.update_min_max();
        self
    }

    pub fn with_edges(mut self, edges: Vec<f32>) -> Result<Self, Error> {
        if edges.len() != self.npix() {
            return Err(Error::DimensionMismatch {
                expected: self.npix(),
                actual: edges.len(),
            });
        }
        self.edges = Some(edges);
        Ok(self)
    }

    pub fn npix(&self) -> usize {
        self.ncols * self.nrows * self.nslices
    }

    fn index(&self, col: usize, row: usize, slice: usize) -> usize {
        debug_assert!(col < self.ncols && row < self.nrows && slice < self.nslices);
        (slice * self.nrows + row) * self.ncols + col
    }

    fn valid_at(&self, index: usize) -> bool {
        if let Some(mask) = &self.mask {
            if !mask[index] {
                return false;
            }
        }
        match self.no_data {
            Some(no_data) => self.bands.iter().any(|b| b[index] != no_data),
            None => true,
        }
    }

    fn update_min_max(&mut self) {
        let valid: Vec<bool> = (0..self.npix()).map(|i| self.valid_at(i)).collect();
        self.min = self
            .bands
            .iter()
            .map(|b| {
                b.iter()
                    .zip(&valid)
                    .filter(|(_, v)| **v)
                    .map(|(x, _)| *x)
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();
        self.max = self
            .bands
            .iter()
            .map(|b| {
                b.iter()
                    .zip(&valid)
                    .filter(|(_, v)| **v)
                    .map(|(x, _)| *x)
                    .fold(f32::NEG_INFINITY, f32::max)
            })
            .collect();
    }
}

impl RasterSource for MemoryRaster {
    fn ncols(&self) -> usize {
        self.ncols
    }
    fn nrows(&self) -> usize {
        self.nrows
    }
    fn nslices(&self) -> usize {
        self.nslices
    }
    fn nbands(&self) -> usize {
        self.nbands
    }
    fn value(&self, col: usize, row: usize, slice: usize, band: usize) -> f32 {
        self.bands[band][self.index(col, row, slice)]
    }
    fn is_valid(&self, col: usize, row: usize, slice: usize) -> bool {
        self.valid_at(self.index(col, row, slice))
    }
    fn min(&self, band: usize) -> f32 {
        self.min[band]
    }
    fn max(&self, band: usize) -> f32 {
        self.max[band]
    }
    fn edge(&self, col: usize, row: usize, slice: usize) -> Option<f32> {
        self.edges
            .as_ref()
            .map(|e| e[self.index(col, row, slice)])
    }
}

/// Label map sink backed by a dense vector, `col` fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    pub ncols: usize,
    pub nrows: usize,
    pub nslices: usize,
    pub labels: Vec<u32>,
}

impl LabelMap {
    pub fn new(ncols: usize, nrows: usize, nslices: usize) -> Self {
        Self {
            ncols,
            nrows,
            nslices,
            labels: vec![0; ncols * nrows * nslices],
        }
    }

    pub fn get(&self, col: usize, row: usize, slice: usize) -> u32 {
        self.labels[(slice * self.nrows + row) * self.ncols + col]
    }
}

impl RasterSink for LabelMap {
    fn put_label(&mut self, col: usize, row: usize, slice: usize, label: u32) {
        let index = (slice * self.nrows + row) * self.ncols + col;
        self.labels[index] = label;
    }
}
