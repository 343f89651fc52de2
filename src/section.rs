//! Resident pixel data of a partition.

use crate::arrays::Array3D;
use crate::common::{split_length_to_ranges, InitMode, Neighborhood};
use crate::connectivity::label_components;
use crate::error::Error;
use crate::extent::{forward_offsets, neighbor_offsets, Extent};
use crate::protocol::{Layout, ObjectReport, PixelData};
use crate::raster::RasterSource;
use crate::region::RegionTable;
use rayon::current_num_threads;
use rayon::prelude::*;

/// Band-planar features, validity, region and object labels and edge strength of every pixel
/// of an extent. Label 0 marks invalid or unassigned pixels.
#[derive(Debug, Clone)]
pub struct PixelSection {
    extent: Extent,
    features: Vec<Array3D<f32>>,
    valid: Array3D<bool>,
    labels: Array3D<u32>,
    objects: Array3D<u32>,
    edges: Array3D<f32>,
}

fn chunk_len(len: usize) -> usize {
    split_length_to_ranges(len, current_num_threads())
        .first()
        .map_or(1, |range| range.len().max(1))
}

fn offset_in(data: &mut [u32], offset: i32) {
    let chunk = chunk_len(data.len());
    data.par_chunks_mut(chunk).for_each(|labels| {
        labels
            .iter_mut()
            .filter(|label| **label != 0)
            .for_each(|label| *label = label.wrapping_add_signed(offset));
    });
}

fn relabel_in(data: &mut [u32], pairs: &[(u32, u32)]) {
    let Some(max_old) = pairs.iter().map(|&(old, _)| old).max() else {
        return;
    };
    let mut lut: Vec<u32> = (0..=max_old).collect();
    for &(old, new) in pairs {
        lut[old as usize] = new;
    }
    let chunk = chunk_len(data.len());
    data.par_chunks_mut(chunk).for_each(|labels| {
        for label in labels.iter_mut() {
            if let Some(&new) = lut.get(*label as usize) {
                *label = new;
            }
        }
    });
}

/// Largest absolute band difference between a valid pixel and its valid face neighbours, read
/// straight from the source so that pixels on a section border see their outside neighbours.
fn edge_at(source: &dyn RasterSource, col: usize, row: usize, slice: usize) -> f32 {
    if !source.is_valid(col, row, slice) {
        return 0.0;
    }
    let offsets = neighbor_offsets(Neighborhood::Four, source.nslices() > 1);
    let mut edge = 0.0f32;
    for (dx, dy, dz) in offsets {
        let (nc, nr, ns) = (col as isize + dx, row as isize + dy, slice as isize + dz);
        if nc < 0 || nr < 0 || ns < 0 {
            continue;
        }
        let (nc, nr, ns) = (nc as usize, nr as usize, ns as usize);
        if nc >= source.ncols() || nr >= source.nrows() || ns >= source.nslices() {
            continue;
        }
        if !source.is_valid(nc, nr, ns) {
            continue;
        }
        for band in 0..source.nbands() {
            let diff = (source.value(col, row, slice, band) - source.value(nc, nr, ns, band)).abs();
            edge = edge.max(diff);
        }
    }
    edge
}

impl PixelSection {
    /// Section with every pixel invalid.
    pub fn blank(extent: Extent, nbands: usize) -> Self {
        let (w, h, d) = extent.size();
        Self {
            extent,
            features: (0..nbands).map(|_| Array3D::from_fill(0.0, w, h, d)).collect(),
            valid: Array3D::from_fill(false, w, h, d),
            labels: Array3D::from_fill(0, w, h, d),
            objects: Array3D::from_fill(0, w, h, d),
            edges: Array3D::from_fill(0.0, w, h, d),
        }
    }

    /// Reads features and validity of `extent` from `source`. Edge strength comes from the
    /// source's edge band when it has one and is computed otherwise.
    pub fn load(source: &dyn RasterSource, extent: Extent) -> Self {
        let mut section = Self::blank(extent, source.nbands());
        let (w, h, d) = extent.size();
        let (c0, r0, s0) = extent.origin();
        for z in 0..d {
            for y in 0..h {
                for x in 0..w {
                    let (col, row, slice) = (c0 + x, r0 + y, s0 + z);
                    if !source.is_valid(col, row, slice) {
                        continue;
                    }
                    section.valid[(x, y, z)] = true;
                    for (band, plane) in section.features.iter_mut().enumerate() {
                        plane[(x, y, z)] = source.value(col, row, slice, band);
                    }
                }
            }
        }

        let precomputed = source.edge(c0, r0, s0).is_some();
        let ranges = split_length_to_ranges(h * d, current_num_threads());
        let rows: Vec<Vec<f32>> = ranges
            .into_par_iter()
            .map(|rows| {
                let mut out = Vec::with_capacity(rows.len() * w);
                for r in rows {
                    let (row, slice) = (r0 + r % h, s0 + r / h);
                    for col in c0..c0 + w {
                        let edge = if precomputed {
                            source.edge(col, row, slice).unwrap_or(0.0)
                        } else {
                            edge_at(source, col, row, slice)
                        };
                        out.push(edge);
                    }
                }
                out
            })
            .collect();
        for (dst, src) in section.edges.data.iter_mut().zip(rows.into_iter().flatten()) {
            *dst = src;
        }
        section
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn nbands(&self) -> usize {
        self.features.len()
    }

    pub fn npix(&self) -> usize {
        self.valid.len()
    }

    pub fn nvalid(&self) -> usize {
        self.valid.data.iter().filter(|&&v| v).count()
    }

    pub fn valid(&self) -> &[bool] {
        &self.valid.data
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels.data
    }

    pub fn objects(&self) -> &[u32] {
        &self.objects.data
    }

    pub fn edges(&self) -> &[f32] {
        &self.edges.data
    }

    pub fn pixel_features(&self, index: usize, out: &mut Vec<f32>) {
        out.clear();
        out.extend(self.features.iter().map(|plane| plane.data[index]));
    }

    /// Calls `f(a, b)` for every unordered pair of neighbouring valid pixels.
    pub fn for_each_neighbor_pair<F>(&self, neighborhood: Neighborhood, mut f: F)
    where
        F: FnMut(usize, usize),
    {
        let (w, h, d) = self.extent.size();
        let offsets = forward_offsets(neighborhood, d > 1);
        for z in 0..d {
            for y in 0..h {
                for x in 0..w {
                    let index = self.valid.get_index(x, y, z);
                    if !self.valid.data[index] {
                        continue;
                    }
                    for &(dx, dy, dz) in &offsets {
                        let (nx, ny, nz) = (x as isize + dx, y as isize + dy, z as isize + dz);
                        if nx < 0
                            || ny < 0
                            || nx >= w as isize
                            || ny >= h as isize
                            || nz >= d as isize
                        {
                            continue;
                        }
                        let other = self.valid.get_index(nx as usize, ny as usize, nz as usize);
                        if self.valid.data[other] {
                            f(index, other);
                        }
                    }
                }
            }
        }
    }

    /// Assigns the initial region labels `1..=n` and fills `table` with one region each,
    /// statistics and adjacency included. Returns `n`.
    pub fn seed(
        &mut self,
        init_mode: InitMode,
        neighborhood: Neighborhood,
        table: &mut RegionTable,
    ) -> u32 {
        debug_assert!(table.is_empty());
        let count = match init_mode {
            InitMode::Pixel => {
                let mut next = 0;
                for (label, &valid) in self.labels.data.iter_mut().zip(self.valid.data.iter()) {
                    *label = if valid {
                        next += 1;
                        next
                    } else {
                        0
                    };
                }
                next
            }
            InitMode::Components => {
                let features = &self.features;
                let (labels, count) = label_components(
                    self.extent.size(),
                    &self.valid.data,
                    neighborhood,
                    |a, b| features.iter().all(|plane| plane.data[a] == plane.data[b]),
                );
                self.labels.data.copy_from_slice(&labels);
                count
            }
        };

        table.add_regions(count);
        let mut pixel = Vec::with_capacity(self.nbands());
        for index in 0..self.npix() {
            let label = self.labels.data[index];
            if label != 0 {
                self.pixel_features(index, &mut pixel);
                table.accumulate(label, &pixel, self.edges.data[index]);
            }
        }
        let labels = &self.labels.data;
        self.for_each_neighbor_pair(neighborhood, |a, b| {
            table.add_adjacency(labels[a], labels[b]);
        });
        count
    }

    /// Adds `offset` to every non-zero region label.
    pub fn offset_labels(&mut self, offset: i32) {
        offset_in(&mut self.labels.data, offset);
    }

    pub fn offset_objects(&mut self, offset: i32) {
        offset_in(&mut self.objects.data, offset);
    }

    /// Replaces region labels, `(old, new)` pairs.
    pub fn relabel(&mut self, pairs: &[(u32, u32)]) {
        relabel_in(&mut self.labels.data, pairs);
    }

    pub fn relabel_objects(&mut self, pairs: &[(u32, u32)]) {
        relabel_in(&mut self.objects.data, pairs);
    }

    /// Labels the connected components of equal region label (the region-objects) as
    /// `1..=n`, and returns their table and the region label of each.
    pub fn label_objects(&mut self, neighborhood: Neighborhood, layout: &Layout) -> ObjectReport {
        let labels = &self.labels.data;
        let valid: Vec<bool> = labels.iter().map(|&l| l != 0).collect();
        let (objects, count) =
            label_components(self.extent.size(), &valid, neighborhood, |a, b| {
                labels[a] == labels[b]
            });
        self.objects.data.copy_from_slice(&objects);

        let mut table = layout.empty_table();
        table.add_regions(count);
        let mut classes = vec![0u32; count as usize];
        let mut pixel = Vec::with_capacity(self.nbands());
        for index in 0..self.npix() {
            let object = objects[index];
            if object != 0 {
                self.pixel_features(index, &mut pixel);
                table.accumulate(object, &pixel, self.edges.data[index]);
                classes[object as usize - 1] = self.labels.data[index];
            }
        }
        self.for_each_neighbor_pair(neighborhood, |a, b| {
            table.add_adjacency(objects[a], objects[b]);
        });
        ObjectReport { table, classes }
    }

    /// Packs the pixels of `extent`, which must lie inside the section.
    pub fn export(&self, extent: &Extent, features: bool) -> PixelData {
        let origin = self.extent.offset_of(extent);
        let size = extent.size();
        let valid = self.valid.copy_box(origin, size);
        let labels = self.labels.copy_box(origin, size);
        let objects = self.objects.copy_box(origin, size);
        let mut data = PixelData {
            extent: *extent,
            labels: Vec::new(),
            objects: Vec::new(),
            features: Vec::new(),
            edges: Vec::new(),
            valid,
        };
        for (i, &v) in data.valid.iter().enumerate() {
            if v {
                data.labels.push(labels[i]);
                data.objects.push(objects[i]);
            }
        }
        if features {
            let planes: Vec<Vec<f32>> = self
                .features
                .iter()
                .map(|plane| plane.copy_box(origin, size))
                .collect();
            let edges = self.edges.copy_box(origin, size);
            for (i, &v) in data.valid.iter().enumerate() {
                if v {
                    data.features.extend(planes.iter().map(|plane| plane[i]));
                    data.edges.push(edges[i]);
                }
            }
        }
        data
    }

    /// Writes packed pixels back. Features and edges are only touched when `data` has them.
    pub fn import(&mut self, data: &PixelData) -> Result<(), Error> {
        if self.extent.intersect(&data.extent) != Some(data.extent) {
            let (c, r, s) = data.extent.origin();
            return Err(Error::IndicesOutOfBounds {
                col: c + data.extent.ncols,
                row: r + data.extent.nrows,
                slice: s + data.extent.nslices,
            });
        }
        let npix = data.extent.npix();
        if data.valid.len() != npix {
            return Err(Error::DimensionMismatch {
                expected: npix,
                actual: data.valid.len(),
            });
        }
        let nvalid = data.valid.iter().filter(|&&v| v).count();
        if data.labels.len() != nvalid || data.objects.len() != nvalid {
            return Err(Error::DimensionMismatch {
                expected: nvalid,
                actual: data.labels.len(),
            });
        }
        let nbands = self.nbands();
        if data.has_features() && data.features.len() != nbands * nvalid {
            return Err(Error::DimensionMismatch {
                expected: nbands * nvalid,
                actual: data.features.len(),
            });
        }

        let origin = self.extent.offset_of(&data.extent);
        let size = data.extent.size();
        let mut labels = vec![0u32; npix];
        let mut objects = vec![0u32; npix];
        let mut planes = vec![vec![0f32; if data.has_features() { npix } else { 0 }]; nbands];
        let mut edges = vec![0f32; if data.has_features() { npix } else { 0 }];
        let mut packed = 0;
        for (i, &v) in data.valid.iter().enumerate() {
            if !v {
                continue;
            }
            labels[i] = data.labels[packed];
            objects[i] = data.objects[packed];
            if data.has_features() {
                for (band, plane) in planes.iter_mut().enumerate() {
                    plane[i] = data.features[packed * nbands + band];
                }
                edges[i] = data.edges[packed];
            }
            packed += 1;
        }
        self.valid.paste_box(origin, size, &data.valid)?;
        self.labels.paste_box(origin, size, &labels)?;
        self.objects.paste_box(origin, size, &objects)?;
        if data.has_features() {
            for (plane, values) in self.features.iter_mut().zip(&planes) {
                plane.paste_box(origin, size, values)?;
            }
            self.edges.paste_box(origin, size, &edges)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use crate::raster::MemoryRaster;

    fn raster() -> MemoryRaster {
        // two columns of 1s, two of 5s, last pixel masked out
        let values = vec![
            1.0, 1.0, 5.0, 5.0, //
            1.0, 1.0, 5.0, 5.0, //
            1.0, 1.0, 5.0, 5.0,
        ];
        let mut mask = vec![true; 12];
        mask[11] = false;
        MemoryRaster::from_rows(4, 3, values)
            .unwrap()
            .with_mask(mask)
            .unwrap()
    }

    fn layout() -> Layout {
        Layout::new(&Config::default(), 1)
    }

    #[test]
    fn computed_edges_see_outside_neighbours() {
        let raster = raster();
        let right = Extent {
            col0: 2,
            ncols: 2,
            ..Extent::new(4, 3, 1)
        };
        let section = PixelSection::load(&raster, right);
        assert_eq!(section.nvalid(), 5);
        // column 2 borders the 1s in column 1, outside the section
        assert_eq!(section.edges()[0], 4.0);
        assert_eq!(section.edges()[1], 0.0);
        assert_eq!(section.edges()[5], 0.0);
    }

    #[test]
    fn seeding_modes() {
        let raster = raster();
        let mut section = PixelSection::load(&raster, raster.extent());
        let mut table = layout().empty_table();
        assert_eq!(section.seed(InitMode::Pixel, Neighborhood::Four, &mut table), 11);
        assert_eq!(table.npix_total(), 11);
        assert_eq!(section.labels()[11], 0);

        let mut section = PixelSection::load(&raster, raster.extent());
        let mut table = layout().empty_table();
        assert_eq!(
            section.seed(InitMode::Components, Neighborhood::Four, &mut table),
            2
        );
        assert_eq!(table.region(1).npix, 6);
        assert_eq!(table.region(2).npix, 5);
        assert_eq!(table.region(2).sum, vec![25.0]);
        assert!(table.region(1).neighbors.contains(&2));
    }

    #[test]
    fn offset_and_relabel_skip_invalid() {
        let raster = raster();
        let mut section = PixelSection::load(&raster, raster.extent());
        let mut table = layout().empty_table();
        section.seed(InitMode::Components, Neighborhood::Four, &mut table);
        section.offset_labels(1000);
        assert_eq!(section.labels()[0], 1001);
        assert_eq!(section.labels()[11], 0);
        section.relabel(&[(1002, 1001)]);
        assert!(section.labels()[..11].iter().all(|&l| l == 1001));
    }

    #[test]
    fn export_import_box() {
        let raster = raster();
        let mut section = PixelSection::load(&raster, raster.extent());
        let mut table = layout().empty_table();
        section.seed(InitMode::Pixel, Neighborhood::Four, &mut table);
        let right = Extent {
            col0: 2,
            ncols: 2,
            ..raster.extent()
        };
        let data = section.export(&right, true);
        assert_eq!(data.nvalid(), 5);
        assert_eq!(data.features, vec![5.0; 5]);

        let mut whole = PixelSection::blank(raster.extent(), 1);
        whole.import(&data).unwrap();
        assert_eq!(whole.nvalid(), 5);
        assert_eq!(whole.labels()[2], section.labels()[2]);
        assert_eq!(whole.labels()[0], 0);
        assert_eq!(whole.export(&right, true), data);

        let outside = Extent {
            col0: 3,
            ..right
        };
        let mut moved = data.clone();
        moved.extent = outside;
        assert!(whole.import(&moved).is_err());
    }

    #[test]
    fn objects_split_disconnected_parts_of_a_region() {
        let raster = MemoryRaster::from_rows(3, 1, vec![1.0, 2.0, 1.0]).unwrap();
        let mut section = PixelSection::load(&raster, raster.extent());
        let mut table = layout().empty_table();
        section.seed(InitMode::Pixel, Neighborhood::Four, &mut table);
        section.relabel(&[(3, 1)]);
        let report = section.label_objects(Neighborhood::Four, &layout());
        assert_eq!(section.objects(), &[1, 2, 3]);
        assert_eq!(report.classes, vec![1, 2, 1]);
        assert_eq!(report.table.region(2).neighbors.len(), 2);
    }
}
