use crate::common::{split_length_to_ranges, Neighborhood};

/// Axis of a partition cut.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    Col,
    Row,
    Slice,
}

/// An internal cut of a combined section: the boundary between global coordinate `at - 1` and
/// `at` along `axis`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cut {
    pub axis: Axis,
    pub at: usize,
}

/// Axis-aligned box of pixels in global raster coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub col0: usize,
    pub row0: usize,
    pub slice0: usize,
    pub ncols: usize,
    pub nrows: usize,
    pub nslices: usize,
}

impl Extent {
    pub fn new(ncols: usize, nrows: usize, nslices: usize) -> Self {
        Self {
            col0: 0,
            row0: 0,
            slice0: 0,
            ncols,
            nrows,
            nslices,
        }
    }

    pub fn npix(&self) -> usize {
        self.ncols * self.nrows * self.nslices
    }

    pub fn size(&self) -> (usize, usize, usize) {
        (self.ncols, self.nrows, self.nslices)
    }

    pub fn origin(&self) -> (usize, usize, usize) {
        (self.col0, self.row0, self.slice0)
    }

    pub fn contains(&self, col: usize, row: usize, slice: usize) -> bool {
        col >= self.col0
            && col < self.col0 + self.ncols
            && row >= self.row0
            && row < self.row0 + self.nrows
            && slice >= self.slice0
            && slice < self.slice0 + self.nslices
    }

    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        let overlap = |a0: usize, an: usize, b0: usize, bn: usize| {
            let lo = a0.max(b0);
            let hi = (a0 + an).min(b0 + bn);
            (hi > lo).then(|| (lo, hi - lo))
        };
        let (col0, ncols) = overlap(self.col0, self.ncols, other.col0, other.ncols)?;
        let (row0, nrows) = overlap(self.row0, self.nrows, other.row0, other.nrows)?;
        let (slice0, nslices) = overlap(self.slice0, self.nslices, other.slice0, other.nslices)?;
        Some(Extent {
            col0,
            row0,
            slice0,
            ncols,
            nrows,
            nslices,
        })
    }

    /// Origin of `inner` relative to this extent. `inner` must lie inside.
    pub fn offset_of(&self, inner: &Extent) -> (usize, usize, usize) {
        debug_assert!(
            self.intersect(inner) == Some(*inner),
            "{inner:?} is not inside {self:?}"
        );
        (
            inner.col0 - self.col0,
            inner.row0 - self.row0,
            inner.slice0 - self.slice0,
        )
    }

    /// Splits along every axis with at least two pixels, halving it. Children come out slice
    /// major, then row, then column; the cuts are the internal boundaries between them.
    pub fn split(&self) -> (Vec<Extent>, Vec<Cut>) {
        let halves = |start: usize, len: usize| -> Vec<(usize, usize)> {
            if len < 2 {
                vec![(start, len)]
            } else {
                split_length_to_ranges(len, 2)
                    .into_iter()
                    .map(|r| (start + r.start, r.len()))
                    .collect()
            }
        };
        let cols = halves(self.col0, self.ncols);
        let rows = halves(self.row0, self.nrows);
        let slices = halves(self.slice0, self.nslices);

        let mut children = Vec::with_capacity(cols.len() * rows.len() * slices.len());
        for &(slice0, nslices) in &slices {
            for &(row0, nrows) in &rows {
                for &(col0, ncols) in &cols {
                    children.push(Extent {
                        col0,
                        row0,
                        slice0,
                        ncols,
                        nrows,
                        nslices,
                    });
                }
            }
        }

        let mut cuts = Vec::new();
        if cols.len() > 1 {
            cuts.push(Cut {
                axis: Axis::Col,
                at: cols[1].0,
            });
        }
        if rows.len() > 1 {
            cuts.push(Cut {
                axis: Axis::Row,
                at: rows[1].0,
            });
        }
        if slices.len() > 1 {
            cuts.push(Cut {
                axis: Axis::Slice,
                at: slices[1].0,
            });
        }
        (children, cuts)
    }

    pub fn can_split(&self) -> bool {
        self.ncols > 1 || self.nrows > 1 || self.nslices > 1
    }

    /// The two-pixel-thick slab straddling `cut`, clipped to this extent.
    pub fn seam_slab(&self, cut: &Cut) -> Extent {
        let mut slab = *self;
        match cut.axis {
            Axis::Col => {
                slab.col0 = cut.at - 1;
                slab.ncols = 2;
            }
            Axis::Row => {
                slab.row0 = cut.at - 1;
                slab.nrows = 2;
            }
            Axis::Slice => {
                slab.slice0 = cut.at - 1;
                slab.nslices = 2;
            }
        }
        slab
    }

    pub fn is_3d(&self) -> bool {
        self.nslices > 1
    }
}

/// All neighbour offsets `(dx, dy, dz)` of a pixel.
pub fn neighbor_offsets(neighborhood: Neighborhood, three_d: bool) -> Vec<(isize, isize, isize)> {
    let dz_range: &[isize] = if three_d { &[-1, 0, 1] } else { &[0] };
    let mut offsets = Vec::new();
    for &dz in dz_range {
        for dy in -1isize..=1 {
            for dx in -1isize..=1 {
                let manhattan = dx.abs() + dy.abs() + dz.abs();
                let keep = match neighborhood {
                    Neighborhood::Four => manhattan == 1,
                    Neighborhood::Eight => manhattan > 0,
                };
                if keep {
                    offsets.push((dx, dy, dz));
                }
            }
        }
    }
    offsets
}

/// Half of [`neighbor_offsets`]: each unordered pixel pair is visited once when every pixel
/// looks only forward.
pub fn forward_offsets(neighborhood: Neighborhood, three_d: bool) -> Vec<(isize, isize, isize)> {
    neighbor_offsets(neighborhood, three_d)
        .into_iter()
        .filter(|&(dx, dy, dz)| dz > 0 || (dz == 0 && (dy > 0 || (dy == 0 && dx > 0))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_quad() {
        let extent = Extent::new(5, 4, 1);
        let (children, cuts) = extent.split();
        assert_eq!(children.len(), 4);
        assert_eq!(children[0].size(), (3, 2, 1));
        assert_eq!(children[1].origin(), (3, 0, 0));
        assert_eq!(children[3].origin(), (3, 2, 0));
        assert_eq!(
            cuts,
            vec![
                Cut {
                    axis: Axis::Col,
                    at: 3
                },
                Cut {
                    axis: Axis::Row,
                    at: 2
                }
            ]
        );
        assert_eq!(children.iter().map(Extent::npix).sum::<usize>(), 20);
    }

    #[test]
    fn split_single_row() {
        let (children, cuts) = Extent::new(4, 1, 1).split();
        assert_eq!(children.len(), 2);
        assert_eq!(cuts.len(), 1);
    }

    #[test]
    fn intersection() {
        let a = Extent::new(4, 4, 1);
        let b = Extent {
            col0: 2,
            row0: 3,
            slice0: 0,
            ncols: 5,
            nrows: 5,
            nslices: 1,
        };
        let i = a.intersect(&b).unwrap();
        assert_eq!((i.origin(), i.size()), ((2, 3, 0), (2, 1, 1)));
        assert_eq!(a.offset_of(&i), (2, 3, 0));
        let far = Extent {
            col0: 10,
            ..b
        };
        assert!(a.intersect(&far).is_none());
        let below = Extent {
            col0: 0,
            row0: 6,
            ..b
        };
        assert!(a.intersect(&below).is_none());
        assert!(below.intersect(&a).is_none());
        let touching = Extent {
            col0: 4,
            ..b
        };
        assert!(a.intersect(&touching).is_none());
    }

    #[test]
    fn seam_slab_of_col_cut() {
        let extent = Extent::new(6, 3, 1);
        let slab = extent.seam_slab(&Cut {
            axis: Axis::Col,
            at: 3,
        });
        assert_eq!((slab.col0, slab.ncols, slab.nrows), (2, 2, 3));
        assert_eq!(extent.intersect(&slab), Some(slab));
    }

    #[test]
    fn offsets() {
        assert_eq!(neighbor_offsets(Neighborhood::Four, false).len(), 4);
        assert_eq!(neighbor_offsets(Neighborhood::Eight, false).len(), 8);
        assert_eq!(neighbor_offsets(Neighborhood::Four, true).len(), 6);
        assert_eq!(neighbor_offsets(Neighborhood::Eight, true).len(), 26);
        assert_eq!(forward_offsets(Neighborhood::Eight, false).len(), 4);
        assert_eq!(forward_offsets(Neighborhood::Eight, true).len(), 13);
    }
}
