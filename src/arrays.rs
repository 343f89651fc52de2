use crate::error::Error;
use aligned_vec::{AVec, ConstAlign};
use std::ops::{Index, IndexMut};

const ALIGN: usize = 64;

/// Dense 3-D array laid out `x` fastest, then `y`, then `z`.
///
/// 2-D data is simply `depth == 1`.
#[derive(Debug, Clone)]
pub struct Array3D<T> {
    pub data: AVec<T, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl<T> Array3D<T> {
    pub fn from_slice(data: &[T], width: usize, height: usize, depth: usize) -> Result<Self, Error>
    where
        T: Clone,
    {
        if data.len() != width * height * depth {
            return Err(Error::DimensionMismatch {
                expected: width * height * depth,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            depth,
            data: AVec::from_slice(ALIGN, data),
        })
    }

    pub fn from_fill(value: T, width: usize, height: usize, depth: usize) -> Self
    where
        T: Clone + Copy,
    {
        let data: AVec<T, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..width * height * depth).map(|_| value));
        Self {
            width,
            height,
            depth,
            data,
        }
    }

    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.data.fill(value)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(
            self.width > x,
            "Index ({x}, {y}, {z}) is out of bounds ({}, {}, {})",
            self.width,
            self.height,
            self.depth
        );
        debug_assert!(
            self.height > y,
            "Index ({x}, {y}, {z}) is out of bounds ({}, {}, {})",
            self.width,
            self.height,
            self.depth
        );
        debug_assert!(
            self.depth > z,
            "Index ({x}, {y}, {z}) is out of bounds ({}, {}, {})",
            self.width,
            self.height,
            self.depth
        );
        (z * self.height + y) * self.width + x
    }

    pub fn get_x_y_z_index(&self, ind: usize) -> (usize, usize, usize) {
        debug_assert!(ind < self.data.len());
        let x = ind % self.width;
        let y = (ind / self.width) % self.height;
        let z = ind / (self.width * self.height);
        (x, y, z)
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Result<&T, Error> {
        if x >= self.width || y >= self.height || z >= self.depth {
            return Err(Error::IndicesOutOfBounds {
                col: x,
                row: y,
                slice: z,
            });
        }
        Ok(&self.data[self.get_index(x, y, z)])
    }

    pub fn get_row(&self, y: usize, z: usize) -> &[T] {
        let start = self.get_index(0, y, z);
        &self.data[start..start + self.width]
    }

    pub fn get_row_mut(&mut self, y: usize, z: usize) -> &mut [T] {
        let start = self.get_index(0, y, z);
        let width = self.width;
        &mut self.data[start..start + width]
    }

    /// Copies out the box starting at `origin` with `size` (both in local `(x, y, z)`
    /// coordinates), in the same `x`-fastest order.
    pub fn copy_box(&self, origin: (usize, usize, usize), size: (usize, usize, usize)) -> Vec<T>
    where
        T: Clone,
    {
        assert!(
            origin.0 + size.0 <= self.width
                && origin.1 + size.1 <= self.height
                && origin.2 + size.2 <= self.depth,
            "Box {origin:?}+{size:?} does not fit into ({}, {}, {})",
            self.width,
            self.height,
            self.depth
        );
        let mut out = Vec::with_capacity(size.0 * size.1 * size.2);
        for z in origin.2..origin.2 + size.2 {
            for y in origin.1..origin.1 + size.1 {
                let start = self.get_index(origin.0, y, z);
                out.extend_from_slice(&self.data[start..start + size.0]);
            }
        }
        out
    }

    /// Inverse of [`Array3D::copy_box`].
    pub fn paste_box(
        &mut self,
        origin: (usize, usize, usize),
        size: (usize, usize, usize),
        values: &[T],
    ) -> Result<(), Error>
    where
        T: Clone,
    {
        if values.len() != size.0 * size.1 * size.2 {
            return Err(Error::DimensionMismatch {
                expected: size.0 * size.1 * size.2,
                actual: values.len(),
            });
        }
        if origin.0 + size.0 > self.width
            || origin.1 + size.1 > self.height
            || origin.2 + size.2 > self.depth
        {
            return Err(Error::IndicesOutOfBounds {
                col: origin.0 + size.0,
                row: origin.1 + size.1,
                slice: origin.2 + size.2,
            });
        }
        let mut chunks = values.chunks_exact(size.0.max(1));
        for z in origin.2..origin.2 + size.2 {
            for y in origin.1..origin.1 + size.1 {
                let start = self.get_index(origin.0, y, z);
                if let Some(chunk) = chunks.next() {
                    self.data[start..start + size.0].clone_from_slice(chunk);
                }
            }
        }
        Ok(())
    }
}

impl<T> Index<(usize, usize, usize)> for Array3D<T> {
    type Output = T;
    fn index(&self, (x, y, z): (usize, usize, usize)) -> &Self::Output {
        &self.data[self.get_index(x, y, z)]
    }
}

impl<T> IndexMut<(usize, usize, usize)> for Array3D<T> {
    fn index_mut(&mut self, (x, y, z): (usize, usize, usize)) -> &mut Self::Output {
        let idx = self.get_index(x, y, z);
        &mut self.data[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::Array3D;
    use crate::error::Error;

    #[test]
    fn index_round_trip() {
        let arr = Array3D::from_fill(0u32, 5, 4, 3);
        for i in 0..arr.len() {
            let (x, y, z) = arr.get_x_y_z_index(i);
            assert_eq!(arr.get_index(x, y, z), i);
        }
    }

    #[test]
    fn copy_and_paste_box() {
        let data: Vec<u32> = (0..24).collect();
        let arr = Array3D::from_slice(&data, 4, 3, 2).unwrap();
        let part = arr.copy_box((1, 1, 1), (2, 2, 1));
        assert_eq!(part, vec![17, 18, 21, 22]);

        let mut target = Array3D::from_fill(0u32, 4, 3, 2);
        target.paste_box((1, 1, 1), (2, 2, 1), &part).unwrap();
        assert_eq!(target[(2, 2, 1)], 22);
        assert_eq!(target[(0, 0, 0)], 0);
    }

    #[test]
    fn rejects_bad_dimensions() {
        let err = Array3D::from_slice(&[1u8, 2, 3], 2, 2, 1).unwrap_err();
        assert_eq!(
            err,
            Error::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        );
        let arr = Array3D::from_fill(0u8, 2, 2, 1);
        assert!(arr.get(2, 0, 0).is_err());
    }
}
