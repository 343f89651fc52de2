use crate::common::Neighborhood;
use crate::extent::forward_offsets;
use assume::assume;

/// Disjoint set over pixel indices, linking with Rem's algorithm: a node's parent index is
/// never larger than the node itself, so roots are the first pixel of their component in scan
/// order.
pub struct DisjointSet {
    parents: Vec<u32>,
}

impl DisjointSet {
    pub fn new(size: u32) -> Self {
        assert!(size < u32::MAX, "Size must be smaller than {}", u32::MAX);
        DisjointSet {
            parents: (0..size).collect(),
        }
    }

    #[inline]
    pub fn merge(&mut self, node_i: u32, node_j: u32) {
        let mut root_x = node_i as usize;
        let mut root_y = node_j as usize;
        let mut parent_x = self.parents[root_x];
        let mut parent_y = self.parents[root_y];
        while parent_x != parent_y {
            if parent_x > parent_y {
                assume!(unsafe: root_x < self.parents.len(), "root: {root_x} > {}", self.parents.len());
                if root_x as u32 == parent_x {
                    self.parents[root_x] = parent_y;
                    break;
                }
                let z = parent_x as usize;
                parent_x = self.parents[z];
                self.parents[root_x] = parent_y;
                root_x = z;
            } else {
                assume!(unsafe: root_y < self.parents.len(), "root: {root_y} > {}", self.parents.len());
                if root_y as u32 == parent_y {
                    self.parents[root_y] = parent_x;
                    break;
                }
                let z = parent_y as usize;
                parent_y = self.parents[z];
                self.parents[root_y] = parent_x;
                root_y = z;
            }
        }
    }

    /// Numbers the components `1..=n` in order of their first pixel. Pixels for which
    /// `include` is false get 0 and do not count.
    pub fn flatten<F>(&self, include: F) -> (Vec<u32>, u32)
    where
        F: Fn(usize) -> bool,
    {
        let mut assignment = vec![0u32; self.parents.len()];
        let mut num_components = 0u32;
        for i in 0..self.parents.len() {
            if !include(i) {
                continue;
            }
            let parent = self.parents[i] as usize;
            if parent < i {
                // parents always precede their children, so the root is already numbered
                let mut root = parent;
                while self.parents[root] as usize != root {
                    root = self.parents[root] as usize;
                }
                assignment[i] = assignment[root];
            } else {
                num_components += 1;
                assignment[i] = num_components;
            }
        }
        (assignment, num_components)
    }
}

/// Connected-component labeling of a `(width, height, depth)` box.
///
/// Two neighbouring pixels join when both are valid and `same(a, b)` holds for their linear
/// indices. Returns per-pixel component labels (0 for invalid pixels) and the component count.
pub fn label_components<F>(
    size: (usize, usize, usize),
    valid: &[bool],
    neighborhood: Neighborhood,
    same: F,
) -> (Vec<u32>, u32)
where
    F: Fn(usize, usize) -> bool,
{
    let (width, height, depth) = size;
    debug_assert_eq!(valid.len(), width * height * depth);
    let mut set = DisjointSet::new(valid.len() as u32);
    let offsets = forward_offsets(neighborhood, depth > 1);
    for z in 0..depth {
        for y in 0..height {
            for x in 0..width {
                let index = (z * height + y) * width + x;
                if !valid[index] {
                    continue;
                }
                for &(dx, dy, dz) in &offsets {
                    let (nx, ny, nz) = (x as isize + dx, y as isize + dy, z as isize + dz);
                    if nx < 0
                        || ny < 0
                        || nx >= width as isize
                        || ny >= height as isize
                        || nz >= depth as isize
                    {
                        continue;
                    }
                    let neighbor = (nz as usize * height + ny as usize) * width + nx as usize;
                    if valid[neighbor] && same(index, neighbor) {
                        set.merge(index as u32, neighbor as u32);
                    }
                }
            }
        }
    }
    set.flatten(|i| valid[i])
}
