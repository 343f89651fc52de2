use assume::assume;

/// Union-find over region labels with path compression and union by size.
///
/// Every set remembers which of its labels is the surviving (active) one, independently of
/// which node ended up as the tree root, so `find` always answers with the active label the
/// merges designated. Label 0 is reserved for "no region" and maps to itself.
#[derive(Debug, Clone, Default)]
pub struct LabelForest {
    parents: Vec<u32>,
    sizes: Vec<u32>,
    survivors: Vec<u32>,
}

impl LabelForest {
    pub fn new(nlabels: u32) -> Self {
        let mut forest = Self::default();
        forest.extend_to(nlabels);
        forest
    }

    /// Number of labels tracked, not counting label 0.
    pub fn len(&self) -> u32 {
        self.parents.len().saturating_sub(1) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes sure labels `1..=nlabels` exist, each new one in its own set.
    pub fn extend_to(&mut self, nlabels: u32) {
        let start = self.parents.len() as u32;
        for label in start..=nlabels {
            self.parents.push(label);
            self.sizes.push(1);
            self.survivors.push(label);
        }
    }

    fn root(&mut self, label: u32) -> u32 {
        let mut root = label as usize;
        loop {
            assume!(unsafe: root < self.parents.len(), "root: {root} > {}", self.parents.len());
            let parent = self.parents[root] as usize;
            if parent == root {
                break;
            }
            root = parent;
        }
        let mut node = label as usize;
        while node != root {
            assume!(unsafe: node < self.parents.len(), "node: {node} > {}", self.parents.len());
            let next = self.parents[node] as usize;
            self.parents[node] = root as u32;
            node = next;
        }
        root as u32
    }

    /// Active label of the set containing `label`.
    pub fn find(&mut self, label: u32) -> u32 {
        debug_assert!(
            (label as usize) < self.parents.len(),
            "label {label} > {}",
            self.len()
        );
        let root = self.root(label);
        self.survivors[root as usize]
    }

    /// `find` without path compression, for shared access.
    pub fn find_shared(&self, label: u32) -> u32 {
        let mut root = label as usize;
        while self.parents[root] as usize != root {
            root = self.parents[root] as usize;
        }
        self.survivors[root]
    }

    /// Joins the sets of `survivor` and `absorbed`; `find` on any member then answers
    /// `survivor`.
    pub fn union(&mut self, survivor: u32, absorbed: u32) {
        let root_s = self.root(survivor) as usize;
        let root_a = self.root(absorbed) as usize;
        if root_s == root_a {
            return;
        }
        let (big, small) = if self.sizes[root_s] >= self.sizes[root_a] {
            (root_s, root_a)
        } else {
            (root_a, root_s)
        };
        self.parents[small] = big as u32;
        self.sizes[big] += self.sizes[small];
        self.survivors[big] = survivor;
    }
}

#[cfg(test)]
mod tests {
    use super::LabelForest;

    #[test]
    fn chain_resolves_to_survivor() {
        let mut forest = LabelForest::new(5);
        forest.union(2, 3);
        forest.union(1, 2);
        assert_eq!(forest.find(3), 1);
        assert_eq!(forest.find(2), 1);
        assert_eq!(forest.find_shared(3), 1);
        assert_eq!(forest.find(4), 4);
        assert_eq!(forest.find(0), 0);
    }

    #[test]
    fn survivor_independent_of_tree_shape() {
        let mut forest = LabelForest::new(6);
        forest.union(4, 5);
        forest.union(4, 6);
        // the set of 4 is larger, but 1 must survive
        forest.union(1, 4);
        for label in [1, 4, 5, 6] {
            assert_eq!(forest.find(label), 1);
        }
    }

    #[test]
    fn extend_keeps_existing_sets() {
        let mut forest = LabelForest::new(2);
        forest.union(1, 2);
        forest.extend_to(4);
        assert_eq!(forest.len(), 4);
        assert_eq!(forest.find(2), 1);
        assert_eq!(forest.find(4), 4);
    }
}
