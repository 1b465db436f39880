//! Fault and upgrade domain trees.
//!
//! A `DomainTree<T>` mirrors the hierarchy of domain paths (`dc1/rack2`)
//! with one payload per tree node. The builder creates a
//! `DomainTree<DomainData>` once per pass; per-domain load accumulators are
//! derived from it with [`DomainTree::map`]. After construction the shape
//! never changes and nodes are only addressed through [`TreeNodeIndex`].

use serde::{Deserialize, Serialize};

/// Position of a tree node as the list of child offsets from the root.
///
/// Used as an opaque grouping key once the tree is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TreeNodeIndex(Vec<usize>);

impl TreeNodeIndex {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn offsets(&self) -> &[usize] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

/// Payload of the structural tree built from node domain paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainData {
    /// Cluster nodes rooted under this prefix.
    pub node_count: usize,
}

#[derive(Debug, Clone)]
pub struct DomainNode<T> {
    segment: String,
    data: T,
    children: Vec<DomainNode<T>>,
}

impl<T> DomainNode<T> {
    fn new(segment: String, data: T) -> Self {
        Self {
            segment,
            data,
            children: Vec::new(),
        }
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn children(&self) -> &[DomainNode<T>] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn map<U>(&self, f: &mut impl FnMut(&T) -> U) -> DomainNode<U> {
        DomainNode {
            segment: self.segment.clone(),
            data: f(&self.data),
            children: self.children.iter().map(|child| child.map(f)).collect(),
        }
    }

    fn collect_leaves<'a>(&'a self, path: &mut Vec<usize>, out: &mut Vec<(TreeNodeIndex, &'a T)>) {
        if self.children.is_empty() {
            out.push((TreeNodeIndex(path.clone()), &self.data));
            return;
        }
        for (offset, child) in self.children.iter().enumerate() {
            path.push(offset);
            child.collect_leaves(path, out);
            path.pop();
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomainTree<T> {
    root: DomainNode<T>,
}

impl DomainTree<DomainData> {
    /// Build the tree from one segment path per cluster node.
    ///
    /// Paths are inserted in sorted order so that child offsets do not
    /// depend on node order. Returns the index of each input path, in input
    /// order.
    pub fn from_paths<S: AsRef<str>>(paths: &[Vec<S>]) -> (Self, Vec<TreeNodeIndex>) {
        let mut root = DomainNode::new(String::new(), DomainData::default());

        let mut order: Vec<usize> = (0..paths.len()).collect();
        order.sort_by(|&a, &b| {
            let lhs = paths[a].iter().map(AsRef::as_ref);
            let rhs = paths[b].iter().map(AsRef::as_ref);
            lhs.cmp(rhs)
        });

        let mut indices = vec![TreeNodeIndex::root(); paths.len()];
        for position in order {
            let mut offsets = Vec::with_capacity(paths[position].len());
            let mut current = &mut root;
            current.data.node_count += 1;
            for segment in &paths[position] {
                let segment = segment.as_ref();
                let offset = match current.children.iter().position(|c| c.segment == segment) {
                    Some(offset) => offset,
                    None => {
                        current
                            .children
                            .push(DomainNode::new(segment.to_string(), DomainData::default()));
                        current.children.len() - 1
                    }
                };
                offsets.push(offset);
                current = &mut current.children[offset];
                current.data.node_count += 1;
            }
            indices[position] = TreeNodeIndex(offsets);
        }

        (Self { root }, indices)
    }
}

impl<T> DomainTree<T> {
    pub fn root(&self) -> &DomainNode<T> {
        &self.root
    }

    /// Copy the tree shape while transforming every payload.
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> DomainTree<U> {
        DomainTree {
            root: self.root.map(&mut f),
        }
    }

    pub fn get(&self, index: &TreeNodeIndex) -> Option<&T> {
        let mut current = &self.root;
        for &offset in index.offsets() {
            current = current.children.get(offset)?;
        }
        Some(&current.data)
    }

    pub fn get_mut(&mut self, index: &TreeNodeIndex) -> Option<&mut T> {
        let mut current = &mut self.root;
        for &offset in index.offsets() {
            current = current.children.get_mut(offset)?;
        }
        Some(&mut current.data)
    }

    /// Apply `f` to every payload from the root down to `index`, inclusive.
    pub fn for_each_on_path_mut(&mut self, index: &TreeNodeIndex, mut f: impl FnMut(&mut T)) {
        let mut current = &mut self.root;
        f(&mut current.data);
        for &offset in index.offsets() {
            current = &mut current.children[offset];
            f(&mut current.data);
        }
    }

    /// Leaf payloads with their indices, depth first.
    pub fn leaves(&self) -> Vec<(TreeNodeIndex, &T)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.root.collect_leaves(&mut path, &mut out);
        out
    }

    /// Domain path of `index` joined with `/`.
    pub fn path_name(&self, index: &TreeNodeIndex) -> Option<String> {
        let mut current = &self.root;
        let mut segments = Vec::with_capacity(index.depth());
        for &offset in index.offsets() {
            current = current.children.get(offset)?;
            segments.push(current.segment.as_str());
        }
        Some(segments.join("/"))
    }
}

/// Split a fault domain such as `fd:/dc1/rack2` into its segments.
pub fn split_domain_path(path: &str) -> Vec<String> {
    let trimmed = path.strip_prefix("fd:").unwrap_or(path);
    trimmed
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(raw: &[&str]) -> Vec<Vec<String>> {
        raw.iter().map(|p| split_domain_path(p)).collect()
    }

    #[test]
    fn splits_fault_domain_paths() {
        assert_eq!(split_domain_path("fd:/dc1/rack2"), vec!["dc1", "rack2"]);
        assert_eq!(split_domain_path("dc1/rack2/"), vec!["dc1", "rack2"]);
        assert!(split_domain_path("").is_empty());
    }

    #[test]
    fn counts_nodes_per_prefix() {
        let (tree, indices) = DomainTree::from_paths(&paths(&["dc1/r1", "dc1/r2", "dc2/r1", "dc1/r1"]));

        assert_eq!(tree.root().data().node_count, 4);
        assert_eq!(tree.root().children().len(), 2);
        assert_eq!(tree.root().children()[0].segment(), "dc1");
        assert_eq!(tree.root().children()[0].data().node_count, 3);
        assert_eq!(indices[0], indices[3]);
        assert_ne!(indices[0], indices[1]);
        assert_eq!(tree.get(&indices[2]).unwrap().node_count, 1);
        assert_eq!(tree.path_name(&indices[1]).unwrap(), "dc1/r2");
    }

    #[test]
    fn indices_do_not_depend_on_input_order() {
        let (_, forward) = DomainTree::from_paths(&paths(&["b", "a"]));
        let (_, reverse) = DomainTree::from_paths(&paths(&["a", "b"]));
        assert_eq!(forward[0], reverse[1]);
        assert_eq!(forward[1], reverse[0]);
    }

    #[test]
    fn map_preserves_shape() {
        let (tree, indices) = DomainTree::from_paths(&paths(&["dc1/r1", "dc2/r1"]));
        let mut loads = tree.map(|data| data.node_count as i64 * 10);

        loads.for_each_on_path_mut(&indices[1], |v| *v += 1);

        assert_eq!(*loads.root().data(), 21);
        assert_eq!(*loads.get(&indices[1]).unwrap(), 11);
        assert_eq!(*loads.get(&indices[0]).unwrap(), 10);
        assert_eq!(loads.leaves().len(), 2);
    }

    #[test]
    fn missing_index_returns_none() {
        let (tree, _) = DomainTree::from_paths(&paths(&["a"]));
        assert!(tree.get(&TreeNodeIndex(vec![5])).is_none());
    }
}
