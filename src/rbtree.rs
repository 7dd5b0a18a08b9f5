//! Red-black tree over an index arena.
//!
//! Nodes live in a slab owned by the tree and are addressed by [`NodeRef`]
//! handles, which stay valid until the node is deleted. The tree never
//! compares keys itself: callers descend with [`RbTree::locate`] and attach
//! the new node where their ordering says it belongs. The scheduler and the
//! allocator each impose their own ordering on the same primitive.

use crate::invariant_ppt::{assert_invariant, RB_ATTACH_SLOT_FREE, RB_NODE_LIVE};

/// Handle to a node of an [`RbTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(u32);

/// Node colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

/// Which child slot of a parent a node occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Structural violations reported by [`RbTree::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum RbViolation {
    /// Root node is red.
    RedRoot,
    /// A red node has a red child.
    RedRedEdge,
    /// Two paths from one node to leaves carry different black counts.
    UnequalBlackHeight,
    /// A child does not point back at its parent.
    BrokenLink,
    /// Reachable node count differs from the recorded length.
    LengthMismatch,
}

/// Contents of a node removed by [`RbTree::delete`].
#[derive(Debug)]
pub struct Detached<K, V> {
    pub key: K,
    pub value: V,
    /// In-order successor of the removed node, if any.
    pub next: Option<NodeRef>,
}

#[derive(Debug)]
struct Node<K, V> {
    parent: Option<NodeRef>,
    left: Option<NodeRef>,
    right: Option<NodeRef>,
    color: Color,
    key: K,
    value: V,
}

/// Arena-backed red-black tree.
#[derive(Debug)]
pub struct RbTree<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<u32>,
    root: Option<NodeRef>,
    len: usize,
}

impl<K, V> RbTree<K, V> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a tree whose arena holds `capacity` nodes before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root(&self) -> Option<NodeRef> {
        self.root
    }

    /// Whether `n` refers to a node currently in the tree.
    pub fn contains(&self, n: NodeRef) -> bool {
        matches!(self.nodes.get(n.0 as usize), Some(Some(_)))
    }

    pub fn key(&self, n: NodeRef) -> &K {
        &self.node(n).key
    }

    pub fn value(&self, n: NodeRef) -> &V {
        &self.node(n).value
    }

    pub fn value_mut(&mut self, n: NodeRef) -> &mut V {
        &mut self.node_mut(n).value
    }

    pub fn left(&self, n: NodeRef) -> Option<NodeRef> {
        self.node(n).left
    }

    pub fn right(&self, n: NodeRef) -> Option<NodeRef> {
        self.node(n).right
    }

    pub fn parent(&self, n: NodeRef) -> Option<NodeRef> {
        self.node(n).parent
    }

    pub fn color(&self, n: NodeRef) -> Color {
        self.node(n).color
    }

    /// Leftmost node.
    pub fn first(&self) -> Option<NodeRef> {
        self.root.map(|r| self.minimum(r))
    }

    /// Rightmost node.
    pub fn last(&self) -> Option<NodeRef> {
        self.root.map(|r| self.maximum(r))
    }

    /// In-order successor.
    pub fn next(&self, n: NodeRef) -> Option<NodeRef> {
        if let Some(r) = self.right(n) {
            return Some(self.minimum(r));
        }
        let mut child = n;
        let mut parent = self.parent(n);
        while let Some(p) = parent {
            if self.left(p) == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.parent(p);
        }
        None
    }

    /// In-order predecessor.
    pub fn prev(&self, n: NodeRef) -> Option<NodeRef> {
        if let Some(l) = self.left(n) {
            return Some(self.maximum(l));
        }
        let mut child = n;
        let mut parent = self.parent(n);
        while let Some(p) = parent {
            if self.right(p) == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.parent(p);
        }
        None
    }

    /// In-order iteration.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            cursor: self.first(),
        }
    }

    /// Descend from the root to a free child slot.
    ///
    /// `go_left` is asked at every visited node whether the new entry sorts
    /// before it. Returns the parent to attach to and the side to use; an
    /// empty tree yields `(None, Side::Left)`.
    pub fn locate<F>(&self, mut go_left: F) -> (Option<NodeRef>, Side)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut cursor = match self.root {
            Some(r) => r,
            None => return (None, Side::Left),
        };
        loop {
            let node = self.node(cursor);
            let side = if go_left(&node.key, &node.value) {
                Side::Left
            } else {
                Side::Right
            };
            match self.child(cursor, side) {
                Some(c) => cursor = c,
                None => return (Some(cursor), side),
            }
        }
    }

    /// Attach a new red node below `parent` on `side` and rebalance.
    pub fn insert(&mut self, parent: Option<NodeRef>, side: Side, key: K, value: V) -> NodeRef {
        let slot_free = match parent {
            None => self.root.is_none(),
            Some(p) => self.child(p, side).is_none(),
        };
        assert_invariant(
            RB_ATTACH_SLOT_FREE,
            slot_free,
            "insert target slot already occupied",
            Some("rbtree::insert"),
        );

        let n = self.alloc(Node {
            parent,
            left: None,
            right: None,
            color: Color::Red,
            key,
            value,
        });
        match parent {
            None => self.root = Some(n),
            Some(p) => self.set_child(p, side, Some(n)),
        }
        self.len += 1;
        self.insert_rebalance(n);
        n
    }

    /// Unlink `z`, rebalance, and hand back its contents and successor.
    pub fn delete(&mut self, z: NodeRef) -> Detached<K, V> {
        assert_invariant(
            RB_NODE_LIVE,
            self.contains(z),
            "delete of a node not in the tree",
            Some("rbtree::delete"),
        );
        let next = self.next(z);
        let z_left = self.left(z);
        let z_right = self.right(z);
        let mut removed_color = self.color(z);
        let x;
        let x_parent;

        match (z_left, z_right) {
            (None, _) => {
                x = z_right;
                x_parent = self.parent(z);
                self.transplant(z, z_right);
            }
            (Some(_), None) => {
                x = z_left;
                x_parent = self.parent(z);
                self.transplant(z, z_left);
            }
            (Some(zl), Some(zr)) => {
                // Successor takes z's place so every other handle stays valid.
                let y = self.minimum(zr);
                removed_color = self.color(y);
                x = self.right(y);
                if self.parent(y) == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.parent(y);
                    self.transplant(y, x);
                    self.node_mut(y).right = Some(zr);
                    self.node_mut(zr).parent = Some(y);
                }
                self.transplant(z, Some(y));
                self.node_mut(y).left = Some(zl);
                self.node_mut(zl).parent = Some(y);
                let z_color = self.color(z);
                self.node_mut(y).color = z_color;
            }
        }

        if removed_color == Color::Black {
            self.delete_rebalance(x, x_parent);
        }

        let node = self.release(z);
        self.len -= 1;
        Detached {
            key: node.key,
            value: node.value,
            next,
        }
    }

    /// Put a new node in exactly the position and colour of `old`.
    ///
    /// The caller guarantees `key` sorts into the same slot. Returns the new
    /// handle and the old contents.
    pub fn replace(&mut self, old: NodeRef, key: K, value: V) -> (NodeRef, K, V) {
        assert_invariant(
            RB_NODE_LIVE,
            self.contains(old),
            "replace of a node not in the tree",
            Some("rbtree::replace"),
        );
        let (parent, left, right, color) = {
            let o = self.node(old);
            (o.parent, o.left, o.right, o.color)
        };
        let old_node = self.release(old);
        let n = self.alloc(Node {
            parent,
            left,
            right,
            color,
            key,
            value,
        });
        self.replace_child(parent, old, Some(n));
        if let Some(l) = left {
            self.node_mut(l).parent = Some(n);
        }
        if let Some(r) = right {
            self.node_mut(r).parent = Some(n);
        }
        (n, old_node.key, old_node.value)
    }

    /// Check the red-black properties. Returns the black height on success.
    pub fn validate(&self) -> Result<usize, RbViolation> {
        let root = match self.root {
            None => {
                return if self.len == 0 {
                    Ok(0)
                } else {
                    Err(RbViolation::LengthMismatch)
                };
            }
            Some(r) => r,
        };
        if self.parent(root).is_some() {
            return Err(RbViolation::BrokenLink);
        }
        if self.color(root) == Color::Red {
            return Err(RbViolation::RedRoot);
        }
        let mut count = 0;
        let height = self.subtree_black_height(root, &mut count)?;
        if count != self.len {
            return Err(RbViolation::LengthMismatch);
        }
        Ok(height)
    }

    fn subtree_black_height(&self, n: NodeRef, count: &mut usize) -> Result<usize, RbViolation> {
        *count += 1;
        let mut heights = [1usize; 2];
        for (i, child) in [self.left(n), self.right(n)].into_iter().enumerate() {
            if let Some(c) = child {
                if self.parent(c) != Some(n) {
                    return Err(RbViolation::BrokenLink);
                }
                if self.color(n) == Color::Red && self.color(c) == Color::Red {
                    return Err(RbViolation::RedRedEdge);
                }
                heights[i] = self.subtree_black_height(c, count)?;
            }
        }
        if heights[0] != heights[1] {
            return Err(RbViolation::UnequalBlackHeight);
        }
        Ok(heights[0] + usize::from(self.color(n) == Color::Black))
    }

    // Insert rebalancing

    fn insert_rebalance(&mut self, mut n: NodeRef) {
        loop {
            let p = match self.parent(n) {
                None => {
                    self.node_mut(n).color = Color::Black;
                    return;
                }
                Some(p) => p,
            };
            if self.color(p) == Color::Black {
                return;
            }
            // A red parent is never the root, so the grandparent exists.
            let g = self.parent_of_red(p);
            let uncle = self.child(g, self.side_of(p, g).opposite());
            match uncle {
                Some(u) if self.color(u) == Color::Red => {
                    n = self.insert_case_red_uncle(p, u, g);
                }
                _ => {
                    self.insert_case_black_uncle(n, p, g);
                    return;
                }
            }
        }
    }

    /// Recolour and continue from the grandparent.
    fn insert_case_red_uncle(&mut self, p: NodeRef, u: NodeRef, g: NodeRef) -> NodeRef {
        self.node_mut(p).color = Color::Black;
        self.node_mut(u).color = Color::Black;
        self.node_mut(g).color = Color::Red;
        g
    }

    fn insert_case_black_uncle(&mut self, n: NodeRef, p: NodeRef, g: NodeRef) {
        let p_side = self.side_of(p, g);
        let (n, p) = if self.side_of(n, p) != p_side {
            self.insert_case_inner_child(n, p, p_side)
        } else {
            (n, p)
        };
        self.insert_case_outer_child(n, p, g, p_side);
    }

    /// Rotate an inner grandchild to the outer position; roles swap.
    fn insert_case_inner_child(&mut self, n: NodeRef, p: NodeRef, p_side: Side) -> (NodeRef, NodeRef) {
        self.rotate(p, p_side);
        (p, n)
    }

    fn insert_case_outer_child(&mut self, _n: NodeRef, p: NodeRef, g: NodeRef, p_side: Side) {
        self.node_mut(p).color = Color::Black;
        self.node_mut(g).color = Color::Red;
        self.rotate(g, p_side.opposite());
    }

    // Delete rebalancing

    fn delete_rebalance(&mut self, mut x: Option<NodeRef>, mut parent: Option<NodeRef>) {
        while x != self.root && !self.is_red(x) {
            let p = match parent {
                Some(p) => p,
                None => break,
            };
            let side = if self.left(p) == x { Side::Left } else { Side::Right };
            let mut w = self.sibling_of_doubly_black(p, side);

            if self.color(w) == Color::Red {
                w = self.delete_case_red_sibling(p, w, side);
            }
            let near = self.child(w, side);
            let far = self.child(w, side.opposite());
            if !self.is_red(near) && !self.is_red(far) {
                self.delete_case_black_nephews(w);
                x = Some(p);
                parent = self.parent(p);
                continue;
            }
            if !self.is_red(far) {
                w = self.delete_case_near_nephew(p, w, side);
            }
            self.delete_case_far_nephew(p, w, side);
            x = self.root;
            break;
        }
        if let Some(x) = x {
            self.node_mut(x).color = Color::Black;
        }
    }

    /// Turn a red sibling black by rotating it above the parent.
    fn delete_case_red_sibling(&mut self, p: NodeRef, w: NodeRef, side: Side) -> NodeRef {
        self.node_mut(w).color = Color::Black;
        self.node_mut(p).color = Color::Red;
        self.rotate(p, side);
        self.sibling_of_doubly_black(p, side)
    }

    /// Push the missing black one level up.
    fn delete_case_black_nephews(&mut self, w: NodeRef) {
        self.node_mut(w).color = Color::Red;
    }

    /// Rotate a red near nephew into the far position.
    fn delete_case_near_nephew(&mut self, p: NodeRef, w: NodeRef, side: Side) -> NodeRef {
        if let Some(near) = self.child(w, side) {
            self.node_mut(near).color = Color::Black;
        }
        self.node_mut(w).color = Color::Red;
        self.rotate(w, side.opposite());
        self.sibling_of_doubly_black(p, side)
    }

    fn delete_case_far_nephew(&mut self, p: NodeRef, w: NodeRef, side: Side) {
        let p_color = self.color(p);
        self.node_mut(w).color = p_color;
        self.node_mut(p).color = Color::Black;
        if let Some(far) = self.child(w, side.opposite()) {
            self.node_mut(far).color = Color::Black;
        }
        self.rotate(p, side);
    }

    // Structural helpers

    /// Rotate `x` down towards `side`; its child on the other side moves up.
    fn rotate(&mut self, x: NodeRef, side: Side) {
        let up = side.opposite();
        let y = match self.child(x, up) {
            Some(y) => y,
            None => panic!("rbtree: rotation around {:?} without a child to lift", x),
        };
        let inner = self.child(y, side);
        self.set_child(x, up, inner);
        if let Some(b) = inner {
            self.node_mut(b).parent = Some(x);
        }
        let xp = self.parent(x);
        self.node_mut(y).parent = xp;
        self.replace_child(xp, x, Some(y));
        self.set_child(y, side, Some(x));
        self.node_mut(x).parent = Some(y);
    }

    fn transplant(&mut self, u: NodeRef, v: Option<NodeRef>) {
        let up = self.parent(u);
        self.replace_child(up, u, v);
        if let Some(v) = v {
            self.node_mut(v).parent = up;
        }
    }

    fn replace_child(&mut self, parent: Option<NodeRef>, old: NodeRef, new: Option<NodeRef>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                if self.left(p) == Some(old) {
                    self.node_mut(p).left = new;
                } else {
                    self.node_mut(p).right = new;
                }
            }
        }
    }

    fn child(&self, n: NodeRef, side: Side) -> Option<NodeRef> {
        match side {
            Side::Left => self.left(n),
            Side::Right => self.right(n),
        }
    }

    fn set_child(&mut self, n: NodeRef, side: Side, child: Option<NodeRef>) {
        match side {
            Side::Left => self.node_mut(n).left = child,
            Side::Right => self.node_mut(n).right = child,
        }
    }

    fn side_of(&self, n: NodeRef, parent: NodeRef) -> Side {
        if self.left(parent) == Some(n) {
            Side::Left
        } else {
            Side::Right
        }
    }

    fn parent_of_red(&self, p: NodeRef) -> NodeRef {
        match self.parent(p) {
            Some(g) => g,
            None => panic!("rbtree: red node {:?} at the root", p),
        }
    }

    fn sibling_of_doubly_black(&self, p: NodeRef, side: Side) -> NodeRef {
        match self.child(p, side.opposite()) {
            Some(w) => w,
            None => panic!("rbtree: black-height deficit under {:?} without a sibling", p),
        }
    }

    fn is_red(&self, n: Option<NodeRef>) -> bool {
        n.map_or(false, |n| self.color(n) == Color::Red)
    }

    fn minimum(&self, mut n: NodeRef) -> NodeRef {
        while let Some(l) = self.left(n) {
            n = l;
        }
        n
    }

    fn maximum(&self, mut n: NodeRef) -> NodeRef {
        while let Some(r) = self.right(n) {
            n = r;
        }
        n
    }

    fn node(&self, n: NodeRef) -> &Node<K, V> {
        match self.nodes.get(n.0 as usize) {
            Some(Some(node)) => node,
            _ => panic!("rbtree: stale node reference {:?}", n),
        }
    }

    fn node_mut(&mut self, n: NodeRef) -> &mut Node<K, V> {
        match self.nodes.get_mut(n.0 as usize) {
            Some(Some(node)) => node,
            _ => panic!("rbtree: stale node reference {:?}", n),
        }
    }

    fn alloc(&mut self, node: Node<K, V>) -> NodeRef {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(node);
                NodeRef(idx)
            }
            None => {
                self.nodes.push(Some(node));
                NodeRef((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, n: NodeRef) -> Node<K, V> {
        match self.nodes.get_mut(n.0 as usize).and_then(Option::take) {
            Some(node) => {
                self.free.push(n.0);
                node
            }
            None => panic!("rbtree: double release of {:?}", n),
        }
    }
}

impl<K, V> Default for RbTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-order iterator over `(handle, key, value)`.
pub struct Iter<'a, K, V> {
    tree: &'a RbTree<K, V>,
    cursor: Option<NodeRef>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (NodeRef, &'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.cursor?;
        self.cursor = self.tree.next(n);
        let node = self.tree.node(n);
        Some((n, &node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Insert keeping equal keys in arrival order.
    fn insert_key(tree: &mut RbTree<u32, u32>, key: u32, tag: u32) -> NodeRef {
        let (parent, side) = tree.locate(|k, _| key < *k);
        tree.insert(parent, side, key, tag)
    }

    fn keys(tree: &RbTree<u32, u32>) -> Vec<u32> {
        tree.iter().map(|(_, k, _)| *k).collect()
    }

    #[test]
    fn rb_empty_tree_is_valid() {
        let tree: RbTree<u32, u32> = RbTree::new();
        assert_eq!(tree.validate(), Ok(0));
        assert!(tree.first().is_none());
        assert!(tree.is_empty());
    }

    #[test]
    fn rb_ascending_inserts_stay_balanced() {
        let mut tree = RbTree::new();
        for k in 0..1024 {
            insert_key(&mut tree, k, k);
            assert!(tree.validate().is_ok());
        }
        assert_eq!(keys(&tree), (0..1024).collect::<Vec<_>>());
        // Black height of a 1024-node red-black tree is bounded by log2(n+1).
        assert!(tree.validate().unwrap() <= 11);
    }

    #[test]
    fn rb_descending_inserts_stay_balanced() {
        let mut tree = RbTree::new();
        for k in (0..512).rev() {
            insert_key(&mut tree, k, k);
        }
        assert!(tree.validate().is_ok());
        assert_eq!(tree.key(tree.first().unwrap()), &0);
        assert_eq!(tree.key(tree.last().unwrap()), &511);
    }

    #[test]
    fn rb_equal_keys_keep_arrival_order() {
        let mut tree = RbTree::new();
        for tag in 0..10 {
            insert_key(&mut tree, 7, tag);
        }
        let tags: Vec<u32> = tree.iter().map(|(_, _, v)| *v).collect();
        assert_eq!(tags, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn rb_delete_returns_successor() {
        let mut tree = RbTree::new();
        let refs: Vec<NodeRef> = (0..16).map(|k| insert_key(&mut tree, k * 10, k)).collect();
        let d = tree.delete(refs[3]);
        assert_eq!(d.key, 30);
        assert_eq!(d.next.map(|n| *tree.key(n)), Some(40));
        let d = tree.delete(refs[15]);
        assert!(d.next.is_none());
        assert!(tree.validate().is_ok());
        assert!(!tree.contains(refs[3]));
    }

    #[test]
    fn rb_delete_keeps_other_handles_valid() {
        let mut tree = RbTree::new();
        let refs: Vec<NodeRef> = (0..64).map(|k| insert_key(&mut tree, k, k)).collect();
        // Deleting inner nodes relinks their successors instead of moving payloads.
        for r in refs.iter().step_by(3) {
            tree.delete(*r);
        }
        for (k, r) in refs.iter().enumerate() {
            if k % 3 != 0 {
                assert_eq!(*tree.value(*r), k as u32);
            }
        }
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn rb_delete_everything() {
        let mut tree = RbTree::new();
        let refs: Vec<NodeRef> = (0..200).map(|k| insert_key(&mut tree, (k * 37) % 200, k)).collect();
        for r in refs {
            tree.delete(r);
            assert!(tree.validate().is_ok());
        }
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
    }

    #[test]
    fn rb_replace_keeps_position() {
        let mut tree = RbTree::new();
        let refs: Vec<NodeRef> = (0..32).map(|k| insert_key(&mut tree, k * 2, k)).collect();
        let (n, old_key, old_value) = tree.replace(refs[10], 19, 99);
        assert_eq!((old_key, old_value), (20, 10));
        assert!(!tree.contains(refs[10]) || refs[10] == n);
        assert_eq!(tree.key(n), &19);
        assert_eq!(tree.prev(n).map(|p| *tree.key(p)), Some(18));
        assert_eq!(tree.next(n).map(|p| *tree.key(p)), Some(22));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn rb_prev_next_walk() {
        let mut tree = RbTree::new();
        for k in [5, 1, 9, 3, 7] {
            insert_key(&mut tree, k, k);
        }
        let mut back = Vec::new();
        let mut cursor = tree.last();
        while let Some(n) = cursor {
            back.push(*tree.key(n));
            cursor = tree.prev(n);
        }
        assert_eq!(back, vec![9, 7, 5, 3, 1]);
    }

    #[test]
    #[should_panic(expected = "RB_ATTACH_SLOT_FREE")]
    fn rb_insert_into_occupied_slot_is_a_bug() {
        let mut tree = RbTree::new();
        insert_key(&mut tree, 1, 1);
        tree.insert(None, Side::Left, 2, 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u16),
        DeleteNth(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => any::<u16>().prop_map(Op::Insert),
            2 => any::<usize>().prop_map(Op::DeleteNth),
        ]
    }

    proptest! {
        #[test]
        fn rb_matches_reference_map(ops in proptest::collection::vec(op_strategy(), 1..300)) {
            let mut tree = RbTree::new();
            // Reference: (key, arrival) -> handle
            let mut reference: BTreeMap<(u32, u32), NodeRef> = BTreeMap::new();
            let mut arrival = 0u32;
            for op in ops {
                match op {
                    Op::Insert(k) => {
                        let n = insert_key(&mut tree, k as u32, arrival);
                        reference.insert((k as u32, arrival), n);
                        arrival += 1;
                    }
                    Op::DeleteNth(i) => {
                        if reference.is_empty() {
                            continue;
                        }
                        let victim = *reference.keys().nth(i % reference.len()).unwrap();
                        let n = reference.remove(&victim).unwrap();
                        let expected_next = reference.range(victim..).next().map(|(_, n)| *n);
                        let d = tree.delete(n);
                        prop_assert_eq!((d.key, d.value), victim);
                        prop_assert_eq!(d.next, expected_next);
                    }
                }
                prop_assert!(tree.validate().is_ok());
            }
            let got: Vec<(u32, u32)> = tree.iter().map(|(_, k, v)| (*k, *v)).collect();
            let want: Vec<(u32, u32)> = reference.keys().copied().collect();
            prop_assert_eq!(got, want);
        }
    }
}
