//! Broadcast and reduction trees.
//!
//! For every block column a rank participates in, the plan builds one
//! *broadcast tree*: rooted at the diagonal process of that column, fanning
//! X[K] out to every process row that owns a block in the column. For every
//! block row a rank contributes to, one *reduction tree*: off-diagonal
//! contributors are the leaves, the diagonal process is the root, partial
//! sums flow upward.
//!
//! One structure serves all four uses (L/U x broadcast/reduce). A tree node
//! only knows its parent, its children and the payload size; the engines
//! treat it as an opaque forwarding capability. Shapes are k-ary over the
//! participant list in rank order (fanout 2 by default, a large fanout
//! yields a flat tree).

/// One rank's node in a broadcast or reduction tree.
#[derive(Debug, Clone)]
pub struct CommTree {
    /// Rank of the next hop toward the root; `None` on the root itself.
    parent: Option<usize>,
    /// Ranks of the immediate children.
    children: Vec<usize>,
    /// Payload words per right-hand side, excluding the header word.
    msg_size: usize,
}

impl CommTree {
    /// Build the tree node of `me` over `ranks` (root first), with the
    /// given fanout. Returns `None` when `me` does not participate or the
    /// tree has a single participant (nothing to forward).
    pub fn build(ranks: &[usize], me: usize, fanout: usize, msg_size: usize) -> Option<CommTree> {
        debug_assert!(fanout >= 1);
        if ranks.len() < 2 {
            return None;
        }
        let pos = ranks.iter().position(|&r| r == me)?;
        let parent = (pos > 0).then(|| ranks[(pos - 1) / fanout]);
        let first = pos * fanout + 1;
        let children = (first..(first + fanout).min(ranks.len()))
            .map(|i| ranks[i])
            .collect();
        Some(CommTree {
            parent,
            children,
            msg_size,
        })
    }

    /// Whether this node is the tree root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Rank of the parent node (reduction forwarding target).
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Immediate children (broadcast forwarding targets; reduction
    /// contributors).
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    /// Immediate destination count: children for a broadcast hop, one
    /// parent for a reduction hop.
    pub fn dest_count(&self) -> usize {
        self.children.len()
    }

    /// Payload words per right-hand side, excluding the header.
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_participant_no_tree() {
        assert!(CommTree::build(&[4], 4, 2, 8).is_none());
    }

    #[test]
    fn test_non_participant() {
        assert!(CommTree::build(&[0, 2], 1, 2, 8).is_none());
    }

    #[test]
    fn test_binary_tree_shape() {
        // ranks in tree order: 5 (root), 1, 3, 7, 9
        let ranks = [5, 1, 3, 7, 9];
        let root = CommTree::build(&ranks, 5, 2, 4).unwrap();
        assert!(root.is_root());
        assert_eq!(root.children(), &[1, 3]);

        let n1 = CommTree::build(&ranks, 1, 2, 4).unwrap();
        assert_eq!(n1.parent(), Some(5));
        assert_eq!(n1.children(), &[7, 9]);

        let n9 = CommTree::build(&ranks, 9, 2, 4).unwrap();
        assert_eq!(n9.parent(), Some(1));
        assert!(n9.children().is_empty());
    }

    #[test]
    fn test_flat_tree() {
        let ranks = [0, 1, 2, 3];
        let root = CommTree::build(&ranks, 0, 16, 4).unwrap();
        assert_eq!(root.children(), &[1, 2, 3]);
        for &r in &ranks[1..] {
            let node = CommTree::build(&ranks, r, 16, 4).unwrap();
            assert_eq!(node.parent(), Some(0));
            assert!(node.children().is_empty());
        }
    }

    #[test]
    fn test_every_rank_reached_once() {
        // For several shapes, each non-root participant has exactly one
        // parent and the edge sets agree.
        for fanout in 1..=4 {
            let ranks: Vec<usize> = (0..7).collect();
            let mut reached = vec![0usize; ranks.len()];
            for &r in &ranks {
                let node = CommTree::build(&ranks, r, fanout, 1).unwrap();
                for &c in node.children() {
                    reached[c] += 1;
                    let child = CommTree::build(&ranks, c, fanout, 1).unwrap();
                    assert_eq!(child.parent(), Some(r));
                }
            }
            assert_eq!(reached[0], 0);
            assert!(reached[1..].iter().all(|&c| c == 1));
        }
    }
}
