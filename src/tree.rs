//! Size-indexed free tree.
//!
//! Free blocks are kept in an AVL tree keyed by their payload size so the
//! allocator can answer "smallest free block of at least `n` bytes" in
//! O(log n). The tree never allocates anything itself: every node lives
//! inside the payload of the free block it describes, and the allocator
//! hands us a pointer to that storage. This is the same intrusive idea
//! the block headers use, written into memory we already own.
//!
//! ```text
//!              +--------+
//!              | 4096   |
//!              +--------+
//!             /          \
//!     +--------+        +--------+      +--------+      +--------+
//!     | 1024   |        | 16384  | <--> | 16384  | <--> | 16384  |
//!     +--------+        +--------+      +--------+      +--------+
//!                          tree            chain           chain
//! ```
//!
//! Equal sizes are common (think of a client allocating the same struct
//! over and over), so duplicates don't become tree nodes at all. The one
//! resident node of a given size carries a doubly linked chain of its
//! twins; adding or removing a twin is O(1) and never rebalances.
//!
//! The implementation is iterative. Walking back up after an insert or a
//! delete uses the parent link and the child index stored in every node,
//! so no recursion stack is needed anywhere.

use std::ptr::NonNull;

/// Optional non-null pointer to a tree node.
pub(crate) type Link = Option<NonNull<TreeNode>>;

/// Maps the child index a height change came from to the balance delta it
/// causes at the parent: growth of the left subtree (index 0) tilts the
/// balance towards -1, growth of the right subtree towards +1.
const CHILD2BALANCE: [i8; 2] = [-1, 1];

/// Maps a balance factor (shifted by +1) to the index of the taller
/// child. Balanced nodes report the left child.
const BALANCE2CHILD: [usize; 3] = [0, 0, 1];

/// A node of the free tree, embedded in the payload of a free block.
///
/// Children are a two element array instead of named left/right fields so
/// that the balancing code can be written once and run in both directions
/// by flipping an index. `parent` is a plain back-reference and `which`
/// records which slot of the parent we occupy, which is what makes the
/// upward walks possible without a stack.
#[derive(Clone, Copy)]
pub(crate) struct TreeNode {
    /// Child links, `children[0]` holds smaller keys.
    pub children: [Link; 2],
    /// Back-reference to the parent node, `None` at the root.
    pub parent: Link,
    /// Index of this node within `parent.children`.
    pub which: usize,
    /// Height difference `right - left` of the subtrees, always in
    /// {-1, 0, 1} between operations.
    pub balance: i8,
    /// Key this node is sorted by: the payload size of its block.
    pub key: usize,
    /// Previous node in the same-size chain, `None` for the chain head.
    pub prev: Link,
    /// Next node in the same-size chain.
    pub next: Link,
}

impl TreeNode {
    /// A detached node. Every field is overwritten by [`Tree::insert`],
    /// this just gives the payload bytes a defined starting state.
    pub fn new() -> Self {
        Self {
            children: [None, None],
            parent: None,
            which: 0,
            balance: 0,
            key: 0,
            prev: None,
            next: None,
        }
    }
}

/// Outcome of a key search: either the resident node with that exact key,
/// or the leaf position where a node with that key would be attached.
/// `Miss(None)` means the tree is empty and the new node becomes the root.
enum Search {
    Found(NonNull<TreeNode>),
    Miss(Option<(NonNull<TreeNode>, usize)>),
}

/// The free tree itself. Owns no memory, only the root link; all nodes
/// live inside free blocks.
pub(crate) struct Tree {
    root: Link,
}

impl Tree {
    pub const fn new() -> Self {
        Self { root: None }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Binary search for `key`, remembering the insertion point as we
    /// descend in case the key is not present.
    fn search(&self, key: usize) -> Search {
        let mut slot = None;
        let mut current = self.root;

        while let Some(node) = current {
            let node_key = unsafe { node.as_ref().key };

            if node_key == key {
                return Search::Found(node);
            }

            let which = usize::from(key > node_key);
            slot = Some((node, which));
            current = unsafe { node.as_ref().children[which] };
        }

        Search::Miss(slot)
    }

    /// Links `node` into the tree under key `key`.
    ///
    /// If a node with this exact key is already resident, `node` is
    /// appended to its duplicate chain in O(1) and the tree shape does not
    /// change. Otherwise `node` becomes a leaf and the balance factors of
    /// its ancestors are adjusted, performing at most one rotation.
    ///
    /// # Safety
    ///
    /// `node` must point to writable storage that stays valid until the
    /// node is removed, and must not currently be linked into the tree.
    pub unsafe fn insert(&mut self, mut node: NonNull<TreeNode>, key: usize) {
        unsafe {
            node.as_mut().key = key;

            match self.search(key) {
                Search::Found(mut head) => {
                    // Same size already resident: hang off its chain,
                    // right after the head.
                    node.as_mut().next = head.as_ref().next;
                    node.as_mut().prev = Some(head);
                    if let Some(mut next) = head.as_ref().next {
                        next.as_mut().prev = Some(node);
                    }
                    head.as_mut().next = Some(node);
                }
                Search::Miss(slot) => {
                    node.as_mut().next = None;
                    node.as_mut().prev = None;
                    self.attach(node, slot);
                }
            }
        }
    }

    /// Attaches `node` as a new leaf at `slot` and restores the AVL
    /// balance on the way back to the root.
    unsafe fn attach(&mut self, mut node: NonNull<TreeNode>, slot: Option<(NonNull<TreeNode>, usize)>) {
        unsafe {
            node.as_mut().children = [None, None];
            node.as_mut().balance = 0;

            let (mut parent, mut which) = match slot {
                Some(slot) => slot,
                None => {
                    debug_assert!(self.root.is_none());
                    node.as_mut().parent = None;
                    node.as_mut().which = 0;
                    self.root = Some(node);
                    return;
                }
            };

            node.as_mut().parent = Some(parent);
            node.as_mut().which = which;
            debug_assert!(parent.as_ref().children[which].is_none());
            parent.as_mut().children[which] = Some(node);

            // Walk up adjusting balances. A subtree that reaches perfect
            // balance absorbed the height change, so the walk stops. A
            // subtree tipping to +-2 needs one rotation, after which the
            // whole tree has its original height and we are also done.
            loop {
                let mut current = parent;
                let old_balance = current.as_ref().balance;
                let new_balance = old_balance + CHILD2BALANCE[which];

                if new_balance == 0 {
                    current.as_mut().balance = 0;
                    return;
                }

                if old_balance != 0 {
                    self.rotate(current, new_balance);
                    return;
                }

                current.as_mut().balance = new_balance;
                which = current.as_ref().which;
                match current.as_ref().parent {
                    Some(next) => parent = next,
                    None => return,
                }
            }
        }
    }

    /// Restores balance at `node`, whose new balance is +-2. Handles both
    /// directions through index arithmetic and both the single rotation
    /// (heavy child tilted the same way, or even) and the double rotation
    /// (heavy child tilted the opposite way).
    ///
    /// Returns `true` if the subtree ended up one level shorter, which is
    /// what deletion's ancestor walk needs to know to keep climbing.
    unsafe fn rotate(&mut self, mut node: NonNull<TreeNode>, balance: i8) -> bool {
        unsafe {
            // `heavy` is the index of the taller child. The code below is
            // written as if it were the left side; with `heavy == 1` the
            // same statements perform the mirrored rotation.
            let heavy = usize::from(balance > 0);
            let other = 1 - heavy;
            let heavy_bal: i8 = balance / 2;
            let other_bal = -heavy_bal;

            let parent = node.as_ref().parent;
            let which = node.as_ref().which;
            let mut child = node.as_ref().children[heavy].unwrap();
            let mut child_bal = child.as_ref().balance;

            // Single rotation: the child leans the same way as the node,
            // or is even. The child takes the node's place and the node
            // becomes its `other`-side child.
            //
            //        node(-2)                child(0 | +1)
            //        /      \                /         \
            //    child(-1|0)        =>             node(0 | -1)
            //      /   \                            /
            //           cross                   cross
            if child_bal != other_bal {
                // If the child was tilted, the subtree lost a level.
                child_bal += other_bal;

                let cross = child.as_ref().children[other];
                node.as_mut().children[heavy] = cross;
                if let Some(mut cross) = cross {
                    cross.as_mut().parent = Some(node);
                    cross.as_mut().which = heavy;
                }

                child.as_mut().children[other] = Some(node);
                node.as_mut().balance = -child_bal;
                node.as_mut().which = other;
                node.as_mut().parent = Some(child);

                child.as_mut().balance = child_bal;
                child.as_mut().which = which;
                child.as_mut().parent = parent;
                match parent {
                    Some(mut parent) => parent.as_mut().children[which] = Some(child),
                    None => self.root = Some(child),
                }

                return child_bal == 0;
            }

            // Double rotation: the grandchild between node and child is
            // promoted above both of them.
            //
            //        node(-2)
            //        /                        gchild(0)
            //    child(+1)          =>        /      \
            //        \                    child      node
            //       gchild
            let mut gchild = child.as_ref().children[other].unwrap();
            let gheavy = gchild.as_ref().children[heavy];
            let gother = gchild.as_ref().children[other];

            node.as_mut().children[heavy] = gother;
            if let Some(mut gother) = gother {
                gother.as_mut().parent = Some(node);
                gother.as_mut().which = heavy;
            }

            child.as_mut().children[other] = gheavy;
            if let Some(mut gheavy) = gheavy {
                gheavy.as_mut().parent = Some(child);
                gheavy.as_mut().which = other;
            }

            let gchild_bal = gchild.as_ref().balance;

            gchild.as_mut().children[heavy] = Some(child);
            child.as_mut().balance = if gchild_bal == other_bal { heavy_bal } else { 0 };
            child.as_mut().parent = Some(gchild);
            child.as_mut().which = heavy;

            gchild.as_mut().children[other] = Some(node);
            node.as_mut().balance = if gchild_bal == heavy_bal { other_bal } else { 0 };
            node.as_mut().parent = Some(gchild);
            node.as_mut().which = other;

            gchild.as_mut().balance = 0;
            gchild.as_mut().parent = parent;
            gchild.as_mut().which = which;
            match parent {
                Some(mut parent) => parent.as_mut().children[which] = Some(gchild),
                None => self.root = Some(gchild),
            }

            // The double rotation always shortens the subtree.
            true
        }
    }

    /// Unlinks `node` from the tree.
    ///
    /// Chain members leave in O(1) without touching the tree shape. A
    /// chain head with duplicates promotes its first twin into its slot,
    /// again without rebalancing. Only a node with no twins goes through
    /// actual AVL deletion.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into this tree (as a resident node
    /// or a chain member).
    pub unsafe fn remove(&mut self, delete: NonNull<TreeNode>) {
        unsafe {
            // Chain member: unlink from the doubly linked list.
            if let Some(mut prev) = delete.as_ref().prev {
                prev.as_mut().next = delete.as_ref().next;
                if let Some(mut next) = delete.as_ref().next {
                    next.as_mut().prev = Some(prev);
                }
                return;
            }

            // Chain head with twins: the first twin inherits the head's
            // position in the tree. Same key, so ordering and balance are
            // untouched.
            if let Some(mut node) = delete.as_ref().next {
                node.as_mut().children = delete.as_ref().children;
                node.as_mut().parent = delete.as_ref().parent;
                node.as_mut().which = delete.as_ref().which;
                node.as_mut().balance = delete.as_ref().balance;
                node.as_mut().prev = None;

                if let Some(mut child) = node.as_ref().children[0] {
                    child.as_mut().parent = Some(node);
                }
                if let Some(mut child) = node.as_ref().children[1] {
                    child.as_mut().parent = Some(node);
                }
                match node.as_ref().parent {
                    Some(mut parent) => {
                        parent.as_mut().children[node.as_ref().which] = Some(node)
                    }
                    None => self.root = Some(node),
                }
                return;
            }

            self.delete_node(delete);
        }
    }

    /// Full AVL deletion of a node that owns no duplicate chain.
    unsafe fn delete_node(&mut self, mut delete: NonNull<TreeNode>) {
        unsafe {
            // Placeholder storage used while a two-child node swaps places
            // with its in-order neighbor. It is spliced out again before
            // this function returns, so the pointer never escapes.
            let mut tmp = std::mem::MaybeUninit::<TreeNode>::uninit();

            // A node with two children first trades places with an
            // in-order neighbor, which has at most one child and is
            // therefore easy to remove. The neighbor is taken from the
            // taller side to keep the number of rotations down.
            if delete.as_ref().children[0].is_some() && delete.as_ref().children[1].is_some() {
                let taller = BALANCE2CHILD[(delete.as_ref().balance + 1) as usize];
                let other = 1 - taller;

                // Down one level on the taller side, then as far as
                // possible towards `delete`'s key.
                let mut node = delete.as_ref().children[taller].unwrap();
                while let Some(next) = node.as_ref().children[other] {
                    node = next;
                }

                tmp.write(*node.as_ref());
                let tmp_ptr = NonNull::new_unchecked(tmp.as_mut_ptr());

                // Move the neighbor into delete's position.
                node.as_mut().children = delete.as_ref().children;
                node.as_mut().parent = delete.as_ref().parent;
                node.as_mut().which = delete.as_ref().which;
                node.as_mut().balance = delete.as_ref().balance;

                // The neighbor may have been delete's direct child, in
                // which case it would now point at itself; the placeholder
                // takes that slot.
                if node.as_ref().children[taller] == Some(node) {
                    node.as_mut().children[taller] = Some(tmp_ptr);
                }

                match node.as_ref().parent {
                    Some(mut parent) => {
                        parent.as_mut().children[node.as_ref().which] = Some(node)
                    }
                    None => self.root = Some(node),
                }
                node.as_ref().children[taller].unwrap().as_mut().parent = Some(node);
                node.as_ref().children[other].unwrap().as_mut().parent = Some(node);

                // The placeholder sits where the neighbor used to be. It
                // always has a parent and at most one child.
                delete = tmp_ptr;
                let mut parent = delete.as_ref().parent.unwrap();
                parent.as_mut().children[delete.as_ref().which] = Some(delete);
                let which = usize::from(delete.as_ref().children[1].is_some());
                if let Some(mut child) = delete.as_ref().children[which] {
                    child.as_mut().parent = Some(delete);
                }
            }

            // `delete` now has at most one child: splice that child into
            // the parent.
            let mut parent = delete.as_ref().parent;
            let mut which = delete.as_ref().which;
            let child = delete.as_ref().children[0].or(delete.as_ref().children[1]);

            if let Some(mut child) = child {
                child.as_mut().parent = parent;
                child.as_mut().which = which;
            }
            let Some(mut current) = parent else {
                self.root = child;
                return;
            };
            current.as_mut().children[which] = child;

            // The subtree is one level shorter; climb towards the root
            // fixing balances and rotating where needed.
            loop {
                let mut node = current;
                let old_balance = node.as_ref().balance;
                let new_balance = old_balance - CHILD2BALANCE[which];
                parent = node.as_ref().parent;
                which = node.as_ref().which;

                // A perfectly balanced node tips but keeps its height, so
                // nothing above it can change.
                if old_balance == 0 {
                    node.as_mut().balance = new_balance;
                    break;
                }

                if new_balance == 0 {
                    node.as_mut().balance = 0;
                } else if !self.rotate(node, new_balance) {
                    // Rotation kept the subtree height: done climbing.
                    break;
                }

                match parent {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
    }

    /// Best-fit lookup: the node with the smallest key that is `>= key`,
    /// or `None` if every free block is too small.
    ///
    /// When the winning node owns a duplicate chain, its first twin is
    /// returned instead of the head. All same-size blocks are
    /// interchangeable and removing a twin is O(1), while removing the
    /// resident head would restructure the tree.
    pub fn find_best(&self, key: usize) -> Link {
        let mut best = None;
        let mut current = self.root;

        while let Some(node) = current {
            let node_key = unsafe { node.as_ref().key };

            if node_key == key {
                best = Some(node);
                break;
            }

            if node_key < key {
                current = unsafe { node.as_ref().children[1] };
            } else {
                best = Some(node);
                current = unsafe { node.as_ref().children[0] };
            }
        }

        let node = best?;
        unsafe { Some(node.as_ref().next.unwrap_or(node)) }
    }

    /// In-order traversal for diagnostics: ascending key order, each
    /// resident node immediately followed by its chain. `chained` tells
    /// the visitor which of the two it is looking at. Iterative via the
    /// parent links; must not mutate the tree.
    ///
    /// # Safety
    ///
    /// All linked nodes must still point to valid storage.
    pub unsafe fn walk(&self, mut visit: impl FnMut(NonNull<TreeNode>, bool)) {
        unsafe {
            let mut current = self.root.map(|root| Self::leftmost(root));

            while let Some(node) = current {
                visit(node, false);

                let mut twin = node.as_ref().next;
                while let Some(chained) = twin {
                    visit(chained, true);
                    twin = chained.as_ref().next;
                }

                current = Self::successor(node);
            }
        }
    }

    unsafe fn leftmost(mut node: NonNull<TreeNode>) -> NonNull<TreeNode> {
        unsafe {
            while let Some(left) = node.as_ref().children[0] {
                node = left;
            }
            node
        }
    }

    /// In-order successor through the parent links: either the leftmost
    /// node of the right subtree, or the first ancestor we hang off the
    /// left side of.
    unsafe fn successor(node: NonNull<TreeNode>) -> Link {
        unsafe {
            if let Some(right) = node.as_ref().children[1] {
                return Some(Self::leftmost(right));
            }

            let mut current = node;
            loop {
                let parent = current.as_ref().parent?;
                if current.as_ref().which == 0 {
                    return Some(parent);
                }
                current = parent;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tree nodes normally live inside free blocks; for these tests leaked
    /// boxes are just as good a home.
    fn node() -> NonNull<TreeNode> {
        NonNull::from(Box::leak(Box::new(TreeNode::new())))
    }

    fn insert_keys(tree: &mut Tree, keys: &[usize]) -> Vec<NonNull<TreeNode>> {
        keys.iter()
            .map(|&key| {
                let n = node();
                unsafe { tree.insert(n, key) };
                n
            })
            .collect()
    }

    /// Recomputes subtree heights and checks every stored balance factor
    /// and every parent/child-index back-reference against reality.
    fn audit(link: Link) -> i32 {
        let Some(node) = link else { return 0 };

        unsafe {
            let left = audit(node.as_ref().children[0]);
            let right = audit(node.as_ref().children[1]);

            assert!((right - left).abs() <= 1, "subtree out of balance");
            assert_eq!(i32::from(node.as_ref().balance), right - left);

            for (index, child) in node.as_ref().children.iter().enumerate() {
                if let Some(child) = child {
                    assert_eq!(child.as_ref().parent, Some(node));
                    assert_eq!(child.as_ref().which, index);
                }
            }

            1 + left.max(right)
        }
    }

    fn collect(tree: &Tree) -> Vec<(usize, bool)> {
        let mut out = Vec::new();
        unsafe {
            tree.walk(|node, chained| out.push((node.as_ref().key, chained)));
        }
        out
    }

    fn root_of(tree: &Tree) -> Link {
        tree.root
    }

    #[test]
    fn empty_tree() {
        let tree = Tree::new();

        assert!(tree.is_empty());
        assert!(tree.find_best(0).is_none());
        assert!(collect(&tree).is_empty());
    }

    #[test]
    fn insert_keeps_order_and_balance() {
        let mut tree = Tree::new();

        // Ascending insertion is the classic worst case for an unbalanced
        // BST; the rotations must keep the height logarithmic.
        insert_keys(&mut tree, &(1..=64).map(|k| k * 8).collect::<Vec<_>>());

        let height = audit(root_of(&tree));
        assert!(height <= 7, "height {height} for 64 nodes");

        let keys: Vec<usize> = collect(&tree).iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (1..=64).map(|k| k * 8).collect::<Vec<_>>());
    }

    #[test]
    fn find_best_exact_and_ceiling() {
        let mut tree = Tree::new();
        insert_keys(&mut tree, &[512, 64, 4096, 32, 128, 1024]);

        unsafe {
            assert_eq!(tree.find_best(128).unwrap().as_ref().key, 128);
            assert_eq!(tree.find_best(129).unwrap().as_ref().key, 512);
            assert_eq!(tree.find_best(1).unwrap().as_ref().key, 32);
            assert_eq!(tree.find_best(4096).unwrap().as_ref().key, 4096);
            assert!(tree.find_best(4097).is_none());
        }
    }

    #[test]
    fn duplicates_chain_off_the_resident_node() {
        let mut tree = Tree::new();
        let nodes = insert_keys(&mut tree, &[256, 100, 100, 100, 300]);

        // Only three keys participate in tree structure.
        audit(root_of(&tree));
        assert_eq!(
            collect(&tree),
            vec![(100, false), (100, true), (100, true), (256, false), (300, false)]
        );

        // Best fit hands out a twin and leaves the head resident.
        let best = tree.find_best(100).unwrap();
        assert_ne!(best, nodes[1]);
        unsafe {
            assert_eq!(best.as_ref().key, 100);
            assert!(best.as_ref().prev.is_some());
        }

        // Removing the twin is pure list surgery.
        unsafe { tree.remove(best) };
        audit(root_of(&tree));
        assert_eq!(
            collect(&tree),
            vec![(100, false), (100, true), (256, false), (300, false)]
        );
    }

    #[test]
    fn removing_chain_head_promotes_twin() {
        let mut tree = Tree::new();
        let nodes = insert_keys(&mut tree, &[256, 100, 100, 300]);

        // nodes[1] is the resident head for key 100.
        unsafe { tree.remove(nodes[1]) };

        audit(root_of(&tree));
        assert_eq!(collect(&tree), vec![(100, false), (256, false), (300, false)]);

        // The promoted twin must be findable and removable as usual.
        let found = tree.find_best(100).unwrap();
        assert_eq!(found, nodes[2]);
        unsafe { tree.remove(found) };
        assert_eq!(collect(&tree), vec![(256, false), (300, false)]);
    }

    #[test]
    fn remove_leaf_interior_and_root() {
        let mut tree = Tree::new();
        let keys: Vec<usize> = vec![50, 30, 70, 20, 40, 60, 80, 10];
        let nodes = insert_keys(&mut tree, &keys);

        // Leaf.
        unsafe { tree.remove(nodes[7]) }; // 10
        audit(root_of(&tree));

        // Interior node with two children.
        unsafe { tree.remove(nodes[1]) }; // 30
        audit(root_of(&tree));

        // Root.
        unsafe { tree.remove(nodes[0]) }; // 50
        audit(root_of(&tree));

        let remaining: Vec<usize> = collect(&tree).iter().map(|(k, _)| *k).collect();
        assert_eq!(remaining, vec![20, 40, 60, 70, 80]);
    }

    #[test]
    fn scrambled_insert_remove_leaves_empty_tree() {
        let mut tree = Tree::new();

        // Two different multiplicative orderings over the same key set.
        let count = 200;
        let keys: Vec<usize> = (0..count).map(|i| (i * 37) % count + 1).collect();
        let nodes = insert_keys(&mut tree, &keys);
        audit(root_of(&tree));

        for i in 0..count {
            unsafe { tree.remove(nodes[(i * 73) % count]) };
            audit(root_of(&tree));
        }

        assert!(tree.is_empty());
    }

    #[test]
    fn remove_every_other_then_reinsert() {
        let mut tree = Tree::new();
        let keys: Vec<usize> = (1..=100).collect();
        let nodes = insert_keys(&mut tree, &keys);

        for chunk in nodes.chunks(2) {
            unsafe { tree.remove(chunk[0]) };
            audit(root_of(&tree));
        }

        let survivors: Vec<usize> = collect(&tree).iter().map(|(k, _)| *k).collect();
        assert_eq!(survivors, (1..=100).filter(|k| k % 2 == 0).collect::<Vec<_>>());

        insert_keys(&mut tree, &(1..=100).filter(|k| k % 2 == 1).collect::<Vec<_>>());
        audit(root_of(&tree));
        let all: Vec<usize> = collect(&tree).iter().map(|(k, _)| *k).collect();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());
    }
}
