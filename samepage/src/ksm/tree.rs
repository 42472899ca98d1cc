// SPDX-License-Identifier: MPL-2.0

//! Red-black tree primitives over arena handles.
//!
//! The twin trees are keyed by page *contents*, which only the engine can
//! fetch and compare (and which may rot mid-walk in the unstable tree), so
//! this module does no comparisons at all: callers descend themselves and
//! hand the chosen link position to [`insert`]. Nodes live in the caller's
//! arena; the tree stores nothing but link fields inside them.

use super::rmap::RmapRef;

/// Node colour.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Color {
    Red,
    Black,
}

/// Link storage embedded in every potential tree node.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TreeLinks {
    parent: Option<RmapRef>,
    left: Option<RmapRef>,
    right: Option<RmapRef>,
    color: Color,
}

impl Default for TreeLinks {
    fn default() -> Self {
        TreeLinks {
            parent: None,
            left: None,
            right: None,
            color: Color::Red,
        }
    }
}

impl TreeLinks {
    pub(crate) fn left(&self) -> Option<RmapRef> {
        self.left
    }

    pub(crate) fn right(&self) -> Option<RmapRef> {
        self.right
    }
}

/// Access to the link fields of nodes addressed by handle.
pub(crate) trait Nodes {
    fn links(&self, h: RmapRef) -> &TreeLinks;
    fn links_mut(&mut self, h: RmapRef) -> &mut TreeLinks;
}

/// Which child slot of the parent a new node hangs off.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Side {
    Left,
    Right,
}

fn color<S: Nodes>(s: &S, h: Option<RmapRef>) -> Color {
    h.map_or(Color::Black, |h| s.links(h).color)
}

fn rotate_left<S: Nodes>(s: &mut S, root: &mut Option<RmapRef>, x: RmapRef) {
    let y = s.links(x).right.expect("left rotation without right child");
    let y_left = s.links(y).left;

    s.links_mut(x).right = y_left;
    if let Some(yl) = y_left {
        s.links_mut(yl).parent = Some(x);
    }

    let xp = s.links(x).parent;
    s.links_mut(y).parent = xp;
    match xp {
        None => *root = Some(y),
        Some(p) => {
            if s.links(p).left == Some(x) {
                s.links_mut(p).left = Some(y);
            } else {
                s.links_mut(p).right = Some(y);
            }
        }
    }

    s.links_mut(y).left = Some(x);
    s.links_mut(x).parent = Some(y);
}

fn rotate_right<S: Nodes>(s: &mut S, root: &mut Option<RmapRef>, x: RmapRef) {
    let y = s.links(x).left.expect("right rotation without left child");
    let y_right = s.links(y).right;

    s.links_mut(x).left = y_right;
    if let Some(yr) = y_right {
        s.links_mut(yr).parent = Some(x);
    }

    let xp = s.links(x).parent;
    s.links_mut(y).parent = xp;
    match xp {
        None => *root = Some(y),
        Some(p) => {
            if s.links(p).left == Some(x) {
                s.links_mut(p).left = Some(y);
            } else {
                s.links_mut(p).right = Some(y);
            }
        }
    }

    s.links_mut(y).right = Some(x);
    s.links_mut(x).parent = Some(y);
}

/// Links `node` as a leaf below `parent` on `side` (below the root when
/// `parent` is `None`) and rebalances.
pub(crate) fn insert<S: Nodes>(
    s: &mut S,
    root: &mut Option<RmapRef>,
    parent: Option<RmapRef>,
    side: Side,
    node: RmapRef,
) {
    *s.links_mut(node) = TreeLinks {
        parent,
        left: None,
        right: None,
        color: Color::Red,
    };
    match parent {
        None => {
            debug_assert!(root.is_none());
            *root = Some(node);
        }
        Some(p) => match side {
            Side::Left => {
                debug_assert!(s.links(p).left.is_none());
                s.links_mut(p).left = Some(node);
            }
            Side::Right => {
                debug_assert!(s.links(p).right.is_none());
                s.links_mut(p).right = Some(node);
            }
        },
    }

    // Classic bottom-up recolouring.
    let mut z = node;
    loop {
        let Some(p) = s.links(z).parent else { break };
        if s.links(p).color == Color::Black {
            break;
        }
        // A red parent is never the root, so the grandparent exists.
        let gp = s.links(p).parent.expect("red root");
        if s.links(gp).left == Some(p) {
            let uncle = s.links(gp).right;
            if color(s, uncle) == Color::Red {
                s.links_mut(p).color = Color::Black;
                s.links_mut(uncle.unwrap()).color = Color::Black;
                s.links_mut(gp).color = Color::Red;
                z = gp;
            } else {
                if s.links(p).right == Some(z) {
                    z = p;
                    rotate_left(s, root, z);
                }
                let p = s.links(z).parent.expect("rotated leaf lost its parent");
                let gp = s.links(p).parent.expect("red root");
                s.links_mut(p).color = Color::Black;
                s.links_mut(gp).color = Color::Red;
                rotate_right(s, root, gp);
            }
        } else {
            let uncle = s.links(gp).left;
            if color(s, uncle) == Color::Red {
                s.links_mut(p).color = Color::Black;
                s.links_mut(uncle.unwrap()).color = Color::Black;
                s.links_mut(gp).color = Color::Red;
                z = gp;
            } else {
                if s.links(p).left == Some(z) {
                    z = p;
                    rotate_right(s, root, z);
                }
                let p = s.links(z).parent.expect("rotated leaf lost its parent");
                let gp = s.links(p).parent.expect("red root");
                s.links_mut(p).color = Color::Black;
                s.links_mut(gp).color = Color::Red;
                rotate_left(s, root, gp);
            }
        }
    }
    let r = root.expect("insert left the tree empty");
    s.links_mut(r).color = Color::Black;
}

fn transplant<S: Nodes>(
    s: &mut S,
    root: &mut Option<RmapRef>,
    u: RmapRef,
    v: Option<RmapRef>,
) {
    let up = s.links(u).parent;
    match up {
        None => *root = v,
        Some(p) => {
            if s.links(p).left == Some(u) {
                s.links_mut(p).left = v;
            } else {
                s.links_mut(p).right = v;
            }
        }
    }
    if let Some(v) = v {
        s.links_mut(v).parent = up;
    }
}

fn minimum<S: Nodes>(s: &S, mut h: RmapRef) -> RmapRef {
    while let Some(l) = s.links(h).left {
        h = l;
    }
    h
}

/// Unlinks `z` from the tree and rebalances. `z`'s links are scrubbed.
pub(crate) fn erase<S: Nodes>(s: &mut S, root: &mut Option<RmapRef>, z: RmapRef) {
    let z_left = s.links(z).left;
    let z_right = s.links(z).right;

    let removed_color;
    let x;
    let x_parent;

    match (z_left, z_right) {
        (None, _) => {
            removed_color = s.links(z).color;
            x = z_right;
            x_parent = s.links(z).parent;
            transplant(s, root, z, z_right);
        }
        (Some(zl), None) => {
            removed_color = s.links(z).color;
            x = Some(zl);
            x_parent = s.links(z).parent;
            transplant(s, root, z, Some(zl));
        }
        (Some(zl), Some(zr)) => {
            // Splice z's in-order successor into z's place.
            let y = minimum(s, zr);
            removed_color = s.links(y).color;
            x = s.links(y).right;
            if s.links(y).parent == Some(z) {
                x_parent = Some(y);
            } else {
                x_parent = s.links(y).parent;
                let y_right = s.links(y).right;
                transplant(s, root, y, y_right);
                s.links_mut(y).right = Some(zr);
                s.links_mut(zr).parent = Some(y);
            }
            transplant(s, root, z, Some(y));
            s.links_mut(y).left = Some(zl);
            s.links_mut(zl).parent = Some(y);
            let z_color = s.links(z).color;
            s.links_mut(y).color = z_color;
        }
    }

    if removed_color == Color::Black {
        erase_fixup(s, root, x, x_parent);
    }
    *s.links_mut(z) = TreeLinks::default();
}

fn erase_fixup<S: Nodes>(
    s: &mut S,
    root: &mut Option<RmapRef>,
    mut x: Option<RmapRef>,
    mut x_parent: Option<RmapRef>,
) {
    while x != *root && color(s, x) == Color::Black {
        let Some(p) = x_parent else { break };
        if s.links(p).left == x {
            // The doubled-black side always has a live sibling.
            let mut w = s.links(p).right.expect("black-height violation");
            if s.links(w).color == Color::Red {
                s.links_mut(w).color = Color::Black;
                s.links_mut(p).color = Color::Red;
                rotate_left(s, root, p);
                w = s.links(p).right.expect("black-height violation");
            }
            if color(s, s.links(w).left) == Color::Black
                && color(s, s.links(w).right) == Color::Black
            {
                s.links_mut(w).color = Color::Red;
                x = Some(p);
                x_parent = s.links(p).parent;
            } else {
                if color(s, s.links(w).right) == Color::Black {
                    let wl = s.links(w).left.expect("red child vanished");
                    s.links_mut(wl).color = Color::Black;
                    s.links_mut(w).color = Color::Red;
                    rotate_right(s, root, w);
                    w = s.links(p).right.expect("black-height violation");
                }
                let p_color = s.links(p).color;
                s.links_mut(w).color = p_color;
                s.links_mut(p).color = Color::Black;
                if let Some(wr) = s.links(w).right {
                    s.links_mut(wr).color = Color::Black;
                }
                rotate_left(s, root, p);
                x = *root;
                x_parent = None;
            }
        } else {
            let mut w = s.links(p).left.expect("black-height violation");
            if s.links(w).color == Color::Red {
                s.links_mut(w).color = Color::Black;
                s.links_mut(p).color = Color::Red;
                rotate_right(s, root, p);
                w = s.links(p).left.expect("black-height violation");
            }
            if color(s, s.links(w).left) == Color::Black
                && color(s, s.links(w).right) == Color::Black
            {
                s.links_mut(w).color = Color::Red;
                x = Some(p);
                x_parent = s.links(p).parent;
            } else {
                if color(s, s.links(w).left) == Color::Black {
                    let wr = s.links(w).right.expect("red child vanished");
                    s.links_mut(wr).color = Color::Black;
                    s.links_mut(w).color = Color::Red;
                    rotate_left(s, root, w);
                    w = s.links(p).left.expect("black-height violation");
                }
                let p_color = s.links(p).color;
                s.links_mut(w).color = p_color;
                s.links_mut(p).color = Color::Black;
                if let Some(wl) = s.links(w).left {
                    s.links_mut(wl).color = Color::Black;
                }
                rotate_right(s, root, p);
                x = *root;
                x_parent = None;
            }
        }
    }
    if let Some(x) = x {
        s.links_mut(x).color = Color::Black;
    }
}

/// Puts `new` exactly where `old` sits: same parent slot, children and
/// colour. `old`'s links are scrubbed. Balance is untouched, which is what
/// in-place promotion of a sharer into its chain head's node slot needs.
pub(crate) fn replace_node<S: Nodes>(
    s: &mut S,
    root: &mut Option<RmapRef>,
    old: RmapRef,
    new: RmapRef,
) {
    let links = *s.links(old);
    match links.parent {
        None => *root = Some(new),
        Some(p) => {
            if s.links(p).left == Some(old) {
                s.links_mut(p).left = Some(new);
            } else {
                s.links_mut(p).right = Some(new);
            }
        }
    }
    if let Some(c) = links.left {
        s.links_mut(c).parent = Some(new);
    }
    if let Some(c) = links.right {
        s.links_mut(c).parent = Some(new);
    }
    *s.links_mut(new) = links;
    *s.links_mut(old) = TreeLinks::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestStore {
        keys: Vec<u64>,
        links: Vec<TreeLinks>,
    }

    impl Nodes for TestStore {
        fn links(&self, h: RmapRef) -> &TreeLinks {
            &self.links[h.index()]
        }

        fn links_mut(&mut self, h: RmapRef) -> &mut TreeLinks {
            &mut self.links[h.index()]
        }
    }

    impl TestStore {
        fn new() -> Self {
            TestStore {
                keys: Vec::new(),
                links: Vec::new(),
            }
        }

        fn add(&mut self, key: u64) -> RmapRef {
            self.keys.push(key);
            self.links.push(TreeLinks::default());
            RmapRef::from_index(self.keys.len() - 1)
        }

        fn insert_by_key(&mut self, root: &mut Option<RmapRef>, node: RmapRef) {
            let key = self.keys[node.index()];
            let mut parent = None;
            let mut side = Side::Left;
            let mut cur = *root;
            while let Some(h) = cur {
                parent = Some(h);
                if key < self.keys[h.index()] {
                    side = Side::Left;
                    cur = self.links(h).left();
                } else {
                    side = Side::Right;
                    cur = self.links(h).right();
                }
            }
            insert(self, root, parent, side, node);
        }

        fn inorder(&self, root: Option<RmapRef>, out: &mut Vec<u64>) {
            if let Some(h) = root {
                self.inorder(self.links(h).left(), out);
                out.push(self.keys[h.index()]);
                self.inorder(self.links(h).right(), out);
            }
        }

        /// Returns the black height; asserts every red-black invariant.
        fn check(&self, h: Option<RmapRef>, parent: Option<RmapRef>) -> usize {
            let Some(h) = h else { return 1 };
            let l = self.links(h);
            assert_eq!(l.parent, parent, "parent link broken");
            if l.color == Color::Red {
                assert_eq!(color(self, l.left), Color::Black, "red-red violation");
                assert_eq!(color(self, l.right), Color::Black, "red-red violation");
            }
            let lh = self.check(l.left, Some(h));
            let rh = self.check(l.right, Some(h));
            assert_eq!(lh, rh, "black heights diverge");
            lh + usize::from(l.color == Color::Black)
        }

        fn check_tree(&self, root: Option<RmapRef>) {
            assert_eq!(color(self, root), Color::Black, "red root");
            self.check(root, None);
        }
    }

    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn insert_keeps_order_and_balance() {
        let mut s = TestStore::new();
        let mut root = None;
        let mut rng = 0x9e3779b97f4a7c15u64;
        let mut keys = Vec::new();
        for _ in 0..512 {
            let key = xorshift(&mut rng) % 1024;
            let node = s.add(key);
            s.insert_by_key(&mut root, node);
            keys.push(key);
        }
        s.check_tree(root);

        let mut got = Vec::new();
        s.inorder(root, &mut got);
        keys.sort_unstable();
        assert_eq!(got, keys);
    }

    #[test]
    fn erase_keeps_order_and_balance() {
        let mut s = TestStore::new();
        let mut root = None;
        let mut rng = 0x2545f4914f6cdd1du64;

        let mut live: Vec<RmapRef> = Vec::new();
        for _ in 0..256 {
            let key = xorshift(&mut rng) % 4096;
            let node = s.add(key);
            s.insert_by_key(&mut root, node);
            live.push(node);
        }
        while let Some(h) = {
            let len = live.len();
            (len > 0).then(|| live.swap_remove((xorshift(&mut rng) as usize) % len))
        } {
            erase(&mut s, &mut root, h);
            s.check_tree(root);

            let mut got = Vec::new();
            s.inorder(root, &mut got);
            let mut expect: Vec<u64> = live.iter().map(|h| s.keys[h.index()]).collect();
            expect.sort_unstable();
            assert_eq!(got, expect);
        }
        assert!(root.is_none());
    }

    #[test]
    fn mixed_insert_erase_churn() {
        let mut s = TestStore::new();
        let mut root = None;
        let mut rng = 0xdeadbeefcafef00du64;
        let mut live: Vec<RmapRef> = Vec::new();

        for round in 0..2000 {
            if live.len() < 8 || (xorshift(&mut rng) % 3) != 0 {
                let node = s.add(xorshift(&mut rng) % 512);
                s.insert_by_key(&mut root, node);
                live.push(node);
            } else {
                let at = (xorshift(&mut rng) as usize) % live.len();
                let h = live.swap_remove(at);
                erase(&mut s, &mut root, h);
            }
            if round % 64 == 0 {
                s.check_tree(root);
            }
        }
        s.check_tree(root);
    }

    #[test]
    fn replace_preserves_shape() {
        let mut s = TestStore::new();
        let mut root = None;
        for key in [50u64, 25, 75, 10, 30, 60, 90] {
            let node = s.add(key);
            s.insert_by_key(&mut root, node);
        }
        // Stand a twin in for an inner node; order is preserved because the
        // twin carries the same key.
        let victim = root.unwrap();
        let twin = s.add(s.keys[victim.index()]);
        replace_node(&mut s, &mut root, victim, twin);
        assert_eq!(root, Some(twin));
        s.check_tree(root);

        let mut got = Vec::new();
        s.inorder(root, &mut got);
        let mut expect = vec![50u64, 25, 75, 10, 30, 60, 90];
        expect.sort_unstable();
        assert_eq!(got, expect);
    }
}
