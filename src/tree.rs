use crate::pool::{abandon_slice, try_boxed_slice};
use crate::{
    Archivable, ArchiveError, ArchiveReader, ArchiveWriter, BoxShape, Coord, GridConfig, GridError,
    GridResult, IBox, Pool, PoolError, PoolPtr, COORD_LIMIT, EMPTY_POOL_PTR,
};

use smallvec::SmallVec;
use std::fmt::Write as _;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bumped whenever the record layout of [`BoxTree::write_header`] or [`BoxTree::write_tree`] changes.
pub(crate) const ARCHIVE_VERSION: u64 = 1;

/// What a node's child slot refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Child {
    Empty,
    Node(PoolPtr),
    Leaf(PoolPtr),
    /// The whole sub-box holds the special value of this slot.
    Special(u16),
}

#[derive(Debug)]
pub(crate) struct Node<const D: usize> {
    pub center: Coord<D>,
    pub radius: u64,
    pub father: PoolPtr,
    pub children: Box<[Child]>,
}

#[derive(Debug)]
pub(crate) struct Leaf<T, const D: usize> {
    pub center: Coord<D>,
    pub father: PoolPtr,
    pub cells: Box<[T]>,
    /// For each special slot, the number of cells holding that value. Empty unless the grid factorizes.
    pub counts: Box<[u32]>,
}

/// Either kind of box in the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BoxPtr {
    Node(PoolPtr),
    Leaf(PoolPtr),
}

impl BoxPtr {
    const LEAF_BIT: u32 = 1 << 31;
    const NONE_BITS: u32 = u32::MAX;

    #[inline]
    fn to_bits(ptr: Option<Self>) -> u32 {
        match ptr {
            Some(BoxPtr::Node(p)) => p,
            Some(BoxPtr::Leaf(p)) => p | Self::LEAF_BIT,
            None => Self::NONE_BITS,
        }
    }

    #[inline]
    fn from_bits(bits: u32) -> Option<Self> {
        if bits == Self::NONE_BITS {
            None
        } else if bits & Self::LEAF_BIT != 0 {
            Some(BoxPtr::Leaf(bits & !Self::LEAF_BIT))
        } else {
            Some(BoxPtr::Node(bits))
        }
    }
}

/// A caller-owned cursor for read-only lookups.
///
/// Successive lookups that share a hint start walking from the box the previous one ended in. A hint may be reused
/// across grids or after the grid it came from was modified: a hint that no longer names a live box simply restarts
/// from the root.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PeekHint {
    cursor: Option<BoxPtr>,
}

impl PeekHint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the last visited box.
    pub fn reset(&mut self) {
        self.cursor = None;
    }
}

/// Where a read-only walk ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Probe {
    Cell { leaf: PoolPtr, offset: usize },
    Empty { node: PoolPtr, index: usize },
    Special { node: PoolPtr, index: usize, slot: u16 },
    Outside,
}

impl Probe {
    #[inline]
    fn cursor(&self) -> Option<BoxPtr> {
        match *self {
            Probe::Cell { leaf, .. } => Some(BoxPtr::Leaf(leaf)),
            Probe::Empty { node, .. } | Probe::Special { node, .. } => Some(BoxPtr::Node(node)),
            Probe::Outside => None,
        }
    }
}

/// Where a mutating walk ended. Every node on the path exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Landing {
    Leaf(PoolPtr),
    /// The bottom-level slot that should hold the leaf is empty.
    Vacant { parent: PoolPtr, index: usize },
    Special { parent: PoolPtr, index: usize, slot: u16 },
}

/// The value a read-only lookup found.
#[derive(Debug)]
pub(crate) enum Found<'a, T> {
    Cell(&'a T),
    Special(u16),
}

/// Decoded `grid_header` record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Header<const D: usize> {
    pub range: Option<IBox<D>>,
    pub special: (i64, i64),
    pub call_destructors: bool,
}

pub(crate) fn check_coord<const D: usize>(pos: &Coord<D>) -> GridResult<()> {
    if pos.iter().all(|x| (-COORD_LIMIT..=COORD_LIMIT).contains(x)) {
        Ok(())
    } else {
        Err(GridError::OutOfRange(pos.to_vec()))
    }
}

/// The box tree shared by every grid.
///
/// Nodes and leaves live in two pools and refer to each other by [`PoolPtr`]. The root is created lazily at the origin
/// with the elementary radius and is replaced by a larger root whenever an access falls outside of it. The tree never
/// shrinks except when a factorizing grid collapses a uniform region into a [`Child::Special`] slot.
pub(crate) struct BoxTree<T, const D: usize> {
    shape: BoxShape<D>,
    config: GridConfig,
    init: fn(Coord<D>) -> T,
    counts_len: usize,
    nodes: Pool<Node<D>>,
    leaves: Pool<Leaf<T, D>>,
    root: PoolPtr,
    cursor: Option<BoxPtr>,
    /// The only state the read path writes. Holds [`BoxPtr::to_bits`].
    peek_cursor: AtomicU32,
    range: Option<IBox<D>>,
}

impl<T, const D: usize> BoxTree<T, D> {
    pub fn new(config: GridConfig, init: fn(Coord<D>) -> T, counts_len: usize) -> GridResult<Self> {
        let shape = config.validate::<D>()?;
        Ok(Self::with_shape(shape, config, init, counts_len))
    }

    fn with_shape(
        shape: BoxShape<D>,
        config: GridConfig,
        init: fn(Coord<D>) -> T,
        counts_len: usize,
    ) -> Self {
        Self {
            shape,
            config,
            init,
            counts_len,
            nodes: Pool::new(config.pool_chunk_len),
            leaves: Pool::new(config.pool_chunk_len),
            root: EMPTY_POOL_PTR,
            cursor: None,
            peek_cursor: AtomicU32::new(BoxPtr::NONE_BITS),
            range: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    #[inline]
    pub fn range(&self) -> Option<IBox<D>> {
        self.range
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    fn box_heap_bytes(&self) -> usize {
        let per_leaf =
            self.shape.leaf_len() * mem::size_of::<T>() + self.counts_len * mem::size_of::<u32>();
        let per_node = self.shape.fan_out() * mem::size_of::<Child>();
        self.leaves.len() * per_leaf + self.nodes.len() * per_node
    }

    /// Bytes held by live nodes and leaves, cell buffers included.
    pub fn memory_used(&self) -> usize {
        self.nodes.used() + self.leaves.used() + self.box_heap_bytes()
    }

    /// Bytes of pool chunks plus the cell buffers of live leaves.
    pub fn memory_footprint(&self) -> usize {
        self.nodes.footprint() + self.leaves.footprint() + self.box_heap_bytes()
    }

    #[inline]
    pub fn leaf_or_panic(&self, ptr: PoolPtr) -> &Leaf<T, D> {
        self.leaves
            .get(ptr)
            .unwrap_or_else(|| panic!("Tried to access dangling leaf {}", ptr))
    }

    #[inline]
    pub fn leaf_mut_or_panic(&mut self, ptr: PoolPtr) -> &mut Leaf<T, D> {
        self.leaves
            .get_mut(ptr)
            .unwrap_or_else(|| panic!("Tried to access dangling leaf {}", ptr))
    }

    #[inline]
    fn node_or_panic(&self, ptr: PoolPtr) -> &Node<D> {
        self.nodes
            .get(ptr)
            .unwrap_or_else(|| panic!("Tried to access dangling node {}", ptr))
    }

    #[inline]
    fn node_mut_or_panic(&mut self, ptr: PoolPtr) -> &mut Node<D> {
        self.nodes
            .get_mut(ptr)
            .unwrap_or_else(|| panic!("Tried to access dangling node {}", ptr))
    }

    /// The leaf offset of `pos`, which must be inside the leaf.
    #[inline]
    pub fn offset_in(&self, leaf: PoolPtr, pos: &Coord<D>) -> usize {
        self.shape.leaf_offset(&self.leaf_or_panic(leaf).center, pos)
    }

    /// Iterates over every live leaf.
    pub fn leaves(&self) -> impl Iterator<Item = (PoolPtr, &Leaf<T, D>)> + '_ {
        self.leaves.iter()
    }

    /// Calls `f` with the slot and the number of sites of every collapsed region.
    pub fn for_each_special(&self, mut f: impl FnMut(u16, u64)) {
        for (_, node) in self.nodes.iter() {
            for child in node.children.iter() {
                if let Child::Special(slot) = *child {
                    // Children of a node of radius r have half-width r.
                    f(slot, self.shape.cube_sites(node.radius));
                }
            }
        }
    }

    /// Walks from the primary cursor to the slot that owns `pos`, growing the root and creating every missing node on
    /// the way. Leaves are never created here.
    pub fn walk_to(&mut self, pos: &Coord<D>) -> GridResult<Landing> {
        check_coord(pos)?;
        match &mut self.range {
            Some(range) => range.include(pos),
            None => self.range = Some(IBox::point(*pos)),
        }

        if self.root == EMPTY_POOL_PTR {
            let children = try_boxed_slice(self.shape.fan_out(), |_| Child::Empty)?;
            self.root = self.nodes.allocate(Node {
                center: [0; D],
                radius: self.shape.radius(),
                father: EMPTY_POOL_PTR,
                children,
            })?;
            self.cursor = Some(BoxPtr::Node(self.root));
        }

        let mut n = match self.cursor {
            Some(BoxPtr::Leaf(l)) => {
                let leaf = self.leaf_or_panic(l);
                if self.shape.leaf_contains(&leaf.center, pos) {
                    return Ok(Landing::Leaf(l));
                }
                leaf.father
            }
            Some(BoxPtr::Node(n)) => n,
            None => self.root,
        };

        loop {
            let node = self.node_or_panic(n);
            if self.shape.node_contains(&node.center, node.radius, pos) {
                break;
            }
            let father = node.father;
            n = if father == EMPTY_POOL_PTR {
                self.grow_root()?
            } else {
                father
            };
        }

        loop {
            let node = self.node_or_panic(n);
            let index = self.shape.child_index(&node.center, node.radius, pos);
            let bottom = self.shape.is_bottom(node.radius);
            let child = node.children[index];
            match child {
                Child::Node(c) => n = c,
                Child::Leaf(l) => {
                    self.cursor = Some(BoxPtr::Leaf(l));
                    return Ok(Landing::Leaf(l));
                }
                Child::Special(slot) => {
                    self.cursor = Some(BoxPtr::Node(n));
                    return Ok(Landing::Special {
                        parent: n,
                        index,
                        slot,
                    });
                }
                Child::Empty if bottom => {
                    self.cursor = Some(BoxPtr::Node(n));
                    return Ok(Landing::Vacant { parent: n, index });
                }
                Child::Empty => n = self.attach_node(n, index, Child::Empty)?,
            }
        }
    }

    fn grow_root(&mut self) -> Result<PoolPtr, PoolError> {
        let old = self.root;
        let (center, radius) = {
            let node = self.node_or_panic(old);
            (node.center, self.shape.parent_radius(node.radius))
        };
        let mut children = try_boxed_slice(self.shape.fan_out(), |_| Child::Empty)?;
        children[self.shape.middle_child()] = Child::Node(old);
        let root = self.nodes.allocate(Node {
            center,
            radius,
            father: EMPTY_POOL_PTR,
            children,
        })?;
        self.node_mut_or_panic(old).father = root;
        self.root = root;
        log::trace!("Grew the root to radius {}", radius);
        // The old root may have been uniform without being allowed to collapse.
        let first = self.node_or_panic(old).children[0];
        if let Child::Special(slot) = first {
            self.propagate_collapse(old, slot);
        }
        Ok(root)
    }

    /// Creates a node in the slot `index` of `parent` with every child slot set to `fill`.
    fn attach_node(&mut self, parent: PoolPtr, index: usize, fill: Child) -> Result<PoolPtr, PoolError> {
        let (center, radius) = {
            let node = self.node_or_panic(parent);
            (
                self.shape
                    .child_center_from_index(&node.center, node.radius, index),
                self.shape.child_radius(node.radius),
            )
        };
        let children = try_boxed_slice(self.shape.fan_out(), |_| fill)?;
        let ptr = self.nodes.allocate(Node {
            center,
            radius,
            father: parent,
            children,
        })?;
        self.node_mut_or_panic(parent).children[index] = Child::Node(ptr);
        Ok(ptr)
    }

    /// Creates a leaf in the slot `index` of the bottom-level node `parent`, filling each cell with `cell(site)`. The
    /// primary cursor moves to the new leaf.
    pub fn attach_leaf_with(
        &mut self,
        parent: PoolPtr,
        index: usize,
        mut cell: impl FnMut(Coord<D>) -> T,
    ) -> Result<PoolPtr, PoolError> {
        let center = {
            let node = self.node_or_panic(parent);
            debug_assert!(self.shape.is_bottom(node.radius));
            self.shape
                .child_center_from_index(&node.center, node.radius, index)
        };
        let shape = self.shape;
        let cells = try_boxed_slice(shape.leaf_len(), |offset| {
            cell(shape.leaf_position(&center, offset))
        })?;
        let counts = try_boxed_slice(self.counts_len, |_| 0)?;
        let ptr = self.leaves.allocate(Leaf {
            center,
            father: parent,
            cells,
            counts,
        })?;
        self.node_mut_or_panic(parent).children[index] = Child::Leaf(ptr);
        self.cursor = Some(BoxPtr::Leaf(ptr));
        Ok(ptr)
    }

    /// Creates a leaf whose cells come from the tree's initializer.
    #[inline]
    pub fn attach_new_leaf(&mut self, parent: PoolPtr, index: usize) -> Result<PoolPtr, PoolError> {
        let init = self.init;
        self.attach_leaf_with(parent, index, init)
    }

    /// Points any cursor that names `old` at `replacement` instead.
    fn retarget_cursors(&mut self, old: BoxPtr, replacement: PoolPtr) {
        if self.cursor == Some(old) {
            self.cursor = Some(BoxPtr::Node(replacement));
        }
        let peek = self.peek_cursor.get_mut();
        if BoxPtr::from_bits(*peek) == Some(old) {
            *peek = BoxPtr::to_bits(Some(BoxPtr::Node(replacement)));
        }
    }

    /// Destroys a leaf and marks its slot as the collapsed special value `slot`. Returns the parent node.
    pub fn collapse_leaf(&mut self, ptr: PoolPtr, slot: u16) -> PoolPtr {
        let leaf = self
            .leaves
            .take(ptr)
            .unwrap_or_else(|| panic!("Tried to collapse dangling leaf {}", ptr));
        let parent = leaf.father;
        let shape = self.shape;
        let node = self.node_mut_or_panic(parent);
        let index = shape.child_index(&node.center, node.radius, &leaf.center);
        node.children[index] = Child::Special(slot);
        self.retarget_cursors(BoxPtr::Leaf(ptr), parent);
        log::trace!("Collapsed leaf at {:?} into special slot {}", leaf.center, slot);
        parent
    }

    /// Collapses `node` and then each of its ancestors for as long as all of its children are `Special(slot)`. The
    /// root is never collapsed.
    pub fn propagate_collapse(&mut self, mut n: PoolPtr, slot: u16) {
        loop {
            let node = self.node_or_panic(n);
            let father = node.father;
            if father == EMPTY_POOL_PTR || node.children.iter().any(|c| *c != Child::Special(slot)) {
                return;
            }
            let center = node.center;
            self.nodes.destroy(n);
            let shape = self.shape;
            let parent = self.node_mut_or_panic(father);
            let index = shape.child_index(&parent.center, parent.radius, &center);
            parent.children[index] = Child::Special(slot);
            self.retarget_cursors(BoxPtr::Node(n), father);
            log::trace!("Collapsed node at {:?} into special slot {}", center, slot);
            n = father;
        }
    }

    /// Collapses every node other than the root whose children all hold the same special slot.
    pub fn collapse_uniform_nodes(&mut self) {
        let uniform: Vec<(PoolPtr, u16)> = self
            .nodes
            .iter()
            .filter_map(|(ptr, node)| match node.children[0] {
                Child::Special(slot) if node.children.iter().all(|c| *c == Child::Special(slot)) => {
                    Some((ptr, slot))
                }
                _ => None,
            })
            .collect();
        for (n, slot) in uniform {
            // Already gone if a descendant's collapse reached it.
            if self.nodes.contains(n) {
                self.propagate_collapse(n, slot);
            }
        }
    }

    /// Walks from `start` to the slot that owns `pos` without modifying anything.
    pub fn probe(&self, start: Option<BoxPtr>, pos: &Coord<D>) -> Probe {
        if self.root == EMPTY_POOL_PTR || check_coord(pos).is_err() {
            return Probe::Outside;
        }

        let mut n = match start {
            Some(BoxPtr::Leaf(l)) => match self.leaves.get(l) {
                Some(leaf) => {
                    if self.shape.leaf_contains(&leaf.center, pos) {
                        return Probe::Cell {
                            leaf: l,
                            offset: self.shape.leaf_offset(&leaf.center, pos),
                        };
                    }
                    leaf.father
                }
                None => self.root,
            },
            Some(BoxPtr::Node(n)) if self.nodes.contains(n) => n,
            _ => self.root,
        };

        loop {
            let node = self.node_or_panic(n);
            if self.shape.node_contains(&node.center, node.radius, pos) {
                break;
            }
            if node.father == EMPTY_POOL_PTR {
                return Probe::Outside;
            }
            n = node.father;
        }

        loop {
            let node = self.node_or_panic(n);
            let index = self.shape.child_index(&node.center, node.radius, pos);
            match node.children[index] {
                Child::Empty => return Probe::Empty { node: n, index },
                Child::Special(slot) => {
                    return Probe::Special {
                        node: n,
                        index,
                        slot,
                    }
                }
                Child::Node(c) => n = c,
                Child::Leaf(l) => {
                    let leaf = self.leaf_or_panic(l);
                    return Probe::Cell {
                        leaf: l,
                        offset: self.shape.leaf_offset(&leaf.center, pos),
                    };
                }
            }
        }
    }

    #[inline]
    fn found(&self, probe: Probe) -> Option<Found<'_, T>> {
        match probe {
            Probe::Cell { leaf, offset } => Some(Found::Cell(&self.leaf_or_panic(leaf).cells[offset])),
            Probe::Special { slot, .. } => Some(Found::Special(slot)),
            Probe::Empty { .. } | Probe::Outside => None,
        }
    }

    /// Read-only lookup. Walks from `hint` if one is given and from the shared peek cursor otherwise, then leaves the
    /// used cursor at the box where the walk ended.
    pub fn peek(&self, pos: &Coord<D>, hint: Option<&mut PeekHint>) -> Option<Found<'_, T>> {
        match hint {
            Some(hint) => {
                let probe = self.probe(hint.cursor, pos);
                hint.cursor = probe.cursor();
                self.found(probe)
            }
            None => {
                let start = BoxPtr::from_bits(self.peek_cursor.load(Ordering::Relaxed));
                let probe = self.probe(start, pos);
                self.peek_cursor
                    .store(BoxPtr::to_bits(probe.cursor()), Ordering::Relaxed);
                self.found(probe)
            }
        }
    }

    /// The value at `pos` if its leaf exists, otherwise the largest slot of the tree containing `pos` that holds no
    /// leaf. An allocated cell is reported with the singleton box.
    pub fn find_full_box(&mut self, pos: &Coord<D>) -> GridResult<(Option<Found<'_, T>>, IBox<D>)> {
        let (probe, bounds) = self.full_box_probe(pos)?;
        Ok((self.found(probe), bounds))
    }

    /// Like [`BoxTree::find_full_box`], but tries to replace the slot by a cube centered on `pos`.
    ///
    /// Cubes of half-width `3h + 1, h, (h - 1) / 3, ...` are tried, where `h` is the half-width of the slot, for as long
    /// as they leave more room around `pos` than the slot does. The first one holding the same content as the slot
    /// wins.
    pub fn find_full_box_centered(
        &mut self,
        pos: &Coord<D>,
    ) -> GridResult<(Option<Found<'_, T>>, IBox<D>)> {
        let (probe, bounds) = self.full_box_probe(pos)?;
        let target = match probe {
            Probe::Cell { .. } => return Ok((self.found(probe), bounds)),
            Probe::Special { slot, .. } => Some(slot),
            Probe::Empty { .. } | Probe::Outside => None,
        };
        let half_width = (bounds.max[0] - bounds.min[0]) as u64 / 2;
        let room = bounds.boundary_distance(pos).unwrap_or(0);
        let mut rho = 3 * half_width + 1;
        while rho > room {
            let cube = IBox::centered(*pos, rho);
            if self.region_matches(&cube, target) {
                return Ok((self.found(probe), cube));
            }
            rho = (rho - 1) / 3;
        }
        Ok((self.found(probe), bounds))
    }

    fn full_box_probe(&mut self, pos: &Coord<D>) -> GridResult<(Probe, IBox<D>)> {
        check_coord(pos)?;
        let probe = self.probe(self.cursor, pos);
        if let Some(cursor) = probe.cursor() {
            self.cursor = Some(cursor);
        }
        let bounds = match probe {
            Probe::Cell { .. } => IBox::point(*pos),
            Probe::Empty { node, index } | Probe::Special { node, index, .. } => {
                let node = self.node_or_panic(node);
                self.shape.child_bounds(&node.center, node.radius, index)
            }
            Probe::Outside => self.virtual_slot_bounds(pos),
        };
        Ok((probe, bounds))
    }

    /// The slot containing `pos` in the smallest root that would contain it. Only meaningful when `pos` is outside
    /// the current root.
    fn virtual_slot_bounds(&self, pos: &Coord<D>) -> IBox<D> {
        let (center, mut radius) = if self.root == EMPTY_POOL_PTR {
            ([0; D], self.shape.radius())
        } else {
            let root = self.node_or_panic(self.root);
            (root.center, root.radius)
        };
        while !self.shape.node_contains(&center, radius, pos) {
            radius = self.shape.parent_radius(radius);
        }
        let index = self.shape.child_index(&center, radius, pos);
        self.shape.child_bounds(&center, radius, index)
    }

    /// True iff no leaf intersects `region` and every slot it overlaps is empty (`target == None`) or collapsed to
    /// `target`.
    pub fn region_matches(&self, region: &IBox<D>, target: Option<u16>) -> bool {
        if self.root == EMPTY_POOL_PTR {
            return target.is_none();
        }
        let root = self.node_or_panic(self.root);
        if target.is_some() && !self.shape.node_bounds(&root.center, root.radius).contains_box(region) {
            return false;
        }

        let mut stack = SmallVec::<[PoolPtr; 32]>::new();
        stack.push(self.root);
        while let Some(n) = stack.pop() {
            let node = self.node_or_panic(n);
            for (index, child) in node.children.iter().enumerate() {
                match (*child, target) {
                    (Child::Empty, None) => continue,
                    (Child::Special(s), Some(t)) if s == t => continue,
                    _ => {}
                }
                let bounds = self.shape.child_bounds(&node.center, node.radius, index);
                if !bounds.intersects(region) {
                    continue;
                }
                match *child {
                    Child::Node(c) => stack.push(c),
                    _ => return false,
                }
            }
        }
        true
    }

    /// Drops every box. Cells are abandoned instead of dropped unless `call_destructors` is set.
    pub fn reset_with(&mut self, call_destructors: bool) {
        if !call_destructors {
            self.leaves
                .for_each_mut(|_, leaf| abandon_slice(mem::take(&mut leaf.cells)));
        }
        log::debug!(
            "Resetting tree with {} nodes and {} leaves",
            self.nodes.len(),
            self.leaves.len()
        );
        self.leaves.destroy_all(false);
        self.nodes.destroy_all(false);
        self.root = EMPTY_POOL_PTR;
        self.cursor = None;
        *self.peek_cursor.get_mut() = BoxPtr::NONE_BITS;
        self.range = None;
    }

    pub fn tree_string(&self) -> String {
        let mut out = String::new();
        if self.root == EMPTY_POOL_PTR {
            out.push_str(" Empty\n");
        } else {
            self.write_tree_string(&mut out, self.root, "");
        }
        out
    }

    fn write_tree_string(&self, out: &mut String, n: PoolPtr, tab: &str) {
        let node = self.node_or_panic(n);
        let _ = writeln!(out, "{} Node: center = {:?}  radius = {}", tab, node.center, node.radius);
        let tab = format!("{}    |", tab);
        for child in node.children.iter() {
            match *child {
                Child::Empty => {
                    let _ = writeln!(out, "{} Empty", tab);
                }
                Child::Node(c) => self.write_tree_string(out, c, &tab),
                Child::Leaf(l) => {
                    let _ = writeln!(out, "{} Leaf: center = {:?}", tab, self.leaf_or_panic(l).center);
                }
                Child::Special(slot) => {
                    let _ = writeln!(out, "{} Special: slot = {}", tab, slot);
                }
            }
        }
    }

    pub fn write_header<W: ArchiveWriter + ?Sized>(
        &self,
        ar: &mut W,
        special: (i64, i64),
    ) -> Result<(), ArchiveError> {
        ar.begin_value("grid_header")?;
        ARCHIVE_VERSION.archive(ar)?;
        (D as u64).archive(ar)?;
        self.shape.radius().archive(ar)?;
        ar.write_str(std::any::type_name::<T>())?;
        (mem::size_of::<T>() as u64).archive(ar)?;
        self.config.call_destructors.archive(ar)?;
        let (min, max) = match self.range {
            Some(range) => (range.min, range.max),
            None => ([1; D], [-1; D]),
        };
        min.archive(ar)?;
        max.archive(ar)?;
        special.0.archive(ar)?;
        special.1.archive(ar)?;
        ar.end_value()
    }

    pub fn read_header<R: ArchiveReader + ?Sized>(&self, ar: &mut R) -> Result<Header<D>, ArchiveError> {
        fn check<X: PartialEq + ToString>(field: &'static str, expected: X, found: X) -> Result<(), ArchiveError> {
            if expected == found {
                Ok(())
            } else {
                Err(ArchiveError::header_mismatch(field, expected, found))
            }
        }

        ar.expect_value("grid_header")?;
        check("version", ARCHIVE_VERSION, u64::unarchive(ar)?)?;
        check("dimension", D as u64, u64::unarchive(ar)?)?;
        check("radius", self.shape.radius(), u64::unarchive(ar)?)?;
        check("type_name", std::any::type_name::<T>().to_owned(), ar.read_string()?)?;
        check("element_size", mem::size_of::<T>() as u64, u64::unarchive(ar)?)?;
        let call_destructors = bool::unarchive(ar)?;
        let min = <[i64; D]>::unarchive(ar)?;
        let max = <[i64; D]>::unarchive(ar)?;
        let range = if (0..D).all(|i| min[i] <= max[i]) {
            check_coord(&min)
                .and_then(|_| check_coord(&max))
                .map_err(|_| ArchiveError::malformed("range exceeds the coordinate limit"))?;
            Some(IBox::new(min, max))
        } else if min == [1; D] && max == [-1; D] {
            None
        } else {
            return Err(ArchiveError::malformed("inconsistent range"));
        };
        let special = (i64::unarchive(ar)?, i64::unarchive(ar)?);
        ar.read_end()?;
        Ok(Header {
            range,
            special,
            call_destructors,
        })
    }

    /// Adopts the range of a header read back from an archive.
    pub fn set_range(&mut self, range: Option<IBox<D>>) {
        self.range = range;
    }

    fn read_center<R: ArchiveReader + ?Sized>(ar: &mut R, expected: &Coord<D>) -> GridResult<()> {
        let center = <[i64; D]>::unarchive(ar)?;
        if center != *expected {
            return Err(ArchiveError::malformed(format!(
                "box centered at {:?} found where {:?} was expected",
                center, expected
            ))
            .into());
        }
        Ok(())
    }
}

impl<T: Clone, const D: usize> BoxTree<T, D> {
    /// Replaces the collapsed slot `index` of `parent` by one level of real boxes holding the same value. A node gets
    /// `Special(slot)` children and a leaf gets clones of `value`.
    pub fn expand_special(
        &mut self,
        parent: PoolPtr,
        index: usize,
        slot: u16,
        value: &T,
    ) -> Result<Child, PoolError> {
        let radius = self.node_or_panic(parent).radius;
        log::trace!("Expanding special slot {} below node {}", slot, parent);
        if self.shape.is_bottom(radius) {
            let leaf = self.attach_leaf_with(parent, index, |_| value.clone())?;
            Ok(Child::Leaf(leaf))
        } else {
            let node = self.attach_node(parent, index, Child::Special(slot))?;
            Ok(Child::Node(node))
        }
    }

    /// Fills the empty slot `index` of `parent` with a complete subtree of leaves holding clones of `value`.
    fn build_uniform(&mut self, parent: PoolPtr, index: usize, value: &T) -> Result<Child, PoolError> {
        let radius = self.node_or_panic(parent).radius;
        if self.shape.is_bottom(radius) {
            let leaf = self.attach_leaf_with(parent, index, |_| value.clone())?;
            return Ok(Child::Leaf(leaf));
        }
        let node = self.attach_node(parent, index, Child::Empty)?;
        for i in 0..self.shape.fan_out() {
            self.build_uniform(node, i, value)?;
        }
        Ok(Child::Node(node))
    }

    /// A deep copy with fresh pools. Leaf counts are copied when `counts_len` matches and zeroed otherwise.
    pub fn try_clone_with(&self, counts_len: usize) -> Result<Self, PoolError> {
        let mut out = Self::with_shape(self.shape, self.config, self.init, counts_len);
        out.range = self.range;
        if self.root != EMPTY_POOL_PTR {
            out.root = self.clone_node(self.root, EMPTY_POOL_PTR, &mut out)?;
            out.cursor = Some(BoxPtr::Node(out.root));
        }
        Ok(out)
    }

    #[inline]
    pub fn try_clone(&self) -> Result<Self, PoolError> {
        self.try_clone_with(self.counts_len)
    }

    fn clone_node(&self, src: PoolPtr, father: PoolPtr, out: &mut Self) -> Result<PoolPtr, PoolError> {
        let node = self.node_or_panic(src);
        let children = try_boxed_slice(self.shape.fan_out(), |_| Child::Empty)?;
        let dst = out.nodes.allocate(Node {
            center: node.center,
            radius: node.radius,
            father,
            children,
        })?;
        for (index, child) in node.children.iter().enumerate() {
            let copy = match *child {
                Child::Empty => continue,
                Child::Special(slot) => Child::Special(slot),
                Child::Node(c) => Child::Node(self.clone_node(c, dst, out)?),
                Child::Leaf(l) => {
                    let leaf = self.leaf_or_panic(l);
                    let cells = try_boxed_slice(leaf.cells.len(), |i| leaf.cells[i].clone())?;
                    let counts = if out.counts_len == self.counts_len {
                        try_boxed_slice(out.counts_len, |i| leaf.counts[i])?
                    } else {
                        try_boxed_slice(out.counts_len, |_| 0)?
                    };
                    Child::Leaf(out.leaves.allocate(Leaf {
                        center: leaf.center,
                        father: dst,
                        cells,
                        counts,
                    })?)
                }
            };
            out.node_mut_or_panic(dst).children[index] = copy;
        }
        Ok(dst)
    }
}

impl<T: Archivable, const D: usize> BoxTree<T, D> {
    /// Writes the tree as nested `void`, `leaf`, `node` and `special` records starting from the root.
    pub fn write_tree<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
        if self.root == EMPTY_POOL_PTR {
            ar.begin_value("void")?;
            return ar.end_value();
        }
        self.write_node(ar, self.root)
    }

    fn write_node<W: ArchiveWriter + ?Sized>(&self, ar: &mut W, n: PoolPtr) -> Result<(), ArchiveError> {
        let node = self.node_or_panic(n);
        ar.begin_value("node")?;
        node.center.archive(ar)?;
        node.radius.archive(ar)?;
        let bottom = self.shape.is_bottom(node.radius);
        for (index, child) in node.children.iter().enumerate() {
            match *child {
                Child::Empty => {
                    ar.begin_value("void")?;
                    ar.end_value()?;
                }
                Child::Node(c) => self.write_node(ar, c)?,
                Child::Leaf(l) => {
                    let leaf = self.leaf_or_panic(l);
                    ar.begin_value("leaf")?;
                    leaf.center.archive(ar)?;
                    for cell in leaf.cells.iter() {
                        cell.archive(ar)?;
                    }
                    ar.end_value()?;
                }
                Child::Special(slot) => {
                    ar.begin_value("special")?;
                    self.shape
                        .child_center_from_index(&node.center, node.radius, index)
                        .archive(ar)?;
                    let radius = if bottom {
                        0
                    } else {
                        self.shape.child_radius(node.radius)
                    };
                    radius.archive(ar)?;
                    (slot as u64).archive(ar)?;
                    ar.end_value()?;
                }
            }
        }
        ar.end_value()
    }
}

impl<T: Archivable + Clone, const D: usize> BoxTree<T, D> {
    /// Reads the records written by [`BoxTree::write_tree`] into this tree, which must be empty.
    ///
    /// `specials` holds the special objects of the archive by slot. `keep` maps a special object to the slot it should
    /// be collapsed into in this tree, or returns `None` to have the region expanded into real leaves.
    pub fn read_tree<R: ArchiveReader + ?Sized>(
        &mut self,
        ar: &mut R,
        specials: &[Option<T>],
        keep: &dyn Fn(&T) -> Option<u16>,
    ) -> GridResult<()> {
        debug_assert_eq!(self.root, EMPTY_POOL_PTR);
        let tag = ar.read_begin()?;
        match tag.as_str() {
            "void" => return Ok(ar.read_end()?),
            "node" => {}
            _ => return Err(ArchiveError::malformed(format!("the root cannot be a {} record", tag)).into()),
        }
        Self::read_center(ar, &[0; D])?;
        let radius = u64::unarchive(ar)?;
        if radius > COORD_LIMIT as u64 || !self.shape.is_node_radius(radius) {
            return Err(ArchiveError::malformed(format!("invalid root radius {}", radius)).into());
        }
        let children = try_boxed_slice(self.shape.fan_out(), |_| Child::Empty)?;
        self.root = self.nodes.allocate(Node {
            center: [0; D],
            radius,
            father: EMPTY_POOL_PTR,
            children,
        })?;
        self.cursor = Some(BoxPtr::Node(self.root));
        self.read_children(ar, self.root, specials, keep)?;
        ar.read_end()?;
        Ok(())
    }

    fn read_children<R: ArchiveReader + ?Sized>(
        &mut self,
        ar: &mut R,
        n: PoolPtr,
        specials: &[Option<T>],
        keep: &dyn Fn(&T) -> Option<u16>,
    ) -> GridResult<()> {
        let (center, radius) = {
            let node = self.node_or_panic(n);
            (node.center, node.radius)
        };
        let bottom = self.shape.is_bottom(radius);
        for index in 0..self.shape.fan_out() {
            let expected = self.shape.child_center_from_index(&center, radius, index);
            let tag = ar.read_begin()?;
            match tag.as_str() {
                "void" => {}
                "leaf" if bottom => {
                    Self::read_center(ar, &expected)?;
                    let len = self.shape.leaf_len();
                    let mut cells = Vec::new();
                    cells.try_reserve_exact(len).map_err(|_| PoolError::Exhausted {
                        requested: len.saturating_mul(mem::size_of::<T>()),
                    })?;
                    for _ in 0..len {
                        cells.push(T::unarchive(ar)?);
                    }
                    let counts = try_boxed_slice(self.counts_len, |_| 0)?;
                    let leaf = self.leaves.allocate(Leaf {
                        center: expected,
                        father: n,
                        cells: cells.into_boxed_slice(),
                        counts,
                    })?;
                    self.node_mut_or_panic(n).children[index] = Child::Leaf(leaf);
                }
                "node" if !bottom => {
                    Self::read_center(ar, &expected)?;
                    let child_radius = u64::unarchive(ar)?;
                    if child_radius != self.shape.child_radius(radius) {
                        return Err(ArchiveError::malformed(format!(
                            "node of radius {} below a node of radius {}",
                            child_radius, radius
                        ))
                        .into());
                    }
                    let child = self.attach_node(n, index, Child::Empty)?;
                    self.read_children(ar, child, specials, keep)?;
                }
                "special" => {
                    Self::read_center(ar, &expected)?;
                    let special_radius = u64::unarchive(ar)?;
                    let expected_radius = if bottom {
                        0
                    } else {
                        self.shape.child_radius(radius)
                    };
                    if special_radius != expected_radius {
                        return Err(ArchiveError::malformed(format!(
                            "special region of radius {} below a node of radius {}",
                            special_radius, radius
                        ))
                        .into());
                    }
                    let slot = u64::unarchive(ar)?;
                    let value = usize::try_from(slot)
                        .ok()
                        .and_then(|s| specials.get(s))
                        .and_then(Option::as_ref)
                        .ok_or_else(|| ArchiveError::malformed(format!("unknown special slot {}", slot)))?;
                    match keep(value) {
                        Some(own) => self.node_mut_or_panic(n).children[index] = Child::Special(own),
                        None => {
                            self.build_uniform(n, index, value)?;
                        }
                    }
                }
                "leaf" | "node" => {
                    return Err(ArchiveError::malformed(format!(
                        "{} record below a node of radius {}",
                        tag, radius
                    ))
                    .into())
                }
                _ => {
                    return Err(ArchiveError::TagMismatch {
                        expected: "void|leaf|node|special".to_owned(),
                        found: tag,
                    }
                    .into())
                }
            }
            ar.read_end()?;
        }
        Ok(())
    }
}

impl<T, const D: usize> Drop for BoxTree<T, D> {
    fn drop(&mut self) {
        if !self.config.call_destructors {
            self.leaves
                .for_each_mut(|_, leaf| abandon_slice(mem::take(&mut leaf.cells)));
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
