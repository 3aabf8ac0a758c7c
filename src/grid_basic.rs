use crate::grid_factor::{read_specials, write_specials};
use crate::tree::{BoxTree, Found, Landing};
use crate::{
    Archivable, ArchiveReader, ArchiveWriter, Coord, GridConfig, GridError, GridFactor, GridResult,
    IBox, IntoCoord, PeekHint, PoolPtr,
};

use std::fmt;

pub(crate) fn default_cell<T: Default, const D: usize>(_: Coord<D>) -> T {
    T::default()
}

/// A map from every site of `Z^D` to a `T`, materialized one leaf at a time.
///
/// A site that was never accessed has no storage. The first [`get`](GridBasic::get) or [`set`](GridBasic::set) of a
/// site creates its whole leaf, initializing every cell with `T::default()` or with the positional initializer given to
/// [`with_initializer`](GridBasic::with_initializer).
pub struct GridBasic<T, const D: usize> {
    tree: BoxTree<T, D>,
}

impl<T: Default, const D: usize> GridBasic<T, D> {
    pub fn new(config: GridConfig) -> GridResult<Self> {
        Self::with_initializer(config, default_cell::<T, D>)
    }
}

impl<T, const D: usize> GridBasic<T, D> {
    /// Creates an empty grid whose cells are initialized with `init(site)` when their leaf is created.
    pub fn with_initializer(config: GridConfig, init: fn(Coord<D>) -> T) -> GridResult<Self> {
        Ok(Self {
            tree: BoxTree::new(config, init, 0)?,
        })
    }

    pub(crate) fn from_tree(tree: BoxTree<T, D>) -> Self {
        Self { tree }
    }

    pub(crate) fn tree(&self) -> &BoxTree<T, D> {
        &self.tree
    }

    #[inline]
    pub fn config(&self) -> &GridConfig {
        self.tree.config()
    }

    fn leaf_for(&mut self, pos: &Coord<D>) -> GridResult<PoolPtr> {
        match self.tree.walk_to(pos)? {
            Landing::Leaf(leaf) => Ok(leaf),
            Landing::Vacant { parent, index } => Ok(self.tree.attach_new_leaf(parent, index)?),
            Landing::Special { .. } => panic!("GridBasic holds a collapsed region"),
        }
    }

    /// The value at `pos`, creating its leaf if needed.
    pub fn get(&mut self, pos: impl IntoCoord<D>) -> GridResult<&T> {
        let pos = pos.into_coord();
        let leaf = self.leaf_for(&pos)?;
        let offset = self.tree.offset_in(leaf, &pos);
        Ok(&self.tree.leaf_or_panic(leaf).cells[offset])
    }

    /// Mutable access to the value at `pos`, creating its leaf if needed.
    pub fn get_mut(&mut self, pos: impl IntoCoord<D>) -> GridResult<&mut T> {
        let pos = pos.into_coord();
        let leaf = self.leaf_for(&pos)?;
        let offset = self.tree.offset_in(leaf, &pos);
        Ok(&mut self.tree.leaf_mut_or_panic(leaf).cells[offset])
    }

    pub fn set(&mut self, pos: impl IntoCoord<D>, value: T) -> GridResult<()> {
        *self.get_mut(pos)? = value;
        Ok(())
    }

    /// The value at `pos` if its leaf exists. Never allocates and does not change [`GridBasic::pos_range`].
    ///
    /// Walks from a cursor shared by all unhinted peeks, so concurrent callers should prefer
    /// [`GridBasic::peek_hinted`].
    pub fn peek(&self, pos: impl IntoCoord<D>) -> Option<&T> {
        match self.tree.peek(&pos.into_coord(), None) {
            Some(Found::Cell(value)) => Some(value),
            _ => None,
        }
    }

    /// Like [`GridBasic::peek`], but walks from and updates the caller's `hint`.
    pub fn peek_hinted(&self, pos: impl IntoCoord<D>, hint: &mut PeekHint) -> Option<&T> {
        match self.tree.peek(&pos.into_coord(), Some(hint)) {
            Some(Found::Cell(value)) => Some(value),
            _ => None,
        }
    }

    /// The bounding box of every site passed to [`GridBasic::get`], [`GridBasic::get_mut`] or [`GridBasic::set`], or
    /// `None` if there was none.
    #[inline]
    pub fn pos_range(&self) -> Option<IBox<D>> {
        self.tree.range()
    }

    /// The value at `pos` and the singleton box if its leaf exists. Otherwise `None` and the largest box of the tree
    /// containing `pos` in which no site has been created.
    pub fn find_full_box(&mut self, pos: impl IntoCoord<D>) -> GridResult<(Option<&T>, IBox<D>)> {
        let (found, bounds) = self.tree.find_full_box(&pos.into_coord())?;
        Ok((cell(found), bounds))
    }

    /// Like [`GridBasic::find_full_box`], but prefers a cube centered on `pos` when one can be proven empty.
    pub fn find_full_box_centered(
        &mut self,
        pos: impl IntoCoord<D>,
    ) -> GridResult<(Option<&T>, IBox<D>)> {
        let (found, bounds) = self.tree.find_full_box_centered(&pos.into_coord())?;
        Ok((cell(found), bounds))
    }

    /// Removes every site, honoring [`GridConfig::call_destructors`].
    pub fn reset(&mut self) {
        let call_destructors = self.config().call_destructors;
        self.reset_with(call_destructors);
    }

    pub fn reset_with(&mut self, call_destructors: bool) {
        self.tree.reset_with(call_destructors);
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.tree.node_count()
    }

    #[inline]
    pub fn leaf_count(&self) -> usize {
        self.tree.leaf_count()
    }

    pub fn memory_used(&self) -> usize {
        self.tree.memory_used()
    }

    pub fn memory_footprint(&self) -> usize {
        self.tree.memory_footprint()
    }

    /// One line per box of the tree, children indented below their node.
    pub fn tree_string(&self) -> String {
        self.tree.tree_string()
    }
}

fn cell<T>(found: Option<Found<'_, T>>) -> Option<&T> {
    match found {
        Some(Found::Cell(value)) => Some(value),
        _ => None,
    }
}

impl<T: Clone, const D: usize> GridBasic<T, D> {
    /// A deep copy that shares nothing with `self`.
    pub fn try_clone(&self) -> GridResult<Self> {
        Ok(Self {
            tree: self.tree.try_clone()?,
        })
    }
}

impl<T: Clone, const D: usize> Clone for GridBasic<T, D> {
    fn clone(&self) -> Self {
        self.try_clone()
            .unwrap_or_else(|e| panic!("Failed to clone GridBasic: {}", e))
    }
}

impl<T: Archivable + Clone, const D: usize> GridBasic<T, D> {
    /// Writes the header, an empty special table and the tree.
    pub fn serialize<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> GridResult<()> {
        self.tree.write_header(ar, (1, 0))?;
        write_specials::<T, W>(ar, &[])?;
        self.tree.write_tree(ar)?;
        log::debug!("Serialized GridBasic with {} leaves", self.leaf_count());
        Ok(())
    }

    /// Replaces the content of the grid by an archive written by [`GridBasic::serialize`] or
    /// [`GridFactor::serialize`]. Collapsed regions are expanded.
    ///
    /// Either the whole archive is loaded or the grid is left empty and the error is returned.
    pub fn deserialize<R: ArchiveReader + ?Sized>(&mut self, ar: &mut R) -> GridResult<()> {
        self.reset();
        let result = self.read_archive(ar);
        match &result {
            Ok(()) => log::debug!("Deserialized GridBasic with {} leaves", self.leaf_count()),
            Err(e) => {
                log::warn!("Failed to deserialize GridBasic, resetting it: {}", e);
                self.reset();
            }
        }
        result
    }

    fn read_archive<R: ArchiveReader + ?Sized>(&mut self, ar: &mut R) -> GridResult<()> {
        let header = self.tree.read_header(ar)?;
        let specials = read_specials::<T, R>(ar)?;
        self.tree.read_tree(ar, &specials, &|_: &T| None)?;
        self.tree.set_range(header.range);
        Ok(())
    }
}

impl<T: Clone, const D: usize> TryFrom<&GridFactor<T, D>> for GridBasic<T, D> {
    type Error = GridError;

    /// Copies a factorizing grid that holds no collapsed region.
    fn try_from(grid: &GridFactor<T, D>) -> GridResult<Self> {
        let collapsed = grid.collapsed_total();
        if collapsed > 0 {
            return Err(GridError::CollapsedRegions(collapsed));
        }
        Ok(Self::from_tree(grid.tree().try_clone_with(0)?))
    }
}

impl<T, const D: usize> fmt::Display for GridBasic<T, D> {
    /// A short summary. The alternate form `{:#}` appends [`GridBasic::tree_string`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "GridBasic<{}, {}, {}>",
            D,
            std::any::type_name::<T>(),
            self.config().radius
        )?;
        writeln!(f, " - Memory used : {}MB", self.memory_footprint() / (1024 * 1024))?;
        match self.pos_range() {
            Some(range) => {
                writeln!(f, " - Range min = {:?}", range.min)?;
                writeln!(f, " - Range max = {:?}", range.max)?;
            }
            None => writeln!(f, " - Range empty")?,
        }
        if f.alternate() {
            write!(f, "\n{}", self.tree_string())?;
        }
        Ok(())
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    use crate::{ArchiveError, Token, TokenArchive};

    use ahash::AHashMap;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(radius: u64) -> GridConfig {
        GridConfig::for_dimension(2).with_radius(radius)
    }

    fn position_code(p: Coord<2>) -> i64 {
        p[0] * 100_000 + p[1]
    }

    #[test]
    fn set_then_get_in_one_leaf() {
        let mut grid = GridBasic::<i32, 2>::new(config(2)).unwrap();
        assert_eq!(grid.pos_range(), None);

        grid.set((0, 0), 5).unwrap();
        grid.set((1, 0), 5).unwrap();
        assert_eq!(*grid.get((0, 0)).unwrap(), 5);
        assert_eq!(grid.leaf_count(), 1);
        assert_eq!(grid.pos_range(), Some(IBox::new([0, 0], [1, 0])));

        assert_eq!(*grid.get([2, -2]).unwrap(), 0);
        assert_eq!(grid.leaf_count(), 1);
        assert_eq!(grid.pos_range(), Some(IBox::new([0, -2], [2, 0])));
    }

    #[test]
    fn positional_initializer() {
        let mut grid = GridBasic::with_initializer(config(3), position_code).unwrap();
        for p in [[0, 0], [-50, 7], [123, -456], [3, 3]] {
            assert_eq!(*grid.get(p).unwrap(), position_code(p));
        }
        *grid.get_mut([3, 3]).unwrap() += 1;
        assert_eq!(grid.peek([3, 3]), Some(&(position_code([3, 3]) + 1)));
        // The neighbor was initialized together with the leaf.
        assert_eq!(grid.peek([3, 2]), Some(&position_code([3, 2])));
    }

    #[test]
    fn out_of_range_coordinates() {
        let mut grid = GridBasic::<u8, 2>::new(config(2)).unwrap();
        assert_eq!(
            grid.set([i64::MIN, 0], 1),
            Err(GridError::OutOfRange(vec![i64::MIN, 0]))
        );
        assert_eq!(
            grid.get([0, i64::MIN]).err(),
            Some(GridError::OutOfRange(vec![0, i64::MIN]))
        );
        assert_eq!(grid.peek([i64::MAX, 0]), None);
        assert_eq!(grid.peek([i64::MIN, 0]), None);
        assert!(matches!(
            grid.find_full_box([i64::MIN, 0]),
            Err(GridError::OutOfRange(_))
        ));
        assert!(matches!(
            grid.find_full_box_centered([0, i64::MIN]),
            Err(GridError::OutOfRange(_))
        ));
        assert_eq!(grid.pos_range(), None);
        assert_eq!(grid.node_count(), 0);

        let far = crate::COORD_LIMIT;
        grid.set([far, -far], 3).unwrap();
        assert_eq!(*grid.get([far, -far]).unwrap(), 3);
        assert_eq!(grid.peek([0, 0]), None);
    }

    #[test]
    fn peek_never_allocates() {
        let mut grid = GridBasic::<i32, 2>::new(config(2)).unwrap();
        grid.set([0, 0], 1).unwrap();
        let before = (grid.node_count(), grid.leaf_count(), grid.pos_range());

        let mut hint = PeekHint::new();
        for p in [[10, 10], [-100, 3], [5, 0], [1_000_000, -1_000_000]] {
            assert_eq!(grid.peek(p), None);
            assert_eq!(grid.peek_hinted(p, &mut hint), None);
        }
        assert_eq!(grid.peek([0, 0]), Some(&1));
        assert_eq!(grid.peek_hinted([0, 0], &mut hint), Some(&1));
        assert_eq!((grid.node_count(), grid.leaf_count(), grid.pos_range()), before);
    }

    #[test]
    fn access_order_does_not_change_values() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut sites: Vec<Coord<2>> = (0..400)
            .map(|_| [rng.gen_range(-60..60), rng.gen_range(-60..60)])
            .collect();

        let mut writes = AHashMap::new();
        let mut grid = GridBasic::with_initializer(config(2), position_code).unwrap();
        for (i, &p) in sites.iter().enumerate() {
            if i % 3 == 0 {
                grid.set(p, -(i as i64)).unwrap();
                writes.insert(p, -(i as i64));
            }
        }
        let expected: Vec<i64> = sites.iter().map(|&p| *grid.get(p).unwrap()).collect();

        for _ in 0..3 {
            let mut shuffled = sites.clone();
            shuffled.shuffle(&mut rng);
            let mut other = GridBasic::with_initializer(config(2), position_code).unwrap();
            for p in shuffled.iter() {
                other.get(*p).unwrap();
            }
            for (&p, &v) in writes.iter() {
                other.set(p, v).unwrap();
            }
            let values: Vec<i64> = sites.iter().map(|&p| *other.get(p).unwrap()).collect();
            assert_eq!(values, expected);
        }

        sites.sort();
        for &p in sites.iter() {
            let want = writes.get(&p).copied().unwrap_or_else(|| position_code(p));
            assert_eq!(grid.peek(p), Some(&want));
        }
    }

    #[test]
    fn range_only_grows() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut grid = GridBasic::<u16, 2>::new(config(1)).unwrap();
        let mut previous: Option<IBox<2>> = None;
        let mut p = [0i64, 0];
        for _ in 0..2000 {
            p[rng.gen_range(0..2)] += rng.gen_range(-3..=3);
            if rng.gen_bool(0.5) {
                grid.get(p).unwrap();
            } else {
                grid.set(p, 1).unwrap();
            }
            grid.peek([p[0] + 1000, p[1]]);
            let range = grid.pos_range().unwrap();
            assert!(range.contains(&p));
            if let Some(previous) = previous {
                assert!(range.contains_box(&previous));
            }
            previous = Some(range);
        }
    }

    #[test]
    fn round_trip_through_archive() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut grid = GridBasic::<i32, 2>::new(config(2)).unwrap();
        let mut model = AHashMap::new();
        for _ in 0..500 {
            let p = [rng.gen_range(-40..40), rng.gen_range(-40..40)];
            let v = rng.gen_range(-1000..1000);
            grid.set(p, v).unwrap();
            model.insert(p, v);
        }

        let mut ar = TokenArchive::new();
        grid.serialize(&mut ar).unwrap();

        let mut loaded = GridBasic::<i32, 2>::new(config(2)).unwrap();
        loaded.set([500, 500], 1).unwrap();
        loaded.deserialize(&mut ar).unwrap();
        assert_eq!(ar.remaining(), 0);
        assert_eq!(loaded.pos_range(), grid.pos_range());
        assert_eq!(loaded.leaf_count(), grid.leaf_count());
        assert_eq!(loaded.node_count(), grid.node_count());
        assert_eq!(loaded.peek([500, 500]), None);
        for (&p, &v) in model.iter() {
            assert_eq!(loaded.peek(p), Some(&v));
        }
        for x in -40..40 {
            let p = [x, 39 - x];
            let want = model.get(&p).copied().unwrap_or(0);
            assert_eq!(*loaded.get(p).unwrap(), want);
        }
    }

    #[test]
    fn empty_grid_round_trip() {
        let grid = GridBasic::<String, 3>::new(GridConfig::for_dimension(3).with_radius(1)).unwrap();
        let mut ar = TokenArchive::new();
        grid.serialize(&mut ar).unwrap();
        let mut loaded = GridBasic::<String, 3>::new(GridConfig::for_dimension(3).with_radius(1)).unwrap();
        loaded.deserialize(&mut ar).unwrap();
        assert_eq!(loaded.pos_range(), None);
        assert_eq!(loaded.node_count(), 0);
    }

    #[test]
    fn header_mismatch_resets() {
        let mut grid = GridBasic::<i32, 2>::new(config(2)).unwrap();
        grid.set([0, 0], 9).unwrap();
        let mut ar = TokenArchive::new();
        grid.serialize(&mut ar).unwrap();

        let mut other_radius = GridBasic::<i32, 2>::new(config(3)).unwrap();
        other_radius.set([1, 1], 1).unwrap();
        let err = other_radius.deserialize(&mut ar).unwrap_err();
        assert!(matches!(
            err,
            GridError::Archive(ArchiveError::HeaderMismatch { field: "radius", .. })
        ));
        assert_eq!(other_radius.leaf_count(), 0);
        assert_eq!(other_radius.pos_range(), None);

        ar.rewind();
        let mut other_type = GridBasic::<u32, 2>::new(config(2)).unwrap();
        assert!(matches!(
            other_type.deserialize(&mut ar),
            Err(GridError::Archive(ArchiveError::HeaderMismatch {
                field: "type_name",
                ..
            }))
        ));
    }

    #[test]
    fn truncated_archive_leaves_grid_empty() {
        let mut grid = GridBasic::<i32, 2>::new(config(2)).unwrap();
        for x in 0..20 {
            grid.set([x * 3, -x], x as i32).unwrap();
        }
        let mut ar = TokenArchive::new();
        grid.serialize(&mut ar).unwrap();
        let mut tokens = ar.into_tokens();
        tokens.truncate(tokens.len() - 40);

        let mut loaded = GridBasic::<i32, 2>::new(config(2)).unwrap();
        let err = loaded
            .deserialize(&mut TokenArchive::from_tokens(tokens))
            .unwrap_err();
        assert_eq!(err, GridError::Archive(ArchiveError::UnexpectedEnd));
        assert_eq!(loaded.node_count(), 0);
        assert_eq!(loaded.leaf_count(), 0);
        assert_eq!(loaded.pos_range(), None);
    }

    #[test]
    fn misplaced_records_are_rejected() {
        let mut grid = GridBasic::<i32, 1>::new(GridConfig::for_dimension(1).with_radius(1)).unwrap();
        grid.set([0], 4).unwrap();
        let mut ar = TokenArchive::new();
        grid.serialize(&mut ar).unwrap();
        let mut tokens = ar.into_tokens();
        // Move the leaf away from the center it must have in its slot.
        let leaf = tokens
            .iter()
            .position(|t| *t == Token::Begin("leaf".into()))
            .unwrap();
        tokens[leaf + 1] = Token::Int(5);

        let mut loaded = GridBasic::<i32, 1>::new(GridConfig::for_dimension(1).with_radius(1)).unwrap();
        assert!(matches!(
            loaded.deserialize(&mut TokenArchive::from_tokens(tokens)),
            Err(GridError::Archive(ArchiveError::Malformed(_)))
        ));
        assert_eq!(loaded.node_count(), 0);
    }

    #[test]
    fn clones_are_deep() {
        let mut grid = GridBasic::<Vec<u8>, 2>::new(config(1)).unwrap();
        grid.get_mut([0, 0]).unwrap().push(1);
        grid.get_mut([9, 9]).unwrap().push(2);

        let copy = grid.clone();
        grid.get_mut([0, 0]).unwrap().push(3);
        assert_eq!(copy.peek([0, 0]), Some(&vec![1]));
        assert_eq!(copy.peek([9, 9]), Some(&vec![2]));
        assert_eq!(grid.peek([0, 0]), Some(&vec![1, 3]));
        assert_eq!(copy.leaf_count(), grid.leaf_count());
        assert_eq!(copy.pos_range(), grid.pos_range());
    }

    #[test]
    fn full_boxes() {
        let mut grid = GridBasic::<i32, 2>::new(config(2)).unwrap();
        grid.set([0, 0], 8).unwrap();

        assert_eq!(
            grid.find_full_box([0, 0]).unwrap(),
            (Some(&8), IBox::point([0, 0]))
        );
        // Any allocated cell is reported alone, whatever it holds.
        assert_eq!(
            grid.find_full_box([1, 2]).unwrap(),
            (Some(&0), IBox::point([1, 2]))
        );
        assert_eq!(
            grid.find_full_box([-4, 6]).unwrap(),
            (None, IBox::new([-7, 3], [-3, 7]))
        );
        let (value, bounds) = grid.find_full_box_centered([-40, 0]).unwrap();
        assert_eq!(value, None);
        assert!(bounds.contains(&[-40, 0]));
        assert_eq!(grid.peek([0, 0]), Some(&8));
        assert_eq!(grid.leaf_count(), 1);
    }

    #[test]
    fn hinted_peeks_from_many_threads() {
        let mut grid = GridBasic::with_initializer(config(3), position_code).unwrap();
        let mut sites = Vec::new();
        for x in (-90..90).step_by(5) {
            for y in (-90..90).step_by(11) {
                grid.get([x, y]).unwrap();
                sites.push([x, y]);
            }
        }

        let grid = &grid;
        let sites = &sites;
        std::thread::scope(|s| {
            for t in 0..4 {
                s.spawn(move || {
                    let mut hint = PeekHint::new();
                    for (i, &p) in sites.iter().enumerate().skip(t) {
                        assert_eq!(grid.peek_hinted(p, &mut hint), Some(&position_code(p)));
                        if i % 7 == 0 {
                            assert_eq!(grid.peek(p), Some(&position_code(p)));
                        }
                    }
                    assert_eq!(grid.peek_hinted([5000, 0], &mut hint), None);
                });
            }
        });
    }

    static COUNTED_DROPS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Debug, Default)]
    struct Counted;

    impl Drop for Counted {
        fn drop(&mut self) {
            COUNTED_DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    static ABANDONED_DROPS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Debug, Default)]
    struct Abandoned;

    impl Drop for Abandoned {
        fn drop(&mut self) {
            ABANDONED_DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn reset_drops_every_cell_once() {
        let mut grid = GridBasic::<Counted, 2>::new(config(1)).unwrap();
        grid.get([0, 0]).unwrap();
        grid.get([20, 0]).unwrap();
        assert_eq!(COUNTED_DROPS.load(Ordering::SeqCst), 0);
        grid.reset();
        assert_eq!(COUNTED_DROPS.load(Ordering::SeqCst), 18);
        assert_eq!(grid.leaf_count(), 0);

        grid.get([0, 0]).unwrap();
        drop(grid);
        assert_eq!(COUNTED_DROPS.load(Ordering::SeqCst), 27);
    }

    #[test]
    fn cells_can_be_abandoned() {
        let mut grid =
            GridBasic::<Abandoned, 2>::new(config(1).with_call_destructors(false)).unwrap();
        grid.get([0, 0]).unwrap();
        grid.reset();
        assert_eq!(ABANDONED_DROPS.load(Ordering::SeqCst), 0);
        grid.get([0, 0]).unwrap();
        grid.get([0, 30]).unwrap();
        drop(grid);
        assert_eq!(ABANDONED_DROPS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn display_summary() {
        let mut grid = GridBasic::<i32, 2>::new(config(2)).unwrap();
        assert!(grid.to_string().contains(" - Range empty"));
        grid.set([0, -1], 1).unwrap();
        let summary = grid.to_string();
        assert!(summary.starts_with("GridBasic<2, i32, 2>\n"));
        assert!(summary.contains(" - Range min = [0, -1]\n"));
        assert!(format!("{:#}", grid).contains(" Leaf: center = [0, 0]"));
    }
}
