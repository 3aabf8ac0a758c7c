use crate::grid_basic::default_cell;
use crate::tree::{BoxTree, Child, Found, Landing};
use crate::{
    Archivable, ArchiveError, ArchiveReader, ArchiveWriter, Coord, GridBasic, GridConfig, GridError,
    GridResult, IBox, IntoCoord, PeekHint, Pool, PoolError, PoolPtr, EMPTY_POOL_PTR,
};

use std::fmt;

/// The largest number of distinct special values a [`GridFactor`] can collapse.
pub const MAX_SPECIAL: usize = 256;

/// A value that may be collapsed by a [`GridFactor`].
///
/// Two values with the same key are considered interchangeable: a region where every cell has the key `k` in the
/// grid's [`SpecialRange`] is stored as a single shared object.
pub trait Factorizable {
    fn factor_key(&self) -> i64;
}

macro_rules! impl_factorizable {
    ($($t:ty),*) => {
        $(
            impl Factorizable for $t {
                #[inline]
                fn factor_key(&self) -> i64 {
                    *self as i64
                }
            }
        )*
    };
}

// Keys of unsigned values above `i64::MAX` wrap around.
impl_factorizable!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, bool, char);

/// The closed range `[min, max]` of keys eligible for factorization. Empty when `min > max`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SpecialRange {
    pub min: i64,
    pub max: i64,
}

impl SpecialRange {
    pub const EMPTY: Self = Self { min: 1, max: 0 };

    pub fn new(min: i64, max: i64) -> GridResult<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    /// The range holding only `key`.
    pub fn single(key: i64) -> Self {
        Self { min: key, max: key }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// The number of keys in the range.
    #[inline]
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.max as i128 - self.min as i128 + 1).min(u64::MAX as i128) as u64
        }
    }

    #[inline]
    pub fn contains(&self, key: i64) -> bool {
        self.min <= key && key <= self.max
    }

    /// The slot of `key`, if it is in the range.
    #[inline]
    pub fn slot(&self, key: i64) -> Option<u16> {
        self.contains(key)
            .then(|| (key as i128 - self.min as i128) as u16)
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.len() > MAX_SPECIAL as u64 {
            return Err(GridError::SpecialRangeTooLarge {
                min: self.min,
                max: self.max,
                capacity: MAX_SPECIAL,
            });
        }
        Ok(())
    }
}

impl Default for SpecialRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// The shared objects of the special values and the cell counters.
///
/// For every slot `s`, `occurrences[s]` is the number of materialized cells holding that value and `collapsed[s]` the
/// part of them that lives in collapsed regions; the rest is spread over the leaf counts. Together with `normal`, the
/// number of leaf cells holding no special value, the occurrences add up to every materialized cell.
struct SpecialTable<T> {
    range: SpecialRange,
    objects: Pool<T>,
    ptrs: Vec<PoolPtr>,
    occurrences: Vec<u64>,
    collapsed: Vec<u64>,
    normal: u64,
    call_destructors: bool,
}

impl<T> SpecialTable<T> {
    fn new(range: SpecialRange, config: &GridConfig) -> Self {
        let len = range.len() as usize;
        Self {
            range,
            objects: Pool::new(len.max(1)),
            ptrs: vec![EMPTY_POOL_PTR; len],
            occurrences: vec![0; len],
            collapsed: vec![0; len],
            normal: 0,
            call_destructors: config.call_destructors,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.ptrs.len()
    }

    #[inline]
    fn object(&self, slot: u16) -> Option<&T> {
        self.ptrs
            .get(slot as usize)
            .and_then(|&ptr| self.objects.get(ptr))
    }

    #[inline]
    fn object_or_panic(&self, slot: u16) -> &T {
        self.object(slot)
            .unwrap_or_else(|| panic!("Special slot {} has no object", slot))
    }

    /// Stores `value` as the shared object of `slot` unless it already has one.
    fn ensure_object(&mut self, slot: u16, value: T) -> Result<(), PoolError> {
        let ptr = &mut self.ptrs[slot as usize];
        if *ptr == EMPTY_POOL_PTR {
            *ptr = self.objects.allocate(value)?;
        }
        Ok(())
    }

    fn clear_counts(&mut self) {
        self.occurrences.iter_mut().for_each(|c| *c = 0);
        self.collapsed.iter_mut().for_each(|c| *c = 0);
        self.normal = 0;
    }

    fn reset_with(&mut self, call_destructors: bool) {
        if call_destructors {
            self.objects.destroy_all(false);
        } else {
            self.objects.deallocate_all(false);
        }
        self.ptrs.iter_mut().for_each(|p| *p = EMPTY_POOL_PTR);
        self.clear_counts();
    }
}

impl<T: Clone> SpecialTable<T> {
    fn try_clone(&self) -> Result<Self, PoolError> {
        let mut out = Self {
            range: self.range,
            objects: Pool::new(self.objects.chunk_len()),
            ptrs: vec![EMPTY_POOL_PTR; self.len()],
            occurrences: self.occurrences.clone(),
            collapsed: self.collapsed.clone(),
            normal: self.normal,
            call_destructors: self.call_destructors,
        };
        for slot in 0..self.len() {
            if let Some(value) = self.object(slot as u16) {
                out.ensure_object(slot as u16, value.clone())?;
            }
        }
        Ok(out)
    }
}

impl<T> Drop for SpecialTable<T> {
    fn drop(&mut self) {
        if !self.call_destructors {
            self.objects.deallocate_all(true);
        }
    }
}

pub(crate) fn write_specials<T: Archivable, W: ArchiveWriter + ?Sized>(
    ar: &mut W,
    objects: &[Option<&T>],
) -> Result<(), ArchiveError> {
    ar.begin_value("specials")?;
    (objects.len() as u64).archive(ar)?;
    for object in objects.iter() {
        match object {
            Some(value) => {
                ar.begin_value("value")?;
                value.archive(ar)?;
            }
            None => ar.begin_value("void")?,
        }
        ar.end_value()?;
    }
    ar.end_value()
}

pub(crate) fn read_specials<T: Archivable, R: ArchiveReader + ?Sized>(
    ar: &mut R,
) -> Result<Vec<Option<T>>, ArchiveError> {
    ar.expect_value("specials")?;
    let len = u64::unarchive(ar)?;
    if len > MAX_SPECIAL as u64 {
        return Err(ArchiveError::malformed(format!("{} special slots", len)));
    }
    let mut objects = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let tag = ar.read_begin()?;
        objects.push(match tag.as_str() {
            "value" => Some(T::unarchive(ar)?),
            "void" => None,
            _ => {
                return Err(ArchiveError::TagMismatch {
                    expected: "value|void".to_owned(),
                    found: tag,
                })
            }
        });
        ar.read_end()?;
    }
    ar.read_end()?;
    Ok(objects)
}

/// A [`GridBasic`] that collapses uniform regions.
///
/// Whenever every cell of a leaf holds a value whose [`Factorizable::factor_key`] is in the grid's [`SpecialRange`],
/// the leaf is destroyed and replaced by a reference to a single shared copy of that value. Nodes whose children all
/// reference the same value are collapsed in turn. Writing a different value inside a collapsed region expands it
/// again, one level at a time, down to a fresh leaf.
///
/// Cells are only ever modified through [`GridFactor::set`] so that the bookkeeping stays exact.
pub struct GridFactor<T, const D: usize> {
    tree: BoxTree<T, D>,
    table: SpecialTable<T>,
}

impl<T: Clone + Default + Factorizable, const D: usize> GridFactor<T, D> {
    pub fn new(config: GridConfig, special: SpecialRange) -> GridResult<Self> {
        Self::with_initializer(config, special, default_cell::<T, D>)
    }
}

impl<T, const D: usize> GridFactor<T, D> {
    pub(crate) fn tree(&self) -> &BoxTree<T, D> {
        &self.tree
    }

    #[inline]
    pub fn config(&self) -> &GridConfig {
        self.tree.config()
    }

    #[inline]
    pub fn special_range(&self) -> SpecialRange {
        self.table.range
    }

    /// The number of materialized cells that hold no special value.
    #[inline]
    pub fn normal_cells(&self) -> u64 {
        self.table.normal
    }

    /// The number of cells living in collapsed regions, over every special value.
    pub fn collapsed_total(&self) -> u64 {
        self.table
            .collapsed
            .iter()
            .fold(0u64, |acc, &c| acc.saturating_add(c))
    }

    #[inline]
    pub fn pos_range(&self) -> Option<IBox<D>> {
        self.tree.range()
    }

    /// Removes every site and every shared object, honoring [`GridConfig::call_destructors`].
    pub fn reset(&mut self) {
        let call_destructors = self.config().call_destructors;
        self.reset_with(call_destructors);
    }

    pub fn reset_with(&mut self, call_destructors: bool) {
        self.tree.reset_with(call_destructors);
        self.table.reset_with(call_destructors);
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
        self.tree.memory_used() + self.table.objects.used()
    }

    pub fn memory_footprint(&self) -> usize {
        self.tree.memory_footprint() + self.table.objects.footprint()
    }

    pub fn tree_string(&self) -> String {
        self.tree.tree_string()
    }

    fn resolve<'a>(table: &'a SpecialTable<T>, found: Option<Found<'a, T>>) -> Option<&'a T> {
        match found {
            Some(Found::Cell(value)) => Some(value),
            Some(Found::Special(slot)) => table.object(slot),
            None => None,
        }
    }

    /// The value at `pos` if it is materialized. Cells of a collapsed region all return the same shared object. Never
    /// allocates.
    pub fn peek(&self, pos: impl IntoCoord<D>) -> Option<&T> {
        Self::resolve(&self.table, self.tree.peek(&pos.into_coord(), None))
    }

    pub fn peek_hinted(&self, pos: impl IntoCoord<D>, hint: &mut PeekHint) -> Option<&T> {
        Self::resolve(&self.table, self.tree.peek(&pos.into_coord(), Some(hint)))
    }

    /// See [`GridBasic::find_full_box`]. A collapsed region is reported with its shared object and its bounds.
    pub fn find_full_box(&mut self, pos: impl IntoCoord<D>) -> GridResult<(Option<&T>, IBox<D>)> {
        let (found, bounds) = self.tree.find_full_box(&pos.into_coord())?;
        Ok((Self::resolve(&self.table, found), bounds))
    }

    pub fn find_full_box_centered(
        &mut self,
        pos: impl IntoCoord<D>,
    ) -> GridResult<(Option<&T>, IBox<D>)> {
        let (found, bounds) = self.tree.find_full_box_centered(&pos.into_coord())?;
        Ok((Self::resolve(&self.table, found), bounds))
    }
}

impl<T: Factorizable, const D: usize> GridFactor<T, D> {
    #[inline]
    fn slot_of(&self, value: &T) -> Option<u16> {
        self.table.range.slot(value.factor_key())
    }

    #[inline]
    pub fn is_special(&self, value: &T) -> bool {
        self.slot_of(value).is_some()
    }

    /// The shared object of the special value `value`, if some region was ever collapsed to it.
    pub fn special_object(&self, value: &T) -> Option<&T> {
        self.slot_of(value).and_then(|slot| self.table.object(slot))
    }

    /// The number of cells holding `value` that live in collapsed regions.
    pub fn collapsed_cells(&self, value: &T) -> u64 {
        self.slot_of(value)
            .map_or(0, |slot| self.table.collapsed[slot as usize])
    }

    /// The number of materialized cells holding `value`, collapsed or not.
    pub fn special_cells(&self, value: &T) -> u64 {
        self.slot_of(value)
            .map_or(0, |slot| self.table.occurrences[slot as usize])
    }

    /// Counts the special cells of a fresh leaf. Returns the slot the leaf is uniform in, if any.
    fn count_leaf(&mut self, leaf: PoolPtr) -> Option<u16> {
        let range = self.table.range;
        let leaf = self.tree.leaf_mut_or_panic(leaf);
        leaf.counts.iter_mut().for_each(|c| *c = 0);
        for cell in leaf.cells.iter() {
            match range.slot(cell.factor_key()) {
                Some(slot) => {
                    leaf.counts[slot as usize] += 1;
                    self.table.occurrences[slot as usize] += 1;
                }
                None => self.table.normal += 1,
            }
        }
        let len = leaf.cells.len();
        leaf.counts
            .iter()
            .position(|&c| c as usize == len)
            .map(|slot| slot as u16)
    }
}

impl<T: Clone + Factorizable, const D: usize> GridFactor<T, D> {
    /// Creates an empty grid whose cells are initialized with `init(site)` when their leaf is created.
    pub fn with_initializer(
        config: GridConfig,
        special: SpecialRange,
        init: fn(Coord<D>) -> T,
    ) -> GridResult<Self> {
        special.validate()?;
        Ok(Self {
            tree: BoxTree::new(config, init, special.len() as usize)?,
            table: SpecialTable::new(special, &config),
        })
    }

    /// Destroys the uniform leaf `leaf` and collapses as many of its ancestors as possible.
    fn collapse(&mut self, leaf: PoolPtr, slot: u16) -> GridResult<()> {
        let (value, len) = {
            let leaf = self.tree.leaf_or_panic(leaf);
            (leaf.cells[0].clone(), leaf.cells.len() as u64)
        };
        self.table.ensure_object(slot, value)?;
        let parent = self.tree.collapse_leaf(leaf, slot);
        self.table.collapsed[slot as usize] += len;
        self.tree.propagate_collapse(parent, slot);
        Ok(())
    }

    fn expand(&mut self, parent: PoolPtr, index: usize, slot: u16) -> GridResult<()> {
        let value = self.table.object_or_panic(slot);
        if let Child::Leaf(leaf) = self.tree.expand_special(parent, index, slot, value)? {
            let leaf = self.tree.leaf_mut_or_panic(leaf);
            let len = leaf.cells.len();
            leaf.counts[slot as usize] = len as u32;
            self.table.collapsed[slot as usize] -= len as u64;
        }
        Ok(())
    }

    /// Creates the leaf of an empty slot, collapsing it right away if it is uniform. Returns what the slot holds.
    fn attach_leaf(&mut self, parent: PoolPtr, index: usize) -> GridResult<Child> {
        let leaf = self.tree.attach_new_leaf(parent, index)?;
        match self.count_leaf(leaf) {
            Some(slot) => {
                self.collapse(leaf, slot)?;
                Ok(Child::Special(slot))
            }
            None => Ok(Child::Leaf(leaf)),
        }
    }

    /// The value at `pos`, creating its leaf if needed. Inside a collapsed region this is the shared object.
    pub fn get(&mut self, pos: impl IntoCoord<D>) -> GridResult<&T> {
        let pos = pos.into_coord();
        let leaf = match self.tree.walk_to(&pos)? {
            Landing::Leaf(leaf) => leaf,
            Landing::Special { slot, .. } => return Ok(self.table.object_or_panic(slot)),
            Landing::Vacant { parent, index } => match self.attach_leaf(parent, index)? {
                Child::Leaf(leaf) => leaf,
                Child::Special(slot) => return Ok(self.table.object_or_panic(slot)),
                other => panic!("Attaching a leaf produced {:?}", other),
            },
        };
        let offset = self.tree.offset_in(leaf, &pos);
        Ok(&self.tree.leaf_or_panic(leaf).cells[offset])
    }

    /// Writes `value` at `pos`, expanding a collapsed region or collapsing a leaf that becomes uniform.
    pub fn set(&mut self, pos: impl IntoCoord<D>, value: T) -> GridResult<()> {
        let pos = pos.into_coord();
        let new_slot = self.slot_of(&value);
        loop {
            match self.tree.walk_to(&pos)? {
                Landing::Leaf(leaf) => return self.write_cell(leaf, &pos, value, new_slot),
                Landing::Vacant { parent, index } => {
                    self.attach_leaf(parent, index)?;
                }
                Landing::Special { slot, .. } if new_slot == Some(slot) => return Ok(()),
                Landing::Special {
                    parent,
                    index,
                    slot,
                } => self.expand(parent, index, slot)?,
            }
        }
    }

    fn write_cell(
        &mut self,
        leaf: PoolPtr,
        pos: &Coord<D>,
        value: T,
        new_slot: Option<u16>,
    ) -> GridResult<()> {
        let range = self.table.range;
        let offset = self.tree.offset_in(leaf, pos);
        let cell = self.tree.leaf_mut_or_panic(leaf);
        match range.slot(cell.cells[offset].factor_key()) {
            Some(slot) => {
                cell.counts[slot as usize] -= 1;
                self.table.occurrences[slot as usize] -= 1;
            }
            None => self.table.normal -= 1,
        }
        match new_slot {
            Some(slot) => {
                cell.counts[slot as usize] += 1;
                self.table.occurrences[slot as usize] += 1;
            }
            None => self.table.normal += 1,
        }
        cell.cells[offset] = value;
        let uniform = new_slot.filter(|&slot| cell.counts[slot as usize] as usize == cell.cells.len());
        if let Some(slot) = uniform {
            self.collapse(leaf, slot)?;
        }
        Ok(())
    }

    /// A deep copy that shares nothing with `self`.
    pub fn try_clone(&self) -> GridResult<Self> {
        Ok(Self {
            tree: self.tree.try_clone()?,
            table: self.table.try_clone()?,
        })
    }

    /// Copies a basic grid, collapsing every leaf that turns out uniform in `special`.
    pub fn from_basic(grid: &GridBasic<T, D>, special: SpecialRange) -> GridResult<Self> {
        special.validate()?;
        let mut out = Self {
            tree: grid.tree().try_clone_with(special.len() as usize)?,
            table: SpecialTable::new(special, grid.config()),
        };
        out.rebuild_counts()?;
        Ok(out)
    }

    /// Recomputes every counter from the tree, then collapses the uniform leaves and nodes.
    fn rebuild_counts(&mut self) -> GridResult<()> {
        self.table.clear_counts();
        let table = &mut self.table;
        self.tree.for_each_special(|slot, sites| {
            let slot = slot as usize;
            table.collapsed[slot] = table.collapsed[slot].saturating_add(sites);
            table.occurrences[slot] = table.occurrences[slot].saturating_add(sites);
        });
        let leaves: Vec<PoolPtr> = self.tree.leaves().map(|(ptr, _)| ptr).collect();
        let mut uniform = Vec::new();
        for leaf in leaves {
            if let Some(slot) = self.count_leaf(leaf) {
                uniform.push((leaf, slot));
            }
        }
        for (leaf, slot) in uniform {
            self.collapse(leaf, slot)?;
        }
        self.tree.collapse_uniform_nodes();
        Ok(())
    }
}

impl<T: Clone + Factorizable, const D: usize> Clone for GridFactor<T, D> {
    fn clone(&self) -> Self {
        self.try_clone()
            .unwrap_or_else(|e| panic!("Failed to clone GridFactor: {}", e))
    }
}

impl<T: Archivable + Clone + Factorizable, const D: usize> GridFactor<T, D> {
    /// Writes the header, the shared objects and the tree, collapsed regions included.
    pub fn serialize<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> GridResult<()> {
        let range = self.table.range;
        self.tree.write_header(ar, (range.min, range.max))?;
        let objects: Vec<Option<&T>> = (0..self.table.len())
            .map(|slot| self.table.object(slot as u16))
            .collect();
        write_specials(ar, &objects)?;
        self.tree.write_tree(ar)?;
        log::debug!(
            "Serialized GridFactor with {} leaves and {} collapsed cells",
            self.leaf_count(),
            self.collapsed_total()
        );
        Ok(())
    }

    /// Replaces the content of the grid by an archive written by [`GridFactor::serialize`] or
    /// [`GridBasic::serialize`].
    ///
    /// Collapsed regions whose value is special for this grid stay collapsed, the others are expanded, and leaves that
    /// turn out uniform are collapsed. Either the whole archive is loaded or the grid is left empty and the error is
    /// returned.
    pub fn deserialize<R: ArchiveReader + ?Sized>(&mut self, ar: &mut R) -> GridResult<()> {
        self.reset();
        let result = self.read_archive(ar);
        match &result {
            Ok(()) => log::debug!(
                "Deserialized GridFactor with {} leaves and {} collapsed cells",
                self.leaf_count(),
                self.collapsed_total()
            ),
            Err(e) => {
                log::warn!("Failed to deserialize GridFactor, resetting it: {}", e);
                self.reset();
            }
        }
        result
    }

    fn read_archive<R: ArchiveReader + ?Sized>(&mut self, ar: &mut R) -> GridResult<()> {
        let header = self.tree.read_header(ar)?;
        let specials = read_specials::<T, R>(ar)?;
        let range = self.table.range;
        if header.special != (range.min, range.max) {
            log::debug!(
                "Remapping special values [{}, {}] of the archive to [{}, {}]",
                header.special.0,
                header.special.1,
                range.min,
                range.max
            );
        }
        if header.call_destructors != self.config().call_destructors {
            log::debug!("Archive was written with call_destructors = {}", header.call_destructors);
        }
        self.tree
            .read_tree(ar, &specials, &|value: &T| range.slot(value.factor_key()))?;
        for value in specials.iter().flatten() {
            if let Some(slot) = range.slot(value.factor_key()) {
                self.table.ensure_object(slot, value.clone())?;
            }
        }
        self.tree.set_range(header.range);
        self.rebuild_counts()
    }
}

impl<T, const D: usize> fmt::Display for GridFactor<T, D> {
    /// A short summary. The alternate form `{:#}` appends [`GridFactor::tree_string`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "GridFactor<{}, {}, {}>",
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
        let special = self.special_range();
        if special.is_empty() {
            writeln!(f, " - No special values")?;
        } else {
            writeln!(f, " - Special values in [{}, {}]", special.min, special.max)?;
        }
        writeln!(f, " - Normal cells = {}", self.normal_cells())?;
        writeln!(f, " - Collapsed cells = {}", self.collapsed_total())?;
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
