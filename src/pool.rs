use crate::PoolError;

use std::mem;

/// Points to an object owned by a [`Pool`].
pub type PoolPtr = u32;

/// A [`PoolPtr`] that doesn't point to anything.
pub const EMPTY_POOL_PTR: PoolPtr = PoolPtr::MAX;

/// The top bit of a [`PoolPtr`] is reserved so that callers may tag pointers, and the largest untagged value is kept
/// free so that a tagged pointer never equals [`EMPTY_POOL_PTR`].
const MAX_SLOTS: usize = (1 << 31) - 1;

#[derive(Debug)]
enum Slot<T> {
    /// Free slots form a singly linked list threaded through the storage itself.
    Vacant { next_free: PoolPtr },
    Occupied(T),
}

/// Serves storage for one `T` at a time out of fixed size chunks.
///
/// Chunks are requested from the system allocator `chunk_len` slots at a time and are kept until the pool is dropped
/// or a bulk release explicitly asks for them to be returned, so [`Pool::footprint`] never decreases otherwise. A
/// released slot is pushed on the free list and handed out again before any fresh slot.
///
/// Objects still allocated when the pool is dropped are dropped with it. Use [`Pool::deallocate_all`] first to abandon
/// them instead.
#[derive(Debug)]
pub struct Pool<T> {
    chunks: Vec<Box<[Slot<T>]>>,
    chunk_len: usize,
    first_free: PoolPtr,
    /// Number of slots ever handed out by bumping, counted from the start of the first chunk.
    bumped: usize,
    live: usize,
    footprint: usize,
}

impl<T> Pool<T> {
    /// Creates an empty pool. No memory is requested until the first allocation.
    pub fn new(chunk_len: usize) -> Self {
        assert!(chunk_len > 0);
        Self {
            chunks: Vec::new(),
            chunk_len,
            first_free: EMPTY_POOL_PTR,
            bumped: 0,
            live: 0,
            footprint: 0,
        }
    }

    #[inline]
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// The number of objects currently allocated.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Bytes currently occupied by live objects.
    #[inline]
    pub fn used(&self) -> usize {
        self.live * mem::size_of::<T>()
    }

    /// Bytes of chunk storage requested from the system and still held by the pool.
    #[inline]
    pub fn footprint(&self) -> usize {
        self.footprint
    }

    /// Moves `value` into a free slot and returns its pointer.
    pub fn allocate(&mut self, value: T) -> Result<PoolPtr, PoolError> {
        if self.first_free != EMPTY_POOL_PTR {
            let ptr = self.first_free;
            let slot = self.slot_mut(ptr);
            let next_free = match slot {
                Slot::Vacant { next_free } => *next_free,
                Slot::Occupied(_) => panic!("Pool free list points at occupied slot {}", ptr),
            };
            *slot = Slot::Occupied(value);
            self.first_free = next_free;
            self.live += 1;
            return Ok(ptr);
        }

        if self.bumped == MAX_SLOTS {
            return Err(PoolError::CapacityExceeded { max: MAX_SLOTS });
        }
        if self.bumped == self.chunks.len() * self.chunk_len {
            self.grow()?;
        }
        let ptr = self.bumped as PoolPtr;
        *self.slot_mut(ptr) = Slot::Occupied(value);
        self.bumped += 1;
        self.live += 1;
        Ok(ptr)
    }

    /// Releases the slot at `ptr` *without* dropping its object. Returns false if nothing was allocated there.
    #[inline]
    pub fn deallocate(&mut self, ptr: PoolPtr) -> bool {
        match self.vacate(ptr) {
            Some(value) => {
                mem::forget(value);
                true
            }
            None => false,
        }
    }

    /// Drops the object at `ptr` and releases its slot. Returns false if nothing was allocated there.
    #[inline]
    pub fn destroy(&mut self, ptr: PoolPtr) -> bool {
        self.vacate(ptr).is_some()
    }

    /// Moves the object at `ptr` out of the pool and releases its slot.
    #[inline]
    pub fn take(&mut self, ptr: PoolPtr) -> Option<T> {
        self.vacate(ptr)
    }

    #[inline]
    pub fn contains(&self, ptr: PoolPtr) -> bool {
        self.get(ptr).is_some()
    }

    #[inline]
    pub fn get(&self, ptr: PoolPtr) -> Option<&T> {
        if ptr as usize >= self.bumped {
            return None;
        }
        match self.slot(ptr) {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, ptr: PoolPtr) -> Option<&mut T> {
        if ptr as usize >= self.bumped {
            return None;
        }
        match self.slot_mut(ptr) {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Iterates over all live objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (PoolPtr, &T)> + '_ {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.iter())
            .take(self.bumped)
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied(value) => Some((i as PoolPtr, value)),
                Slot::Vacant { .. } => None,
            })
    }

    /// Calls `f` on every live object in slot order.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(PoolPtr, &mut T)) {
        let bumped = self.bumped;
        for (i, slot) in self
            .chunks
            .iter_mut()
            .flat_map(|chunk| chunk.iter_mut())
            .take(bumped)
            .enumerate()
        {
            if let Slot::Occupied(value) = slot {
                f(i as PoolPtr, value);
            }
        }
    }

    /// Releases every slot *without* dropping the objects they hold.
    ///
    /// If `release_to_os` is true, the chunks themselves are returned to the system allocator.
    pub fn deallocate_all(&mut self, release_to_os: bool) {
        let bumped = self.bumped;
        for slot in self
            .chunks
            .iter_mut()
            .flat_map(|chunk| chunk.iter_mut())
            .take(bumped)
        {
            if let Slot::Occupied(value) = mem::replace(
                slot,
                Slot::Vacant {
                    next_free: EMPTY_POOL_PTR,
                },
            ) {
                mem::forget(value);
            }
        }
        self.release(release_to_os);
    }

    /// Drops every object that is still allocated, exactly once, then releases every slot.
    ///
    /// No registry of live slots is kept: the chunks are scanned and a slot is live iff it is not a member of the
    /// free list, which the slot itself records.
    pub fn destroy_all(&mut self, release_to_os: bool) {
        let bumped = self.bumped;
        for slot in self
            .chunks
            .iter_mut()
            .flat_map(|chunk| chunk.iter_mut())
            .take(bumped)
        {
            if matches!(slot, Slot::Occupied(_)) {
                *slot = Slot::Vacant {
                    next_free: EMPTY_POOL_PTR,
                };
            }
        }
        self.live = 0;
        self.deallocate_all(release_to_os);
    }

    fn release(&mut self, release_to_os: bool) {
        if release_to_os {
            self.chunks = Vec::new();
            self.footprint = 0;
        }
        self.first_free = EMPTY_POOL_PTR;
        self.bumped = 0;
        self.live = 0;
    }

    fn vacate(&mut self, ptr: PoolPtr) -> Option<T> {
        if !self.contains(ptr) {
            return None;
        }
        let first_free = self.first_free;
        let old = mem::replace(
            self.slot_mut(ptr),
            Slot::Vacant {
                next_free: first_free,
            },
        );
        match old {
            Slot::Occupied(value) => {
                self.first_free = ptr;
                self.live -= 1;
                Some(value)
            }
            Slot::Vacant { .. } => unreachable!(),
        }
    }

    fn grow(&mut self) -> Result<(), PoolError> {
        let bytes = self.chunk_len * mem::size_of::<Slot<T>>();
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(self.chunk_len)
            .map_err(|_| PoolError::Exhausted { requested: bytes })?;
        self.chunks
            .try_reserve(1)
            .map_err(|_| PoolError::Exhausted {
                requested: mem::size_of::<Box<[Slot<T>]>>(),
            })?;
        chunk.extend((0..self.chunk_len).map(|_| Slot::Vacant {
            next_free: EMPTY_POOL_PTR,
        }));
        self.chunks.push(chunk.into_boxed_slice());
        self.footprint += bytes;
        log::debug!(
            "Pool<{}> grew to {} chunks ({} bytes)",
            std::any::type_name::<T>(),
            self.chunks.len(),
            self.footprint
        );
        Ok(())
    }

    #[inline]
    fn slot(&self, ptr: PoolPtr) -> &Slot<T> {
        let i = ptr as usize;
        &self.chunks[i / self.chunk_len][i % self.chunk_len]
    }

    #[inline]
    fn slot_mut(&mut self, ptr: PoolPtr) -> &mut Slot<T> {
        let i = ptr as usize;
        &mut self.chunks[i / self.chunk_len][i % self.chunk_len]
    }
}

/// Builds a boxed slice of `len` elements, reporting allocation failure instead of aborting.
pub(crate) fn try_boxed_slice<X>(
    len: usize,
    f: impl FnMut(usize) -> X,
) -> Result<Box<[X]>, PoolError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| PoolError::Exhausted {
            requested: len.saturating_mul(mem::size_of::<X>()),
        })?;
    v.extend((0..len).map(f));
    Ok(v.into_boxed_slice())
}

/// Frees a cell buffer without running the destructors of its elements.
pub(crate) fn abandon_slice<X>(cells: Box<[X]>) {
    cells.into_vec().into_iter().for_each(mem::forget);
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

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn drops(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }

    #[test]
    fn allocate_and_get() {
        let mut pool = Pool::new(4);
        assert_eq!(pool.footprint(), 0);

        let a = pool.allocate("a").unwrap();
        let b = pool.allocate("b").unwrap();
        assert_eq!(pool.get(a), Some(&"a"));
        assert_eq!(pool.get(b), Some(&"b"));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.used(), 2 * mem::size_of::<&str>());
        assert!(pool.footprint() > 0);
        assert_eq!(pool.get(7), None);
        assert_eq!(pool.get(EMPTY_POOL_PTR), None);
    }

    #[test]
    fn freed_slots_are_reused_first() {
        let mut pool = Pool::new(2);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        let c = pool.allocate(3).unwrap();
        let footprint = pool.footprint();

        assert!(pool.destroy(b));
        assert!(!pool.destroy(b));
        assert!(!pool.contains(b));
        assert_eq!(pool.len(), 2);

        let d = pool.allocate(4).unwrap();
        assert_eq!(d, b);
        assert_eq!(pool.get(d), Some(&4));
        assert_eq!(pool.footprint(), footprint);

        assert_eq!(pool.take(a), Some(1));
        assert_eq!(pool.take(a), None);
        let e = pool.allocate(5).unwrap();
        assert_eq!(e, a);

        let live: Vec<_> = pool.iter().map(|(ptr, &v)| (ptr, v)).collect();
        assert_eq!(live, vec![(a, 5), (b, 4), (c, 3)]);
    }

    #[test]
    fn footprint_grows_by_chunks() {
        let mut pool = Pool::new(3);
        pool.allocate(0u64).unwrap();
        let one_chunk = pool.footprint();
        pool.allocate(1).unwrap();
        pool.allocate(2).unwrap();
        assert_eq!(pool.footprint(), one_chunk);
        pool.allocate(3).unwrap();
        assert_eq!(pool.footprint(), 2 * one_chunk);
    }

    #[test]
    fn deallocate_skips_destructor() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = Pool::new(8);
        let a = pool.allocate(Tracked(counter.clone())).unwrap();
        let b = pool.allocate(Tracked(counter.clone())).unwrap();

        assert!(pool.deallocate(a));
        assert_eq!(drops(&counter), 0);
        assert!(pool.destroy(b));
        assert_eq!(drops(&counter), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn destroy_all_drops_each_live_object_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = Pool::new(3);
        let ptrs: Vec<_> = (0..10)
            .map(|_| pool.allocate(Tracked(counter.clone())).unwrap())
            .collect();
        // Punch holes so the free list interleaves with live slots.
        for &ptr in ptrs.iter().step_by(3) {
            pool.destroy(ptr);
        }
        assert_eq!(drops(&counter), 4);
        let footprint = pool.footprint();

        pool.destroy_all(false);
        assert_eq!(drops(&counter), 10);
        assert!(pool.is_empty());
        assert_eq!(pool.footprint(), footprint);

        // Storage is reused from the start after a bulk release.
        assert_eq!(pool.allocate(Tracked(counter.clone())).unwrap(), 0);
        pool.destroy_all(true);
        assert_eq!(drops(&counter), 11);
        assert_eq!(pool.footprint(), 0);
    }

    #[test]
    fn deallocate_all_abandons_objects() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = Pool::new(4);
        for _ in 0..6 {
            pool.allocate(Tracked(counter.clone())).unwrap();
        }
        pool.deallocate_all(true);
        assert_eq!(drops(&counter), 0);
        assert!(pool.is_empty());
        assert_eq!(pool.footprint(), 0);
        assert_eq!(pool.iter().count(), 0);
    }

    #[test]
    fn dropping_pool_drops_live_objects() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut pool = Pool::new(2);
            for _ in 0..5 {
                pool.allocate(Tracked(counter.clone())).unwrap();
            }
        }
        assert_eq!(drops(&counter), 5);
    }

    #[test]
    fn abandoned_slice_skips_destructors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cells = try_boxed_slice(4, |_| Tracked(counter.clone())).unwrap();
        assert_eq!(cells.len(), 4);
        abandon_slice(cells);
        assert_eq!(drops(&counter), 0);

        let cells = try_boxed_slice(3, |_| Tracked(counter.clone())).unwrap();
        drop(cells);
        assert_eq!(drops(&counter), 3);
    }

    #[test]
    fn for_each_mut_visits_live_objects() {
        let mut pool = Pool::new(2);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        let c = pool.allocate(3).unwrap();
        pool.destroy(b);
        pool.for_each_mut(|_, v| *v *= 10);
        assert_eq!(pool.get(a), Some(&10));
        assert_eq!(pool.get(c), Some(&30));
    }
}
