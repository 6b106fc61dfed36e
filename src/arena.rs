//! The owning pool allocator.
//!
//! [`PoolArena`] layers ownership and automatic growth on top of the
//! non-owning pool: backing regions are requested from an upstream
//! [`Allocator`], every region is remembered in a span list (itself
//! allocated from the upstream allocator, so the arena works without a
//! global allocator), and exhaustion triggers a geometric growth request
//! instead of failing. On drop, every span is returned to the upstream
//! allocator.

use core::alloc::Layout;
use core::ptr;
use core::ptr::NonNull;

use crate::pool::{
    self, Chunk, ChunkTree, Lock, Mutex, Request, SingleThreadedLock, CHUNK_ALIGN, MIN_CHUNK,
};
use crate::{AllocError, Allocator};

/// One backing region obtained from the upstream allocator.
#[derive(Clone, Copy)]
struct Span {
    base: NonNull<u8>,
    len: usize,
}

impl Span {
    fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr().addr();
        addr >= base && addr < base + self.len
    }

    fn layout(&self) -> Layout {
        // Safety: the span was allocated with exactly this size and
        // alignment, so it was a valid layout then and still is.
        unsafe { Layout::from_size_align_unchecked(self.len, CHUNK_ALIGN) }
    }
}

/// The arena's record of every span it owns, stored in an array that is
/// itself allocated from the upstream allocator and reallocated on push.
struct SpanList {
    spans: *mut Span,
    len: usize,
}

// Safety: the list exclusively owns its backing array.
unsafe impl Send for SpanList {}

impl SpanList {
    const fn new() -> Self {
        SpanList {
            spans: ptr::null_mut(),
            len: 0,
        }
    }

    fn as_slice(&self) -> &[Span] {
        if self.spans.is_null() {
            &[]
        } else {
            unsafe { core::slice::from_raw_parts(self.spans, self.len) }
        }
    }

    /// Append a span, reallocating the array from `upstream`. On failure the
    /// list is left untouched.
    fn push<A>(&mut self, span: Span, upstream: &A) -> Result<(), AllocError>
    where
        A: Allocator,
    {
        let new_layout = Layout::array::<Span>(self.len + 1).map_err(|_| AllocError)?;
        let new_spans: NonNull<Span> = upstream.allocate(new_layout)?.cast();
        unsafe {
            if !self.spans.is_null() {
                let old_layout = Layout::array::<Span>(self.len)
                    .expect("span array was allocated with this layout");
                ptr::copy_nonoverlapping(self.spans, new_spans.as_ptr(), self.len);
                upstream.deallocate(NonNull::new_unchecked(self.spans).cast(), old_layout);
            }
            new_spans.as_ptr().add(self.len).write(span);
        }
        self.spans = new_spans.as_ptr();
        self.len += 1;
        Ok(())
    }

    fn total(&self) -> usize {
        self.as_slice().iter().map(|span| span.len).sum()
    }

    fn contains(&self, addr: usize) -> bool {
        self.as_slice().iter().any(|span| span.contains(addr))
    }

    /// Return every span, and the array itself, to `upstream`.
    fn release<A>(&mut self, upstream: &A)
    where
        A: Allocator,
    {
        if self.spans.is_null() {
            return;
        }
        unsafe {
            for i in 0..self.len {
                let span = *self.spans.add(i);
                upstream.deallocate(span.base, span.layout());
            }
            let array_layout = Layout::array::<Span>(self.len)
                .expect("span array was allocated with this layout");
            upstream.deallocate(NonNull::new_unchecked(self.spans).cast(), array_layout);
        }
        self.spans = ptr::null_mut();
        self.len = 0;
    }
}

struct ArenaState {
    tree: ChunkTree,
    spans: SpanList,
}

/// A pool allocator that owns its memory.
///
/// Backing regions come from the upstream allocator `A` and are tracked so
/// that [`PoolArena::release`] (and `Drop`) can return all of them. When an
/// allocation cannot be satisfied, the arena grows by
/// `max(2 * needed, total_size / 2)` and retries: always at least double
/// what was immediately needed, and proportionally more as the pool gets
/// bigger, so that repeated growth becomes geometrically cheaper.
///
/// Like [`Pool`](crate::Pool), the arena is single-threaded unless
/// instantiated with a real [`Lock`]; one lock brackets the tree and
/// span-list mutations of each operation.
pub struct PoolArena<A, L = SingleThreadedLock>
where
    A: Allocator,
    L: Lock,
{
    upstream: A,
    state: Mutex<ArenaState, L>,
}

impl<A, L> PoolArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Create an empty arena over the given upstream allocator. No memory is
    /// requested until the first allocation or explicit [`PoolArena::grow`].
    pub const fn new(upstream: A, lock: L) -> Self {
        PoolArena {
            upstream,
            state: Mutex::new(
                ArenaState {
                    tree: ChunkTree::new(),
                    spans: SpanList::new(),
                },
                lock,
            ),
        }
    }

    /// Create an arena pre-grown with at least `bytes` of backing memory.
    pub fn with_capacity(bytes: usize, upstream: A, lock: L) -> Result<Self, AllocError> {
        let arena = Self::new(upstream, lock);
        arena.grow(bytes)?;
        Ok(arena)
    }

    /// Get a shared reference to the upstream allocator.
    #[inline]
    pub fn upstream(&self) -> &A {
        &self.upstream
    }

    /// Request at least `bytes` of additional backing memory from the
    /// upstream allocator and add it to the pool.
    ///
    /// All-or-nothing: on failure, neither a span nor any tree state is
    /// retained.
    pub fn grow(&self, bytes: usize) -> Result<(), AllocError> {
        let bytes = usize::max(bytes, MIN_CHUNK);
        let layout = Layout::from_size_align(bytes, CHUNK_ALIGN).map_err(|_| AllocError)?;
        let base = self.upstream.allocate(layout)?.cast::<u8>();
        let span = Span { base, len: bytes };

        let mut state = self.state.lock();
        if let Err(e) = state.spans.push(span, &self.upstream) {
            drop(state);
            // Safety: just allocated above with this exact layout, and never
            // published anywhere.
            unsafe { self.upstream.deallocate(base, layout) };
            return Err(e);
        }
        // Safety: the new span is exclusively ours, chunk-aligned, and at
        // least one chunk header long.
        unsafe {
            let chunk = Chunk::claim(base.as_ptr(), bytes);
            state.tree.insert(chunk);
        }
        Ok(())
    }

    /// Return every backing span to the upstream allocator and reset the
    /// arena to its empty state.
    ///
    /// All previously returned pointers become invalid. The arena remains
    /// usable; the next allocation simply grows from scratch.
    pub fn release(&mut self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.tree.reset();
        state.spans.release(&self.upstream);
    }

    /// Does `ptr` point into memory owned by this arena? O(number of spans).
    pub fn in_pool(&self, ptr: NonNull<u8>) -> bool {
        self.state.lock().spans.contains(ptr.as_ptr().addr())
    }

    /// Total bytes of backing memory currently owned, across all spans.
    pub fn total_size(&self) -> usize {
        self.state.lock().spans.total()
    }

    /// Size of the largest free chunk, or 0 if the pool is exhausted.
    pub fn max_chunk_size(&self) -> usize {
        self.state.lock().tree.max_chunk_size()
    }

    /// Maximum number of bytes that can be allocated at once with the given
    /// alignment without growing, or 0 if any allocation would grow first.
    pub fn max_size(&self, align: usize) -> usize {
        pool::max_size_of(self.max_chunk_size(), align)
    }

    /// Does the arena have zero outstanding allocations?
    pub fn is_empty(&self) -> bool {
        self.state.lock().tree.outstanding() == 0
    }

    /// Usable size of a live allocation, as for
    /// [`Pool::usable_size`](crate::Pool::usable_size).
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation returned by this arena.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe {
            let p = ptr.as_ptr();
            let offset = usize::from(p.sub(1).read());
            let size = p.sub(offset).cast::<usize>().read();
            size - offset
        }
    }

    fn allocate_or_grow(&self, request: Request) -> Result<NonNull<[u8]>, AllocError> {
        loop {
            let total = {
                let mut state = self.state.lock();
                if let Some((p, p_size)) = unsafe { state.tree.carve(request.size) } {
                    drop(state);
                    // Header construction happens outside the lock, on
                    // memory exclusively ours.
                    return Ok(unsafe { pool::write_header(p, p_size, request.align) });
                }
                state.spans.total()
            };
            // Another context may race us to the fresh chunk; the loop then
            // simply grows again.
            self.grow(usize::max(request.size.saturating_mul(2), total / 2))?;
        }
    }
}

unsafe impl<A, L> Allocator for PoolArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let request = Request::new(layout)?;
        self.allocate_or_grow(request)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        debug_assert!(unsafe { self.usable_size(ptr) } >= layout.size());
        debug_assert!(self.in_pool(ptr));
        let chunk = unsafe { pool::recover_chunk(ptr) };
        unsafe { self.state.lock().tree.give_back(chunk) };
    }
}

impl<A, L> Drop for PoolArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(any(test, feature = "validate"))]
impl<A, L> PoolArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Assert every structural invariant of the free-chunk tree. Test-only.
    pub fn validate(&self) {
        self.state.lock().tree.validate();
    }

    /// Number of chunks currently in the tree. Test-only.
    pub fn chunk_count(&self) -> usize {
        self.state.lock().tree.chunk_count()
    }

    /// Total free bytes currently tracked. Test-only.
    pub fn free_bytes(&self) -> usize {
        self.state.lock().tree.free_bytes()
    }

    /// Number of backing spans currently owned. Test-only.
    pub fn span_count(&self) -> usize {
        self.state.lock().spans.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// An upstream allocator over the test heap that counts requests, tracks
    /// live bytes, and can be told to start failing.
    struct Upstream {
        requests: Cell<usize>,
        live_bytes: Cell<usize>,
        fail_after: Cell<usize>,
    }

    impl Upstream {
        fn new() -> Self {
            Upstream {
                requests: Cell::new(0),
                live_bytes: Cell::new(0),
                fail_after: Cell::new(usize::MAX),
            }
        }

        fn failing_after(requests: usize) -> Self {
            let upstream = Self::new();
            upstream.fail_after.set(requests);
            upstream
        }
    }

    unsafe impl Allocator for Upstream {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            if self.requests.get() >= self.fail_after.get() {
                return Err(AllocError);
            }
            self.requests.set(self.requests.get() + 1);
            let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(AllocError)?;
            self.live_bytes.set(self.live_bytes.get() + layout.size());
            Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live_bytes.set(self.live_bytes.get() - layout.size());
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    #[test]
    fn grow_then_allocate_then_restore() {
        let upstream = Upstream::new();
        let arena = PoolArena::with_capacity(4096, &upstream, SingleThreadedLock::new()).unwrap();
        assert_eq!(arena.max_chunk_size(), 4096);
        assert_eq!(arena.total_size(), 4096);

        let layout = Layout::from_size_align(100, 8).unwrap();
        let p = arena.allocate(layout).unwrap();
        assert_eq!(p.cast::<u8>().as_ptr().addr() % 8, 0);
        assert!(arena.in_pool(p.cast()));

        // The footprint of an allocation is implementation-defined; discover
        // it instead of hard-coding the overhead.
        let footprint = 4096 - arena.max_chunk_size();
        assert!(footprint >= 100);
        assert!(footprint < 100 + 64);

        unsafe { arena.deallocate(p.cast(), layout) };
        assert_eq!(arena.max_chunk_size(), 4096);
        assert!(arena.is_empty());
    }

    #[test]
    fn footprint_is_consistent_across_allocations() {
        let upstream = Upstream::new();
        let arena = PoolArena::with_capacity(4096, &upstream, SingleThreadedLock::new()).unwrap();
        let layout = Layout::from_size_align(100, 8).unwrap();

        let a = arena.allocate(layout).unwrap();
        let after_one = arena.max_chunk_size();
        let b = arena.allocate(layout).unwrap();
        let after_two = arena.max_chunk_size();

        // Same request, same footprint, whichever end of the chunk it was
        // carved from.
        assert_eq!(4096 - after_one, after_one - after_two);

        unsafe {
            arena.deallocate(a.cast(), layout);
            arena.deallocate(b.cast(), layout);
        }
        assert_eq!(arena.max_chunk_size(), 4096);
    }

    #[test]
    fn exhaustion_triggers_exactly_one_grow() {
        let upstream = Upstream::new();
        let arena = PoolArena::new(&upstream, SingleThreadedLock::new());
        assert_eq!(arena.span_count(), 0);

        let layout = Layout::from_size_align(100, 8).unwrap();
        let p = arena.allocate(layout).unwrap();

        // One span, covering at least double the request.
        assert_eq!(arena.span_count(), 1);
        assert!(arena.total_size() >= 200);
        assert!(arena.in_pool(p.cast()));

        unsafe { arena.deallocate(p.cast(), layout) };
        assert_eq!(arena.max_chunk_size(), arena.total_size());
    }

    #[test]
    fn automatic_growth_requests_at_least_double() {
        let upstream = Upstream::new();
        let arena = PoolArena::with_capacity(8192, &upstream, SingleThreadedLock::new()).unwrap();

        // Too big for the existing pool: forces one automatic growth.
        let layout = Layout::from_size_align(8192, 8).unwrap();
        let p = arena.allocate(layout).unwrap();

        assert_eq!(arena.span_count(), 2);
        assert!(arena.total_size() - 8192 >= 2 * 8192);

        unsafe { arena.deallocate(p.cast(), layout) };
        assert!(arena.is_empty());
        assert_eq!(arena.free_bytes(), arena.total_size());
    }

    #[test]
    fn deallocation_order_does_not_matter() {
        let layout = Layout::from_size_align(50, 8).unwrap();
        for first_then_second in [true, false] {
            let upstream = Upstream::new();
            let arena =
                PoolArena::with_capacity(4096, &upstream, SingleThreadedLock::new()).unwrap();
            let a = arena.allocate(layout).unwrap();
            let b = arena.allocate(layout).unwrap();
            unsafe {
                if first_then_second {
                    arena.deallocate(a.cast(), layout);
                    arena.deallocate(b.cast(), layout);
                } else {
                    arena.deallocate(b.cast(), layout);
                    arena.deallocate(a.cast(), layout);
                }
            }
            assert_eq!(arena.max_chunk_size(), 4096);
            assert_eq!(arena.chunk_count(), 1);
        }
    }

    #[test]
    fn release_returns_everything_upstream() {
        let upstream = Upstream::new();
        let mut arena =
            PoolArena::with_capacity(4096, &upstream, SingleThreadedLock::new()).unwrap();
        assert!(upstream.live_bytes.get() >= 4096);

        arena.release();
        assert_eq!(upstream.live_bytes.get(), 0);
        assert_eq!(arena.total_size(), 0);
        assert_eq!(arena.max_chunk_size(), 0);

        // The arena is still usable: the next allocation grows from scratch.
        let layout = Layout::from_size_align(16, 8).unwrap();
        let p = arena.allocate(layout).unwrap();
        assert!(arena.in_pool(p.cast()));
        unsafe { arena.deallocate(p.cast(), layout) };
    }

    #[test]
    fn drop_returns_everything_upstream() {
        let upstream = Upstream::new();
        {
            let arena =
                PoolArena::with_capacity(4096, &upstream, SingleThreadedLock::new()).unwrap();
            let layout = Layout::from_size_align(64, 8).unwrap();
            let p = arena.allocate(layout).unwrap();
            unsafe { arena.deallocate(p.cast(), layout) };
        }
        assert_eq!(upstream.live_bytes.get(), 0);
    }

    #[test]
    fn upstream_failure_propagates_with_no_partial_state() {
        let upstream = Upstream::failing_after(0);
        let arena = PoolArena::new(&upstream, SingleThreadedLock::new());

        let layout = Layout::from_size_align(100, 8).unwrap();
        assert!(arena.allocate(layout).is_err());
        assert_eq!(arena.span_count(), 0);
        assert_eq!(arena.total_size(), 0);
    }

    #[test]
    fn span_list_append_failure_rolls_back_the_backing_span() {
        // The first upstream request (the backing span) succeeds; the second
        // (the span-list array) fails. The backing span must be returned.
        let upstream = Upstream::failing_after(1);
        let arena = PoolArena::new(&upstream, SingleThreadedLock::new());

        assert!(arena.grow(4096).is_err());
        assert_eq!(arena.span_count(), 0);
        assert_eq!(arena.max_chunk_size(), 0);
        assert_eq!(upstream.live_bytes.get(), 0);
    }

    #[test]
    fn in_pool_rejects_foreign_pointers() {
        let upstream = Upstream::new();
        let arena = PoolArena::with_capacity(4096, &upstream, SingleThreadedLock::new()).unwrap();
        let foreign = 0xDEAD_BEEFusize;
        assert!(!arena.in_pool(NonNull::new(foreign as *mut u8).unwrap()));
    }

    #[test]
    fn invariants_hold_under_churn() {
        let upstream = Upstream::new();
        let arena = PoolArena::with_capacity(2048, &upstream, SingleThreadedLock::new()).unwrap();

        let mut live = std::vec::Vec::new();
        for round in 0usize..128 {
            if round % 3 == 2 {
                if let Some((p, layout)) = live.pop() {
                    unsafe { arena.deallocate(p, layout) };
                }
            } else {
                let size = 16 + 24 * (round % 9);
                let align = 1 << (round % 5);
                let layout = Layout::from_size_align(size, align).unwrap();
                let p = arena.allocate(layout).unwrap();
                live.push((p.cast::<u8>(), layout));
            }
            arena.validate();
        }

        for (p, layout) in live {
            unsafe { arena.deallocate(p, layout) };
            arena.validate();
        }
        assert!(arena.is_empty());
        assert_eq!(arena.free_bytes(), arena.total_size());
    }
}
