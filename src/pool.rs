//! The non-owning pool allocator.
//!
//! [`Pool`] carves allocations out of memory regions fed to it via
//! [`Pool::grow`]. It does not know where those regions came from and frees
//! nothing on drop; ownership stays with the caller. The owning, growing
//! variant is [`PoolArena`](crate::PoolArena).
//!
//! # Allocation layout
//!
//! Every allocation is carved from one free chunk and prefixed with a small
//! header that makes deallocation self-describing:
//!
//! ```text
//! chunk start                                      returned pointer
//! v                                                v
//! ┌──────────────┬─────────────┬───────────────┬───┬───────────────────┐
//! │ size: usize  │ (alignment padding)          │u8 │ caller's memory   │
//! └──────────────┴─────────────┴───────────────┴───┴───────────────────┘
//!                                                ^ offset from chunk start
//! ```
//!
//! The `usize` records the carved chunk's total length and the byte
//! immediately before the returned pointer records the distance back to the
//! chunk start, so `deallocate` can reconstruct the exact original span with
//! no side table and re-insert it into the tree, where adjacent free chunks
//! merge.

use core::alloc::Layout;
use core::mem;
use core::ptr::NonNull;

use crate::{AllocError, Allocator};

pub(crate) mod chunk;
mod mutex;

pub(crate) use chunk::{Chunk, ChunkTree, CHUNK_ALIGN, MIN_CHUNK};
pub use mutex::{Lock, SingleThreadedLock};
pub(crate) use mutex::Mutex;

/// Bytes of allocation header: the carved chunk's size plus the one-byte
/// offset from the chunk start to the returned pointer.
pub(crate) const HEADER: usize = mem::size_of::<usize>() + mem::size_of::<u8>();

/// The largest supported allocation alignment.
///
/// The header stores the distance from the chunk start to the returned
/// pointer in a single byte; this is the largest power of two whose
/// worst-case distance still fits. Requests with stricter alignment fail
/// with [`AllocError`].
pub const MAX_ALIGN: usize = 128;

/// An allocation request after adjusting for header overhead, alignment
/// slack, and the minimum chunk size.
#[derive(Clone, Copy)]
pub(crate) struct Request {
    pub(crate) size: usize,
    pub(crate) align: usize,
}

impl Request {
    pub(crate) fn new(layout: Layout) -> Result<Self, AllocError> {
        let align = usize::max(layout.align(), mem::align_of::<*const ()>());
        if align > MAX_ALIGN {
            return Err(AllocError);
        }
        let size = layout
            .size()
            .checked_add(align + HEADER)
            .ok_or(AllocError)?
            .max(MIN_CHUNK);
        Ok(Request { size, align })
    }
}

/// Write the allocation header into a freshly carved region and return the
/// aligned caller-facing slice.
///
/// # Safety
///
/// `p` must be the chunk-aligned start of a carved region of exactly
/// `p_size` bytes, sized by [`Request::new`] for this `align`.
pub(crate) unsafe fn write_header(p: *mut u8, p_size: usize, align: usize) -> NonNull<[u8]> {
    unsafe {
        p.cast::<usize>().write(p_size);
        let offset = chunk::align_up(p.addr() + HEADER, align) - p.addr();
        debug_assert!(offset <= usize::from(u8::MAX));
        debug_assert!(offset < p_size);
        let user = p.add(offset);
        user.sub(1).write(offset as u8);
        NonNull::slice_from_raw_parts(NonNull::new_unchecked(user), p_size - offset)
    }
}

/// Reconstruct the carved chunk an allocation came from.
///
/// # Safety
///
/// `ptr` must have been returned by an allocation that wrote its header with
/// [`write_header`] and must not have been deallocated since.
pub(crate) unsafe fn recover_chunk(ptr: NonNull<u8>) -> *mut Chunk {
    unsafe {
        let p = ptr.as_ptr();
        let offset = usize::from(p.sub(1).read());
        let start = p.sub(offset);
        let size = start.cast::<usize>().read();
        Chunk::claim(start, size)
    }
}

/// Largest payload a chunk of `chunk_size` bytes can satisfy at `align`, or
/// 0 if even the smallest usable allocation would not fit.
pub(crate) fn max_size_of(chunk_size: usize, align: usize) -> usize {
    let align = usize::max(align, mem::align_of::<*const ()>());
    if align > MAX_ALIGN {
        return 0;
    }
    let Some(size) = chunk_size.checked_sub(align + HEADER) else {
        return 0;
    };
    if size < MIN_CHUNK {
        return 0;
    }
    size
}

/// A pool allocator over memory it does not own.
///
/// Free memory is tracked in a coalescing chunk tree (see the
/// [crate docs](crate)); allocation takes the largest chunk and splits off
/// the requested amount, deallocation merges the returned span with its
/// physical neighbors. The pool starts empty: feed it regions with
/// [`Pool::grow`]. When the tree cannot satisfy a request, allocation fails
/// with [`AllocError`]; there is no growth strategy here.
///
/// The pool is single-threaded by default. Instantiate it with a real
/// [`Lock`] via [`Pool::with_lock`] to share it between threads or with
/// interrupt handlers; the lock brackets exactly the tree mutation of each
/// operation.
pub struct Pool<L = SingleThreadedLock>
where
    L: Lock,
{
    tree: Mutex<ChunkTree, L>,
}

impl Default for Pool<SingleThreadedLock> {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool<SingleThreadedLock> {
    /// Create an empty single-threaded pool.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_lock(SingleThreadedLock::new())
    }
}

impl<L> Pool<L>
where
    L: Lock,
{
    /// Create an empty pool whose critical sections are bracketed by `lock`.
    pub const fn with_lock(lock: L) -> Self {
        Pool {
            tree: Mutex::new(ChunkTree::new(), lock),
        }
    }

    /// Add a region of free memory to the pool.
    ///
    /// The region's start is aligned up (and its length trimmed) to the
    /// pool's internal chunk alignment; a region too small to hold a chunk
    /// header after trimming is ignored. If the region is physically
    /// contiguous with memory already in the pool, the two coalesce into one
    /// chunk.
    ///
    /// # Safety
    ///
    /// The region must be valid, unused by anything else, and remain
    /// exclusively the pool's for as long as the pool or any allocation from
    /// it is in use.
    pub unsafe fn grow(&self, region: NonNull<[u8]>) {
        unsafe {
            let start = region.cast::<u8>().as_ptr();
            let offset = start.align_offset(CHUNK_ALIGN);
            let len = region.len().saturating_sub(offset);
            if len < mem::size_of::<Chunk>() {
                return;
            }
            let chunk = Chunk::claim(start.add(offset), len);
            self.tree.lock().insert(chunk);
        }
    }

    /// Size of the largest free chunk, or 0 if the pool is exhausted.
    pub fn max_chunk_size(&self) -> usize {
        self.tree.lock().max_chunk_size()
    }

    /// Maximum number of bytes that can be allocated at once with the given
    /// alignment, or 0 if no allocation can currently succeed.
    pub fn max_size(&self, align: usize) -> usize {
        max_size_of(self.max_chunk_size(), align)
    }

    /// Does the pool have zero outstanding allocations?
    pub fn is_empty(&self) -> bool {
        self.tree.lock().outstanding() == 0
    }

    /// Usable size of a live allocation: the bytes from `ptr` to the end of
    /// its carved chunk, which is at least the size that was requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation returned by this pool.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe {
            let p = ptr.as_ptr();
            let offset = usize::from(p.sub(1).read());
            let size = p.sub(offset).cast::<usize>().read();
            size - offset
        }
    }

    fn try_allocate(&self, request: Request) -> Option<NonNull<[u8]>> {
        let (p, p_size) = {
            let mut tree = self.tree.lock();
            unsafe { tree.carve(request.size) }?
        };
        // The carved region is exclusively ours now; the header write does
        // not need the lock.
        Some(unsafe { write_header(p, p_size, request.align) })
    }
}

unsafe impl<L> Allocator for Pool<L>
where
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let request = Request::new(layout)?;
        self.try_allocate(request).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        debug_assert!(unsafe { self.usable_size(ptr) } >= layout.size());
        debug_assert_eq!(ptr.as_ptr().addr() % layout.align(), 0);
        let chunk = unsafe { recover_chunk(ptr) };
        unsafe { self.tree.lock().give_back(chunk) };
    }
}

#[cfg(any(test, feature = "validate"))]
impl<L> Pool<L>
where
    L: Lock,
{
    /// Assert every structural invariant of the free-chunk tree. Test-only.
    pub fn validate(&self) {
        self.tree.lock().validate();
    }

    /// Number of chunks currently in the tree. Test-only.
    pub fn chunk_count(&self) -> usize {
        self.tree.lock().chunk_count()
    }

    /// Total free bytes currently tracked. Test-only.
    pub fn free_bytes(&self) -> usize {
        self.tree.lock().free_bytes()
    }
}
