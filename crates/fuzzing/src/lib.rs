//! Shared fuzzing and testing infrastructure for `coalescing-pool`.

#![feature(allocator_api)]

use coalescing_pool::{Allocator, Lock, PoolArena, SingleThreadedLock, MAX_ALIGN};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, ptr::NonNull};

/// The layout of a test allocation.
//
// Note: it is easier to define our own layout type here than to reuse
// `std::alloc::Layout` because we want to define a default mutator for
// `Layout` but trait orphan rules make that impossible.
#[derive(Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
pub struct Layout {
    size: usize,
    align: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self { size: 0, align: 1 }
    }
}

impl Layout {
    /// Create a new `Layout` from the given size and alignment.
    pub fn new(size: usize, align: usize) -> Option<Self> {
        let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
        Some(Layout {
            size: layout.size(),
            align: layout.align(),
        })
    }

    /// Like `Layout::new(...).unwrap()`.
    pub fn unwrap_new(size: usize, align: usize) -> Self {
        Layout::new(size, align).expect("Layout::unwrap_new on bad size/align")
    }

    /// Convert to a real `Layout`, or `None` for values the pool does not
    /// support (fuzz inputs are arbitrary bytes, so anything can show up
    /// here).
    fn alloc_layout(&self) -> Option<std::alloc::Layout> {
        if self.align > MAX_ALIGN {
            return None;
        }
        std::alloc::Layout::from_size_align(self.size, self.align).ok()
    }
}

impl DefaultMutate for Layout {
    type DefaultMutate = LayoutMutator;
}

/// A mutator for `Layout`s with configurable maximums for size and alignment.
#[derive(Debug)]
pub struct LayoutMutator {
    pub max_size: usize,
    pub max_align: usize,
}

impl Default for LayoutMutator {
    fn default() -> Self {
        Self {
            max_size: 4096,
            max_align: MAX_ALIGN,
        }
    }
}

fn round_down_to_pow2(x: usize) -> usize {
    if x == 0 {
        1
    } else {
        1 << (usize::BITS - 1 - x.leading_zeros())
    }
}

impl Mutate<Layout> for LayoutMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        layout: &mut Layout,
    ) -> mutatis::Result<()> {
        // Mutate size.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                layout.size
            } else {
                self.max_size
            };
            layout.size = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Mutate alignment.
        c.mutation(|ctx| {
            let max_align_log2 = if ctx.shrink() {
                layout.align.trailing_zeros() as usize
            } else {
                self.max_align.trailing_zeros() as usize
            };
            let align_log2 = ctx.rng().gen_index(max_align_log2 + 1).unwrap();
            layout.align = 1 << align_log2;
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Layout> for LayoutMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Layout> {
        let size = m::range(0..=self.max_size).generate(context)?;
        let align = m::range(1..=self.max_align).generate(context)?;
        let align = round_down_to_pow2(align);
        Ok(Layout { size, align })
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Grow { bytes: u32 },
    Alloc { id: u32, layout: Layout },
    Dealloc { id: u32 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Grow {
                    bytes: m::range(0..=65536u32).generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Dealloc { id } => {
                        *id = new_id;
                    }
                    Op::Grow { .. } => {}
                }
            }
            Ok(())
        })?;

        // Deallocate an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let dealloc_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(dealloc_index, Op::Dealloc { id });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Pop the last op off the sequence. Returns whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations with the given allocation limit.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        let arena = PoolArena::new(std::alloc::System, SingleThreadedLock::new());
        self.run_with_arena(arena, allocation_limit)
    }

    /// Run these test operations against the given arena, with a limit on
    /// both live allocation bytes and backing memory.
    pub fn run_with_arena<A, L>(
        &self,
        arena: PoolArena<A, L>,
        allocation_limit: usize,
    ) -> Result<(), String>
    where
        A: Allocator,
        L: Lock,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::new(allocation_limit);

        // Fill an allocation with the given byte pattern.
        let fill = |ptr: NonNull<[u8]>, byte: u8| unsafe {
            ptr.cast::<u8>().write_bytes(byte, ptr.len());
        };

        // Deallocate the allocation with the given id, poisoning it first so
        // stale reads through it are loud.
        let dealloc = |id: u32, alloc: LiveAlloc| -> Result<(), String> {
            log::debug!("deallocating id{id} -> {alloc:?}");
            let slice = unsafe { alloc.ptr.as_ref() };
            ensure!(
                slice.iter().all(|b| *b == LIVE_POISON_PATTERN),
                "live allocation's poison pattern was clobbered",
            );
            fill(alloc.ptr, FREE_POISON_PATTERN);
            unsafe {
                arena.deallocate(alloc.ptr.cast(), alloc.layout);
            }
            Ok(())
        };

        // Assert that the given allocation satisfies its requested layout.
        let assert_fits_layout =
            |ptr: NonNull<[u8]>, layout: std::alloc::Layout| -> Result<(), String> {
                ensure!(
                    layout.size() <= ptr.len(),
                    "actual allocated size is less than expected layout size",
                );
                ensure!(
                    ptr.cast::<u8>().as_ptr() as usize % layout.align() == 0,
                    "actual allocated alignment is less than expected layout alignment",
                );
                Ok(())
            };

        // Assert that the given allocation is not overlapping with any other
        // live allocations.
        let assert_not_overlapping = |live: &LiveMap, ptr: NonNull<[u8]>| -> Result<(), String> {
            let ptr_start = ptr.cast::<u8>().as_ptr() as usize;
            let ptr_end = ptr_start + ptr.len();
            for other in live.map.values() {
                let other_start = other.ptr.cast::<u8>().as_ptr() as usize;
                let other_end = other_start + other.ptr.len();
                ensure!(
                    ptr_end <= other_start || other_end <= ptr_start,
                    "two distinct live allocations should never overlap",
                );
            }
            Ok(())
        };

        // After every op: the tree's structural invariants must hold, the
        // arena must agree with us about outstanding allocations, and with
        // zero outstanding allocations every backing byte must be free again
        // (nothing leaked, no merge missed).
        let check_consistency = |live: &LiveMap| -> Result<(), String> {
            arena.validate();
            ensure!(
                arena.is_empty() == live.map.is_empty(),
                "arena and interpreter disagree about outstanding allocations",
            );
            if live.map.is_empty() {
                ensure!(
                    arena.free_bytes() == arena.total_size(),
                    "pool with no outstanding allocations lost bytes: {} free of {} total",
                    arena.free_bytes(),
                    arena.total_size(),
                );
            }
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Grow { bytes } => {
                    let bytes = usize::try_from(*bytes).unwrap();
                    if arena.total_size() + bytes > live.allocation_limit * 4 {
                        continue;
                    }
                    ensure!(arena.grow(bytes).is_ok(), "growing from upstream failed");
                    ensure!(
                        arena.max_chunk_size() >= bytes,
                        "largest chunk is smaller than the region just added",
                    );
                }

                Op::Alloc { id, layout } => {
                    if live.beyond_allocation_limit(layout.size) {
                        continue;
                    }
                    let Some(layout) = layout.alloc_layout() else {
                        continue;
                    };

                    if let Ok(ptr) = arena.allocate(layout) {
                        if let Some(old_alloc) = live.remove(*id) {
                            dealloc(*id, old_alloc)?;
                        }

                        log::debug!(
                            "new allocation: id{id} -> {{ address: {ptr:p}, size: {}, layout: {layout:?} }}",
                            ptr.len(),
                        );

                        assert_fits_layout(ptr, layout)?;
                        assert_not_overlapping(&live, ptr)?;
                        ensure!(
                            arena.in_pool(ptr.cast()),
                            "allocation points outside every backing span",
                        );
                        ensure!(
                            unsafe { arena.usable_size(ptr.cast()) } == ptr.len(),
                            "usable_size disagrees with the returned slice length",
                        );
                        fill(ptr, LIVE_POISON_PATTERN);

                        live.insert(*id, LiveAlloc { ptr, layout });
                    }
                }

                Op::Dealloc { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        dealloc(*id, alloc)?;
                    }
                }
            }

            check_consistency(&live)?;
        }

        // Finally, deallocate any remaining live allocations.
        let remaining = std::mem::take(&mut live.map);
        for (id, alloc) in remaining {
            dealloc(id, alloc)?;
        }
        check_consistency(&live)?;

        Ok(())
    }
}

// We fill live memory with a poison pattern so that a free chunk's header
// being written through a live allocation (or vice versa) shows up as a
// corrupted pattern rather than silently passing.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live allocation.
struct LiveAlloc {
    /// Pointer and actual allocated length.
    ptr: NonNull<[u8]>,
    /// Requested layout at allocation time.
    layout: std::alloc::Layout,
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, layout } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", &ptr.len())
            .field("layout", &layout)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of bytes that are currently allocated.
    ///
    /// Note: this is a sum of the requested allocation sizes, and does not
    /// include the size of any extra bytes that the allocator may have
    /// included.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation
    /// limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to check that the given allocation
    /// fits within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.layout.size();
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    /// Remove a live allocation for deallocation.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.layout.size();
        Some(alloc)
    }
}
