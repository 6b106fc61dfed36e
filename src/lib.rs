#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(any(test, feature = "validate"))]
extern crate alloc;
#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;

mod pool;
pub use pool::{Lock, Pool, SingleThreadedLock, MAX_ALIGN};

cfg_if! {
    if #[cfg(feature = "arena")] {
        mod arena;
        pub use arena::PoolArena;
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
