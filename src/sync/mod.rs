//! Synchronization primitives
//!
//! Every blocking operation here rides on the kernel's one park/unpark
//! protocol; wake order is always highest priority first, FIFO within a
//! level.

pub mod condvar;
pub mod evflags;
pub mod mempool;
pub mod mqueue;
pub mod mutex;
pub mod semaphore;
