//! # Concurrency core
//!
//! The three coordination pieces every pipeline stage is built on:
//!
//! - [`rows::RowDispatcher`] — lock-free hand-out of row indices, so a
//!   slow row (or a contended CPU) never stalls the rest of the pool.
//! - [`sync::PoolSync`] — the stage barrier plus run lifecycle state:
//!   start/exit signalling for the persistent primary worker, the stop
//!   flag, the first-writer-wins error slot and the progress counter.
//! - [`shared::StageCell`] — the interior-mutability wrapper for buffers
//!   that workers write row-disjointly between barriers.

pub mod rows;
pub mod shared;
pub mod sync;
