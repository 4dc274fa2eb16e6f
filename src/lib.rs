#![deny(missing_docs)]
#![warn(rust_2018_idioms, missing_debug_implementations)]
//! This crate provides Arena-Allocators, Index-Pools and Lock-Free
//! Datastructures, that are built on top of each other
//!
//! # Allocators
//! * [`tlsf`]: A general purpose O(1) Allocator for variable-sized Blocks
//! * [`pool`]: Fixed-size Blocks addressed by Index, in a single-threaded and
//!   a lock-free Version
//!
//! # Datastructures
//! * [`hash_map`]: A lock-free HashMap from `u64` to `u64`
//! * [`queue`]: A bounded lock-free MPMC Queue
//! * [`latch`]: A Countdown-Latch to wait for a Batch of Work
//! * [`registry`]: A Name-to-Handle Table, whose Handles are created later on
//!   a dedicated Thread
//!
//! # Feature-Flags
//! * `async`: Enables the Async-Version of the Queue
//! * `full`: Enables all the Feature-Flags

pub mod arena;
pub mod config;
mod error;
pub mod hash_map;
pub mod latch;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod tagged;
pub mod tlsf;

pub use error::ConfigError;
