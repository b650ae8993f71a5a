//! Collaborator traits for the log engine and their in-process implementations.
//!
//! The log engine runs SPMD: every cooperating process holds a [`Communicator`] for the lifetime
//! of an open file, and all processes share one underlying [`Storage`] container in which blobs
//! ("datasets") are created and raw bytes are read and written.
//!
//! This crate provides:
//!
//! 1. [`SelfComm`] and [`ThreadComm`], communicators for a single process and for a group of
//!    in-process ranks (one per thread).
//! 2. [`MemoryStorage`] and [`FileStorage`], a shared in-memory container and a single-file
//!    container with a JSON catalog.
//! 3. [`write_at_all`] and [`read_at_all`], the collective raw operations the engine issues
//!    exactly once per flush.

#![allow(clippy::cast_possible_truncation)]
pub use byte_range::*;
pub use collective::*;
pub use comm::*;
pub use file::*;
pub use memory::*;
pub use storage::*;

mod byte_range;
mod catalog;
mod collective;
mod comm;
mod file;
mod memory;
mod storage;
