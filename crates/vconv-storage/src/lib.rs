//! Object storage backends for the vconv pipeline.
//!
//! This crate provides:
//! - The [`Backend`] trait: list/get/put/create-if-absent/delete over a keyed blob store
//! - An S3 (and S3-compatible) implementation
//! - A local filesystem implementation
//! - An in-memory implementation for tests and dry runs
//! - The storage key layout shared by all workers

pub mod backend;
pub mod client;
pub mod error;
pub mod fs;
pub mod layout;
pub mod memory;

pub use backend::{is_media_key, Backend, CreateOutcome, MEDIA_EXTENSIONS};
pub use client::{S3Backend, S3Config};
pub use error::{StorageError, StorageResult};
pub use fs::FsBackend;
pub use layout::StorageLayout;
pub use memory::MemoryBackend;
