//! Cache engines and their building blocks
//!
//! - [`error`] - Error types shared by every engine
//! - [`key`] - File types, guids, hashes and composite keys
//! - [`config`] - Engine configuration
//! - [`allocator`] - Free-list allocator over arena pages
//! - [`arena`] - Page buffers, growth and page persistence
//! - [`index`] - Key index and its persistence adapters
//! - [`transaction`] - Put transactions and bounded write streams
//! - [`stream`] - Read-back streams
//! - [`engine`] - The shared cache contract
//! - [`membuf`] - Arena-backed engine
//! - [`fs`] - Filesystem engine
//! - [`cluster`] - Worker/owner request forwarding

pub mod allocator;
pub mod arena;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod fs;
pub mod index;
pub mod key;
pub mod membuf;
pub mod stream;
pub mod transaction;
