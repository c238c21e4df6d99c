//! Tessella keeps arbitrarily large 2D integer matrices as
//! collections of fixed-size square tiles ("chunks").  Chunks are
//! served out of mmap-backed page slabs by a pool with O(1)
//! issue/return, each matrix indexes its tiles in a red/black tree
//! over packed coordinates, and whole matrices stream between file
//! descriptors with kernel zero-copy where the platform offers it.
//!
//! The core is single-threaded by contract: none of these structures
//! tolerates concurrent mutation.
mod chunk;
mod errors;
mod fdio;
mod index;
mod map;
mod matrix;
mod page;
mod pool;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_issue_map;

pub use chunk::chunk_pos;
pub use chunk::COffs;
pub use chunk::CSize;
pub use chunk::Chunk;
pub use chunk::CHUNK_BYTES;
pub use chunk::CHUNK_LEN;
pub use chunk::CHUNK_POW;
pub use chunk::CHUNK_W;
pub use errors::Error;
pub use errors::Result;
pub use matrix::MSize;
pub use matrix::Matrix;
pub use matrix::HEADER_BYTES;
pub use page::PAGE_LEN;
pub use pool::ChunkLease;
pub use pool::Pool;
