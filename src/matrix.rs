//! A matrix ties together a pool handle, a spatial chunk index, and
//! an optional backing file.  Chunks come out of the pool lazily on
//! first touch of their tile and go back when the tile is released or
//! the matrix is dropped.
//!
//! The persisted form is dense over the declared dimensions: a
//! 16-byte big-endian size header followed by row-major `i64`
//! payload in native byte order.  Streaming between descriptors is
//! byte-oriented over that region and never walks the chunk tree.
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};

use crate::chunk::{COffs, CSize, Chunk, CHUNK_W, ELEM_BYTES};
use crate::errors::{Error, Result};
use crate::fdio;
use crate::index::ChunkIndex;
use crate::pool::{ChunkLease, Pool};

/// Size of the on-disk / on-wire header: two big-endian u64 fields.
pub const HEADER_BYTES: usize = 16;

/// Declared dense matrix dimensions, in elements.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MSize {
    pub x: u64,
    pub y: u64,
}

impl MSize {
    pub fn new(x: u64, y: u64) -> MSize {
        MSize { x, y }
    }

    /// Dense payload size in bytes; `None` on overflow.
    fn payload_bytes(self) -> Option<u64> {
        self.x
            .checked_mul(self.y)?
            .checked_mul(ELEM_BYTES as u64)
    }
}

pub struct Matrix {
    pool: Rc<RefCell<Pool>>,
    index: ChunkIndex,
    file: Option<File>,
    size: MSize,
}

impl Matrix {
    pub fn new(pool: Rc<RefCell<Pool>>) -> Matrix {
        Matrix {
            pool,
            index: ChunkIndex::new(),
            file: None,
            size: MSize::default(),
        }
    }

    pub fn size(&self) -> MSize {
        self.size
    }

    /// The backing file, when one is bound.  Payload reads and
    /// writes by numerical code go through this descriptor.
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn find(&mut self, offset: COffs) -> Option<&Chunk> {
        self.index.find(offset)
    }

    pub fn find_mut(&mut self, offset: COffs) -> Option<&mut Chunk> {
        self.index.find_mut(offset)
    }

    /// Finds the tile at `offset`, allocating and indexing it on
    /// first touch.  The effective size of a fresh tile is clipped to
    /// the declared matrix dimensions.
    pub fn acquire(&mut self, offset: COffs) -> Result<&mut Chunk> {
        if self.index.find(offset).is_none() {
            let lease = self
                .pool
                .borrow_mut()
                .get()
                .ok_or(Error::ResourceExhausted)?;

            let mut chunk = Chunk::new(lease.into_data());
            chunk.set_offset(offset);
            chunk.set_size(self.tile_size(offset));

            let displaced = self.index.insert(chunk);
            debug_assert!(displaced.is_none(), "fresh offset collided in the index");
        }

        Ok(self
            .index
            .find_mut(offset)
            .expect("tile was present or just inserted"))
    }

    /// Drops the tile at `offset`, returning its chunk to the pool.
    pub fn release(&mut self, offset: COffs) -> bool {
        match self.index.remove(offset) {
            Some(chunk) => {
                self.pool.borrow_mut().ret(ChunkLease::reclaim(chunk.data()));
                true
            }
            None => false,
        }
    }

    /// Effective dimensions of the tile at `offset` under the
    /// declared matrix size.  An undeclared (0, 0) matrix is treated
    /// as unbounded.
    fn tile_size(&self, offset: COffs) -> CSize {
        fn clip(dim: u64, coord: u32) -> usize {
            if dim == 0 {
                return CHUNK_W;
            }

            let start = coord as u64 * CHUNK_W as u64;
            let rem = dim.saturating_sub(start);

            if rem == 0 {
                // The tile lies entirely outside the dense region.
                1
            } else {
                rem.min(CHUNK_W as u64) as usize
            }
        }

        CSize::new(clip(self.size.x, offset.x()), clip(self.size.y, offset.y()))
    }

    /// Binds a backing file, creating it if missing.  An existing
    /// valid header sets the declared size; otherwise it stays
    /// (0, 0).  The matrix owns the descriptor from here on.
    pub fn set_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        self.size = Self::read_header(&file).unwrap_or_default();
        self.file = Some(file);

        Ok(())
    }

    fn read_header(file: &File) -> Option<MSize> {
        let mut header = [0u8; HEADER_BYTES];

        file.read_exact_at(&mut header, 0).ok()?;
        Some(MSize {
            x: BigEndian::read_u64(&header[..8]),
            y: BigEndian::read_u64(&header[8..]),
        })
    }

    /// Declares the dense size: truncates the backing file to header
    /// plus payload and writes the header.  On failure the declared
    /// size is cleared.
    pub fn set_size(&mut self, size: MSize) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::NoBackingFile)?;

        let payload = match size.payload_bytes() {
            Some(payload) => payload,
            None => {
                self.size = MSize::default();
                return Err(Error::InvalidHeader);
            }
        };

        let result = file.set_len(HEADER_BYTES as u64 + payload).and_then(|_| {
            let mut header = [0u8; HEADER_BYTES];

            BigEndian::write_u64(&mut header[..8], size.x);
            BigEndian::write_u64(&mut header[8..], size.y);
            file.write_all_at(&header, 0)
        });

        match result {
            Ok(()) => {
                self.size = size;
                Ok(())
            }
            Err(err) => {
                self.size = MSize::default();
                Err(err.into())
            }
        }
    }

    /// Streams the matrix to a peer descriptor: header frame first,
    /// then the dense payload straight from the backing file.
    pub fn send(&mut self, peer: &impl AsRawFd) -> Result<()> {
        let size = self.size;
        let file = self.file.as_mut().ok_or(Error::NoBackingFile)?;
        let payload = size.payload_bytes().ok_or(Error::InvalidHeader)?;

        let mut header = [0u8; HEADER_BYTES];
        BigEndian::write_u64(&mut header[..8], size.x);
        BigEndian::write_u64(&mut header[8..], size.y);
        fdio::write_full(peer.as_raw_fd(), &header)?;

        tracing::debug!(x = size.x, y = size.y, "streaming matrix out");

        file.seek(SeekFrom::Start(HEADER_BYTES as u64))?;
        fdio::transfer(file.as_raw_fd(), peer.as_raw_fd(), payload)?;

        Ok(())
    }

    /// Mirror of `send`: drains the header frame from the peer,
    /// re-declares the matrix to the received size, and streams the
    /// dense payload into the backing file.  Header errors fail
    /// before any bulk transfer.
    pub fn recv(&mut self, peer: &impl AsRawFd) -> Result<()> {
        let mut header = [0u8; HEADER_BYTES];
        fdio::read_full(peer.as_raw_fd(), &mut header)?;

        let size = MSize {
            x: BigEndian::read_u64(&header[..8]),
            y: BigEndian::read_u64(&header[8..]),
        };
        self.set_size(size)?;

        let payload = size.payload_bytes().ok_or(Error::InvalidHeader)?;
        let file = self
            .file
            .as_mut()
            .expect("set_size verified the backing file");

        tracing::debug!(x = size.x, y = size.y, "streaming matrix in");

        file.seek(SeekFrom::Start(HEADER_BYTES as u64))?;
        fdio::transfer(peer.as_raw_fd(), file.as_raw_fd(), payload)?;

        Ok(())
    }
}

impl Drop for Matrix {
    fn drop(&mut self) {
        let pool = Rc::clone(&self.pool);
        let mut pool = pool.borrow_mut();

        self.index
            .drain(|chunk| pool.ret(ChunkLease::reclaim(chunk.data())));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::{chunk_pos, CHUNK_LEN};
    use std::io::Read;
    use std::os::unix::io::{FromRawFd, RawFd};

    fn fresh_pool() -> Rc<RefCell<Pool>> {
        Rc::new(RefCell::new(Pool::new()))
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    struct RawFdWrapper(RawFd);
    impl AsRawFd for RawFdWrapper {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    #[test]
    fn acquire_is_lazy_and_idempotent() {
        let pool = fresh_pool();
        let mut matrix = Matrix::new(Rc::clone(&pool));

        assert_eq!(pool.borrow().size(), 0);

        let off = COffs::new(3, 5);
        let first = matrix.acquire(off).expect("pool should issue").data();
        assert_eq!(pool.borrow().size(), 1);

        // A second touch of the same tile reuses the chunk.
        let second = matrix.acquire(off).expect("tile is present").data();
        assert_eq!(first, second);

        let held = matrix.find(off).expect("tile is present");
        assert_eq!(held.offset(), off);
        assert_eq!(held.size().width(), CHUNK_W);
        assert_eq!(held.size().height(), CHUNK_W);
    }

    #[test]
    fn tiles_clip_to_the_declared_size() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let pool = fresh_pool();
        let mut matrix = Matrix::new(pool);

        matrix
            .set_file(dir.path().join("clipped.mat"))
            .expect("file should bind");
        matrix
            .set_size(MSize::new(CHUNK_W as u64 + 3, 2))
            .expect("size should set");

        let interior = matrix
            .acquire(COffs::new(0, 0))
            .expect("pool should issue")
            .size();
        assert_eq!(interior.width(), CHUNK_W);
        assert_eq!(interior.height(), 2);

        let edge = matrix
            .acquire(COffs::new(1, 0))
            .expect("pool should issue")
            .size();
        assert_eq!(edge.width(), 3);
        assert_eq!(edge.height(), 2);
    }

    #[test]
    fn release_and_drop_return_chunks() {
        let pool = fresh_pool();

        {
            let mut matrix = Matrix::new(Rc::clone(&pool));

            for i in 0..4u32 {
                matrix.acquire(COffs::new(i, 0)).expect("pool should issue");
            }
            assert!(matrix.release(COffs::new(2, 0)));
            assert!(!matrix.release(COffs::new(2, 0)));

            let pool_ref = pool.borrow();
            assert_eq!(pool_ref.page(0).ring_len(), 1);
        }

        // Dropping the matrix sent the other three chunks home.
        let pool_ref = pool.borrow();
        assert_eq!(pool_ref.page(0).ring_len(), 4);
        pool_ref.check_rep_or_err().expect("invariants should hold");
    }

    #[test]
    fn set_file_reads_an_existing_header() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let path = dir.path().join("persisted.mat");

        {
            let mut matrix = Matrix::new(fresh_pool());
            matrix.set_file(&path).expect("file should bind");
            assert_eq!(matrix.size(), MSize::default());

            matrix
                .set_size(MSize::new(7, 9))
                .expect("size should set");
        }

        let mut matrix = Matrix::new(fresh_pool());
        matrix.set_file(&path).expect("file should bind");
        assert_eq!(matrix.size(), MSize::new(7, 9));
    }

    #[test]
    fn set_size_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let pool = fresh_pool();
        let mut matrix = Matrix::new(pool);

        matrix
            .set_file(dir.path().join("twice.mat"))
            .expect("file should bind");

        matrix.set_size(MSize::new(5, 4)).expect("size should set");
        let len_once = matrix.file().unwrap().metadata().unwrap().len();

        matrix.set_size(MSize::new(5, 4)).expect("size should set");
        let len_twice = matrix.file().unwrap().metadata().unwrap().len();

        assert_eq!(matrix.size(), MSize::new(5, 4));
        assert_eq!(len_once, len_twice);
        assert_eq!(len_once, HEADER_BYTES as u64 + 5 * 4 * ELEM_BYTES as u64);
    }

    #[test]
    fn set_size_requires_a_file() {
        let mut matrix = Matrix::new(fresh_pool());

        match matrix.set_size(MSize::new(1, 1)) {
            Err(Error::NoBackingFile) => {}
            other => panic!("expected NoBackingFile, got {:?}", other),
        }
    }

    #[test]
    fn set_size_rejects_overflowing_dimensions() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let mut matrix = Matrix::new(fresh_pool());

        matrix
            .set_file(dir.path().join("huge.mat"))
            .expect("file should bind");
        matrix.set_size(MSize::new(2, 2)).expect("size should set");

        match matrix.set_size(MSize::new(u64::MAX, 2)) {
            Err(Error::InvalidHeader) => {}
            other => panic!("expected InvalidHeader, got {:?}", other),
        }
        // Failure clears the declared size.
        assert_eq!(matrix.size(), MSize::default());
    }

    // Write a 3x2 matrix, stream it through a pipe into a second
    // matrix, and compare raw file bytes: big-endian header, native
    // payload.
    #[test]
    fn file_round_trip_over_a_pipe() {
        let dir = tempfile::tempdir().expect("tempdir should build");

        let mut src = Matrix::new(fresh_pool());
        src.set_file(dir.path().join("src.mat"))
            .expect("file should bind");
        src.set_size(MSize::new(3, 2)).expect("size should set");

        let payload: Vec<i64> = vec![1, 2, 3, 4, 5, 6];
        let mut bytes = Vec::new();
        for value in &payload {
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        src.file()
            .unwrap()
            .write_all_at(&bytes, HEADER_BYTES as u64)
            .expect("payload should write");

        let (rx, tx) = pipe_pair();
        src.send(&RawFdWrapper(tx)).expect("send should succeed");
        unsafe { libc::close(tx) };

        let mut dst = Matrix::new(fresh_pool());
        dst.set_file(dir.path().join("dst.mat"))
            .expect("file should bind");
        dst.recv(&RawFdWrapper(rx)).expect("recv should succeed");
        unsafe { libc::close(rx) };

        assert_eq!(dst.size(), MSize::new(3, 2));

        let mut expected = vec![0u8; HEADER_BYTES];
        BigEndian::write_u64(&mut expected[..8], 3);
        BigEndian::write_u64(&mut expected[8..], 2);
        expected.extend_from_slice(&bytes);

        let actual = std::fs::read(dir.path().join("dst.mat")).expect("file should read");
        assert_eq!(actual, expected);
    }

    #[test]
    fn recv_fails_on_a_short_header_before_any_transfer() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let mut matrix = Matrix::new(fresh_pool());

        matrix
            .set_file(dir.path().join("victim.mat"))
            .expect("file should bind");
        matrix.set_size(MSize::new(2, 2)).expect("size should set");
        let len_before = matrix.file().unwrap().metadata().unwrap().len();

        let (rx, tx) = pipe_pair();
        fdio::write_full(tx, &[0u8; 7]).expect("write should succeed");
        unsafe { libc::close(tx) };

        assert!(matrix.recv(&RawFdWrapper(rx)).is_err());
        unsafe { libc::close(rx) };

        // The backing file was not resized or clobbered.
        assert_eq!(
            matrix.file().unwrap().metadata().unwrap().len(),
            len_before
        );
    }

    #[test]
    fn chunk_payloads_persist_across_lookups() {
        let pool = fresh_pool();
        let mut matrix = Matrix::new(Rc::clone(&pool));

        let chunk = matrix
            .acquire(COffs::new(0, 0))
            .expect("pool should issue");
        chunk.as_mut_slice()[chunk_pos(0, 0)] = 41;
        chunk.as_mut_slice()[chunk_pos(1, 1)] = 42;
        chunk.as_mut_slice()[CHUNK_LEN - 1] = 43;

        let again = matrix.find(COffs::new(0, 0)).expect("tile is present");
        assert_eq!(again.as_slice()[chunk_pos(0, 0)], 41);
        assert_eq!(again.as_slice()[chunk_pos(1, 1)], 42);
        assert_eq!(again.as_slice()[CHUNK_LEN - 1], 43);
    }

    // Exercise the raw-fd read end of the pipe as a sanity check for
    // the wrapper used above.
    #[test]
    fn raw_fd_wrapper_behaves() {
        let (rx, tx) = pipe_pair();

        fdio::write_full(RawFdWrapper(tx).as_raw_fd(), b"ok").expect("write should succeed");
        unsafe { libc::close(tx) };

        let mut out = String::new();
        let mut rx_file = unsafe { File::from_raw_fd(rx) };
        rx_file.read_to_string(&mut out).expect("read should succeed");
        assert_eq!(out, "ok");
    }
}
