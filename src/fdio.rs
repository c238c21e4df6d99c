//! Blocking descriptor helpers: full-length reads and writes with
//! retry on signal interruption, and pipe-mediated bulk transfer
//! between two descriptors.
//!
//! On Linux the bulk path moves payload through a transient anonymous
//! pipe with `splice`, so the bytes never cross into user space.
//! Elsewhere a bounce buffer of the same unit size is used.
use std::io;
use std::os::unix::io::RawFd;

use crate::chunk::CHUNK_BYTES;

/// Reads exactly `buf.len()` bytes from `fd`.
///
/// Retries on `EINTR`; a zero-length read is an unexpected EOF.
pub fn read_full(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;

    while done < buf.len() {
        let ret = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            return Err(err);
        }

        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "descriptor closed mid-read",
            ));
        }

        done += ret as usize;
    }

    Ok(())
}

/// Writes exactly `buf.len()` bytes to `fd`.
///
/// Retries on `EINTR`; a zero-length write is an error.
pub fn write_full(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut done = 0;

    while done < buf.len() {
        let ret = unsafe {
            libc::write(
                fd,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            return Err(err);
        }

        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "descriptor accepted no bytes",
            ));
        }

        done += ret as usize;
    }

    Ok(())
}

/// An anonymous pipe whose two ends are closed on every exit path.
#[cfg(target_os = "linux")]
struct Pipe {
    read: RawFd,
    write: RawFd,
}

#[cfg(target_os = "linux")]
impl Pipe {
    fn new() -> io::Result<Pipe> {
        let mut fds = [0 as RawFd; 2];

        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Pipe {
            read: fds[0],
            write: fds[1],
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

/// Moves up to `len` bytes from `from` into `to`, at most
/// `CHUNK_BYTES` per kernel call.
///
/// A clean EOF on `from` stops the transfer early and is not an
/// error; the destination is then shorter than requested.
#[cfg(target_os = "linux")]
pub fn transfer(from: RawFd, to: RawFd, len: u64) -> io::Result<()> {
    fn splice_once(from: RawFd, to: RawFd, len: usize) -> io::Result<usize> {
        loop {
            let ret = unsafe {
                libc::splice(
                    from,
                    std::ptr::null_mut(),
                    to,
                    std::ptr::null_mut(),
                    len,
                    libc::SPLICE_F_MORE | libc::SPLICE_F_MOVE,
                )
            };

            if ret >= 0 {
                return Ok(ret as usize);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        }
    }

    let pipe = Pipe::new()?;
    let mut remain = len;

    while remain > 0 {
        let bytes = remain.min(CHUNK_BYTES as u64) as usize;

        let mut queued = splice_once(from, pipe.write, bytes)?;
        if queued == 0 {
            break; // EOF
        }

        while queued > 0 {
            let moved = splice_once(pipe.read, to, queued)?;

            queued -= moved;
            remain -= moved as u64;
        }
    }

    Ok(())
}

/// Bounce-buffer fallback for platforms without a pipe-splice
/// primitive.
#[cfg(not(target_os = "linux"))]
pub fn transfer(from: RawFd, to: RawFd, len: u64) -> io::Result<()> {
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut remain = len;

    while remain > 0 {
        let bytes = remain.min(CHUNK_BYTES as u64) as usize;

        let got = loop {
            let ret =
                unsafe { libc::read(from, buf.as_mut_ptr() as *mut libc::c_void, bytes) };

            if ret >= 0 {
                break ret as usize;
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        };

        if got == 0 {
            break; // EOF
        }

        write_full(to, &buf[..got])?;
        remain -= got as u64;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd};

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn read_write_round_trip() {
        let (rx, tx) = pipe_pair();

        write_full(tx, b"tessellate").expect("write should succeed");

        let mut buf = [0u8; 10];
        read_full(rx, &mut buf).expect("read should succeed");
        assert_eq!(&buf, b"tessellate");

        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn read_full_reports_eof() {
        let (rx, tx) = pipe_pair();

        write_full(tx, b"abc").expect("write should succeed");
        unsafe { libc::close(tx) };

        let mut buf = [0u8; 8];
        let err = read_full(rx, &mut buf).expect_err("short stream must fail");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        unsafe { libc::close(rx) };
    }

    #[test]
    fn transfer_moves_file_to_pipe() {
        let mut src = tempfile::tempfile().expect("tempfile should open");
        src.write_all(&[7u8; 4096]).expect("fill should succeed");
        src.seek(SeekFrom::Start(0)).expect("seek should succeed");

        let (rx, tx) = pipe_pair();
        transfer(src.as_raw_fd(), tx, 4096).expect("transfer should succeed");
        unsafe { libc::close(tx) };

        let mut out = Vec::new();
        let mut rx_file = unsafe { std::fs::File::from_raw_fd(rx) };
        rx_file.read_to_end(&mut out).expect("drain should succeed");
        assert_eq!(out, vec![7u8; 4096]);
    }

    #[test]
    fn transfer_stops_on_clean_eof() {
        let mut src = tempfile::tempfile().expect("tempfile should open");
        src.write_all(&[9u8; 100]).expect("fill should succeed");
        src.seek(SeekFrom::Start(0)).expect("seek should succeed");

        let dst = tempfile::tempfile().expect("tempfile should open");

        // Ask for far more than the source holds.
        transfer(src.as_raw_fd(), dst.as_raw_fd(), 1 << 20)
            .expect("EOF is not an error");
        assert_eq!(
            dst.metadata().expect("metadata should read").len(),
            100
        );
    }

    // An interrupted read restarts and still returns the full
    // payload.
    #[test]
    fn read_full_survives_interruption() {
        use std::sync::atomic::{AtomicBool, Ordering};

        static SIGNALLED: AtomicBool = AtomicBool::new(false);

        extern "C" fn on_sigusr1(_: libc::c_int) {
            SIGNALLED.store(true, Ordering::SeqCst);
        }

        // Install without SA_RESTART so the blocked read really does
        // return EINTR.
        let handler: extern "C" fn(libc::c_int) = on_sigusr1;
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = 0;
            assert_eq!(
                libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()),
                0
            );
        }

        let (rx, tx) = pipe_pair();
        let reader = unsafe { libc::pthread_self() };
        // pthread_t is opaque; smuggle it across the thread as a word.
        let reader_word = reader as usize;

        let writer = std::thread::spawn(move || {
            let target = reader_word as libc::pthread_t;

            // Give the main thread time to block in read().
            std::thread::sleep(std::time::Duration::from_millis(50));
            unsafe { libc::pthread_kill(target, libc::SIGUSR1) };

            std::thread::sleep(std::time::Duration::from_millis(50));
            write_full(tx, b"interrupted?").expect("write should succeed");
            unsafe { libc::close(tx) };
        });

        let mut buf = [0u8; 12];
        read_full(rx, &mut buf).expect("read should ride out the signal");
        assert_eq!(&buf, b"interrupted?");
        assert!(SIGNALLED.load(Ordering::SeqCst));

        writer.join().expect("writer should finish");
        unsafe { libc::close(rx) };
    }
}
