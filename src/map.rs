//! Thin wrappers around the OS memory mapping primitives.  Page slabs
//! are backed by anonymous read-write private mappings acquired here.
use std::ffi::c_void;
use std::io;
use std::ptr::NonNull;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: {}", io::Error::last_os_error());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `size` up to the next multiple of the system page size.
pub fn round_to_page_size(size: usize) -> usize {
    let mask = page_size() - 1;

    (size + mask) & !mask
}

/// Attempts to map an anonymous read-write region of `size` bytes.
///
/// The `size` argument must be a multiple of the page size.
pub fn map_region(size: usize) -> io::Result<NonNull<c_void>> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(NonNull::new(base).expect("mmap never returns a NULL mapping"))
    }
}

/// Unmaps a region of `size` bytes starting at `base`.
///
/// The size argument must be a multiple of the page size.
pub fn unmap_region(base: NonNull<c_void>, size: usize) {
    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };
    assert_eq!(
        ret,
        0,
        "munmap of a live region cannot fail: {}",
        io::Error::last_os_error()
    );
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert!(page_size().is_power_of_two());
}

#[test]
fn test_round_to_page_size() {
    assert_eq!(round_to_page_size(1), page_size());
    assert_eq!(round_to_page_size(page_size()), page_size());
    assert_eq!(round_to_page_size(page_size() + 1), 2 * page_size());
}

// Map a region, dirty both ends, and unmap it.
#[test]
fn smoke_test() {
    let size = 4 * page_size();
    let base = map_region(size).expect("map should succeed");

    unsafe {
        let bytes = base.as_ptr() as *mut u8;

        bytes.write(42);
        bytes.add(size - 1).write(42);

        assert_eq!(bytes.read(), 42);
        assert_eq!(bytes.add(size - 1).read(), 42);
    }

    unmap_region(base, size);
}
