//! This module tracks the status of issued chunk payloads in debug
//! builds.
use std::collections::HashMap;
use std::sync::Mutex;

lazy_static::lazy_static! {
    // Payload address -> live flag.  An address stays in the map once
    // seen; `true` means a caller currently holds it.
    static ref ISSUE_STATE_MAP: Mutex<HashMap<usize, bool>> = Default::default();
}

/// Confirms that `addr` is currently held by a caller.
pub fn is_issued(addr: usize) -> Result<(), &'static str> {
    let map = ISSUE_STATE_MAP.lock().unwrap();

    match map.get(&addr) {
        Some(true) => Ok(()),
        Some(false) => Err("chunk was already returned"),
        None => Err("chunk was never issued"),
    }
}

/// Marks `addr` as handed to a caller.
pub fn mark_issued(addr: usize) -> Result<(), &'static str> {
    let mut map = ISSUE_STATE_MAP.lock().unwrap();
    let live = map.entry(addr).or_insert(false);

    if *live {
        return Err("double issue");
    }

    *live = true;
    Ok(())
}

/// Marks `addr` as returned by a caller.
pub fn mark_returned(addr: usize) -> Result<(), &'static str> {
    let mut map = ISSUE_STATE_MAP.lock().unwrap();
    let live = map.get_mut(&addr).ok_or("returned unknown address")?;

    if !*live {
        return Err("double return");
    }

    *live = false;
    Ok(())
}

#[test]
fn issue_return_cycle() {
    let addr = 0xdead_0000usize;

    assert!(is_issued(addr).is_err());
    mark_issued(addr).expect("fresh issue should work");
    assert!(is_issued(addr).is_ok());
    assert!(mark_issued(addr).is_err());

    mark_returned(addr).expect("return of a live chunk should work");
    assert!(is_issued(addr).is_err());
    assert!(mark_returned(addr).is_err());

    mark_issued(addr).expect("reissue after return should work");
    mark_returned(addr).expect("cleanup");
}
