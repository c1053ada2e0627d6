//! Process-wide parameters, computed once on first use.

use std::time::{SystemTime, UNIX_EPOCH};

use spin::Once;

pub struct Params {
    pub page_size: usize,
    /// Cookie mixed into chunk footers. Never 0, and its low three bits are
    /// `0b000` so it cannot be mistaken for a chunk head.
    pub magic: usize,
}

static PARAMS: Once<Params> = Once::new();

pub fn params() -> &'static Params {
    PARAMS.call_once(|| {
        let page_size = sysconf::page::pagesize();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as usize)
            .unwrap_or(0);
        let magic = ((seed ^ 0x5555_5555) | 8) & !7;
        Params { page_size, magic }
    })
}

pub fn page_size() -> usize {
    params().page_size
}

pub fn page_align(n: usize) -> usize {
    let page = page_size();
    (n + page - 1) & !(page - 1)
}

pub fn page_floor(n: usize) -> usize {
    n & !(page_size() - 1)
}
