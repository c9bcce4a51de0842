//! Progress percentages reported by the driver.
//!
//! ```text
//!  0 ─ 5 initializing ─ 10 converting ─ 20 ─── pages ─── 95 saving ─ 100
//! ```
//!
//! Each page owns an equal slice of 20..95; inside a page the slice is split
//! evenly across its regions.

pub const INITIALIZING: f32 = 5.0;
pub const CONVERTING: f32 = 10.0;
pub const CONVERTED: f32 = 20.0;
pub const SAVING: f32 = 95.0;
pub const DONE: f32 = 100.0;

const PAGES_SPAN: f32 = SAVING - CONVERTED;

/// Progress while rendering page artifacts (`rendered` of `total` done).
pub fn rendering(rendered: usize, total: usize) -> f32 {
    if total == 0 {
        return CONVERTING;
    }
    CONVERTING + (CONVERTED - CONVERTING) * ratio(rendered, total)
}

/// Progress at the start of the 0-based page `index`.
pub fn page_start(index: usize, total: usize) -> f32 {
    if total == 0 {
        return CONVERTED;
    }
    CONVERTED + PAGES_SPAN * ratio(index, total)
}

/// Progress before extracting region `region` of `regions` on page `index`.
pub fn region(index: usize, total: usize, region: usize, regions: usize) -> f32 {
    if total == 0 || regions == 0 {
        return page_start(index, total);
    }
    let slice = PAGES_SPAN / total as f32;
    page_start(index, total) + slice * ratio(region, regions)
}

fn ratio(done: usize, total: usize) -> f32 {
    done.min(total) as f32 / total as f32
}
