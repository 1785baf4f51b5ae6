//! Kernel small-object allocator.
//!
//! `linked_list_allocator` provides the free-list; this file only feeds it
//! pages from the C3 page allocator. Every `Box`/`Vec`/`Arc` in the kernel
//! lands here.

#[cfg(target_os = "none")]
use super::{alloc_pages, Gfp, PAGE_SIZE_SMALL};

/// Initial heap handed to the allocator at boot (grown on demand).
#[cfg(target_os = "none")]
const INITIAL_HEAP_PAGES: usize = 2048; // 8 MiB

/// Carve the initial heap out of the kernel heap window and hand it to the
/// global allocator.
///
/// # Safety
/// Must run once, after `paging::init`, before the first allocation.
#[cfg(target_os = "none")]
pub unsafe fn init() {
    let base = alloc_pages(INITIAL_HEAP_PAGES, 0, Gfp::empty())
        .expect("cannot map initial kernel heap");
    // SAFETY: the range was just mapped, is exclusively ours, and stays
    // mapped for the kernel lifetime.
    unsafe {
        crate::ALLOCATOR
            .lock()
            .init(base as *mut u8, INITIAL_HEAP_PAGES * PAGE_SIZE_SMALL);
    }
    log::info!(
        "kernel heap: {} KiB at {:#x}",
        INITIAL_HEAP_PAGES * PAGE_SIZE_SMALL / 1024,
        base
    );
}

/// Host stub.
///
/// # Safety
/// No-op off target.
#[cfg(not(target_os = "none"))]
pub unsafe fn init() {}
