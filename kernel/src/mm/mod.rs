//! Memory management.
//!
//! The virtual layout, unchanged across every address space:
//!
//! ```text
//! 0      4M     8M                                   3G    +4M              4G
//! ----------------------------------------------------------------------------
//! | ZERO | KERN |              Userspace             | KERN |     Kernel     |
//! | PAGE | LOW  |                                    | DIR  |      Heap      |
//! ----------------------------------------------------------------------------
//! ```
//!
//! The top quarter (3G..4G) is kernel-global: identical entries in every
//! directory, flagged global in the TLB. `KERN DIR` is a fixed 4 MiB window
//! onto physical 8M..12M holding the physical frame directory (first 2 MiB)
//! and the kernel heap's page tables (last 1 MiB), so the kernel can reach
//! any heap mapping through a fixed virtual address without walking physical
//! memory.
//!
//! Submodules: [`frame`] tracks physical frame ownership counts, [`paging`]
//! owns directories/tables and copy-on-write, [`user`] validates user
//! pointers, [`heap`] feeds the small-object allocator from page allocations.

pub mod frame;
pub mod heap;
pub mod paging;
pub mod user;

pub use frame::FrameDir;
pub use paging::{alloc_pages, clone_cow, free_pages, request_pages, AddressSpace};
pub use user::{safe_arr_null_term, safe_buf};

use bitflags::bitflags;

pub const PAGE_SIZE_SMALL: usize = 4 << 10;
pub const PAGE_SIZE_LARGE: usize = 4 << 20;

/// Entries per page table / page directory.
pub const NUM_ENTRIES: usize = 1 << 10;

/// Start of the kernel image mapping (one 4 MiB page at 4M..8M).
pub const KLOW_ADDR: usize = 4 << 20;
/// VGA text buffer, mapped in the zero page table.
pub const VIDEO_ADDR: usize = 0xb8000;

/// Virtual address of the KERN DIR window.
pub const KDIR_VIRT_ADDR: usize = 3 << 30;
/// Directory slot covering the KERN DIR window.
pub const KDIR_PDIR_IDX: usize = KDIR_VIRT_ADDR >> 22;
/// Physical backing of the KERN DIR window (8M..12M).
pub const KDIR_PHYS_ADDR: usize = 2 * PAGE_SIZE_LARGE;

/// Bottom of the kernel heap.
pub const KHEAP_ADDR: usize = KDIR_VIRT_ADDR + PAGE_SIZE_LARGE;
/// Global page index of the first heap page.
pub const KHEAP_PAGE_IDX: usize = KHEAP_ADDR / PAGE_SIZE_SMALL;
/// Number of 4 KiB pages in the kernel heap window (heap runs to the top
/// of the 32-bit address space).
pub const NUM_KHEAP_PAGES: usize = ((u32::MAX as usize) - KHEAP_ADDR + 1) / PAGE_SIZE_SMALL;

/// 4 MiB pages owned by the kernel outright: zero page, kernel image,
/// and the KERN DIR backing store.
pub const NUM_PREALLOCATE_LARGE: usize = 3;

/// First virtual address usable by userspace mappings.
pub const USER_FLOOR: usize = NUM_PREALLOCATE_LARGE * PAGE_SIZE_LARGE;
/// Userspace ends where the kernel-global quarter begins.
pub const USER_CEILING: usize = KDIR_VIRT_ADDR;

pub const fn page_idx(addr: usize) -> usize {
    addr >> 12
}

pub const fn page_dir_idx(addr: usize) -> usize {
    addr >> 22
}

pub const fn page_table_idx(addr: usize) -> usize {
    (addr >> 12) & 0x3ff
}

pub const fn page_idx_addr(idx: usize) -> usize {
    idx << 12
}

bitflags! {
    /// Allocation class for page requests.
    ///
    /// Default (empty) is a kernel-owned, 4 KiB, writable mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gfp: u32 {
        /// User-owned frame, user-visible mapping.
        const USER = 1 << 0;
        /// 4 MiB granularity.
        const LARGE = 1 << 1;
        /// Map read-only.
        const RO = 1 << 2;
    }
}

impl Gfp {
    pub const fn page_size(self) -> usize {
        if self.contains(Gfp::LARGE) {
            PAGE_SIZE_LARGE
        } else {
            PAGE_SIZE_SMALL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants() {
        assert_eq!(KDIR_PDIR_IDX, 768);
        assert_eq!(KHEAP_PAGE_IDX, 0xc0400);
        assert_eq!(USER_FLOOR, 12 << 20);
        assert_eq!(Gfp::LARGE.page_size(), 4 << 20);
        assert_eq!(Gfp::USER.page_size(), 4 << 10);
    }

    #[test]
    fn index_helpers() {
        assert_eq!(page_dir_idx(KDIR_VIRT_ADDR), 768);
        assert_eq!(page_table_idx(0x0040_3000), 3);
        assert_eq!(page_idx_addr(page_idx(0xb8000)), 0xb8000);
    }
}
