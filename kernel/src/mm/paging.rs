//! Two-level x86 paging with copy-on-write.
//!
//! One page directory per address space. The kernel quarter (3G..4G plus the
//! low kernel pages) is identical in every directory and flagged global; the
//! rest is per-task userspace. Kernel heap page tables live in the fixed
//! KERN DIR window, so translating a heap virtual address to its physical
//! frame is a single indexed load, never a physical-memory walk.
//!
//! CoW state machine per user PTE, observable through the frame counts:
//!
//! * private writable        (`RW`, share count 1)
//! * shared read-only CoW    (`!RW`, `COW`, share count >= 1)
//! * shared read-only        (`!RW`, `SHARED`) -- explicit sharing, never split
//!
//! Transitions happen only at fork ([`clone_directory`]), at free, and at a
//! write fault ([`clone_cow`]).

use core::ptr;

use bitflags::bitflags;

use super::frame;
use super::*;
use crate::arch::x86::cpu;
use crate::error::{Errno, KernelResult};
use crate::sync::IrqGuard;

bitflags! {
    /// Page directory / table entry bits. Bits 9..=11 are
    /// software-available; we use two of them for the CoW protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const RW = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// 4 MiB page (directory entries only).
        const LARGE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// Read-only because of copy-on-write; a write fault splits it.
        const COW = 1 << 9;
        /// Deliberately shared; fork leaves it alone and faults never split it.
        const SHARED = 1 << 10;
    }
}

/// One page directory or page table entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry(u32);

impl Entry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(phys: usize, flags: PteFlags) -> Self {
        debug_assert_eq!(phys & 0xfff, 0);
        Self(phys as u32 | flags.bits())
    }

    pub fn phys(self) -> usize {
        (self.0 & 0xffff_f000) as usize
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xfff)
    }

    pub fn contains(self, flags: PteFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn present(self) -> bool {
        self.contains(PteFlags::PRESENT)
    }

    pub fn set_flags(&mut self, set: PteFlags, clear: PteFlags) {
        self.0 = (self.0 & !clear.bits()) | set.bits();
    }

    pub fn set_phys(&mut self, phys: usize) {
        debug_assert_eq!(phys & 0xfff, 0);
        self.0 = (self.0 & 0xfff) | phys as u32;
    }
}

pub type PageDirectory = [Entry; NUM_ENTRIES];
pub type PageTable = [Entry; NUM_ENTRIES];

#[repr(C, align(4096))]
struct PageAligned<T>(T);

/// The kernel-global initial directory; every address space clones it.
static mut INIT_DIRECTORY: PageAligned<PageDirectory> = PageAligned([Entry::empty(); NUM_ENTRIES]);

/// Page table for the first 4 MiB: maps only the VGA text buffer.
static mut ZERO_PAGE_TABLE: PageAligned<PageTable> = PageAligned([Entry::empty(); NUM_ENTRIES]);

/// Virtual address of the active directory (not the CR3 physical); the
/// fault path and `request_pages` key off this.
static mut CURRENT_DIR: *mut PageDirectory = ptr::null_mut();

fn init_directory() -> *mut PageDirectory {
    // SAFETY: address-of only.
    unsafe { ptr::addr_of_mut!(INIT_DIRECTORY.0) }
}

/// The heap-mapping window: one `Entry` per global 4 KiB page index, valid
/// for indexes inside the kernel heap (and the KERN DIR region itself).
fn heap_table_entry(page_idx: usize) -> *mut Entry {
    (KDIR_VIRT_ADDR + page_idx * core::mem::size_of::<Entry>()) as *mut Entry
}

/// Physical address backing a kernel-heap virtual address.
fn heap_phys_of(vaddr: usize) -> usize {
    // SAFETY: the window is mapped for the whole kernel lifetime.
    unsafe { (*heap_table_entry(page_idx(vaddr))).phys() }
}

/// Public view of the heap window translation (TTY videomem relocation).
pub fn heap_phys(vaddr: usize) -> usize {
    heap_phys_of(vaddr)
}

/// Active page directory (virtual pointer).
pub fn current_directory() -> *mut PageDirectory {
    // SAFETY: written only under IrqGuard in switch_directory.
    let dir = unsafe { CURRENT_DIR };
    if dir.is_null() {
        init_directory()
    } else {
        dir
    }
}

/// Load `dir` into CR3. Kernel-global entries survive the TLB flush.
pub fn switch_directory(dir: *mut PageDirectory) {
    let _guard = IrqGuard::new();
    let phys = if dir == init_directory() {
        dir as usize
    } else {
        heap_phys_of(dir as usize)
    };
    // SAFETY: every directory we hand out keeps the kernel mapped.
    unsafe {
        CURRENT_DIR = dir;
        cpu::write_cr3(phys);
    }
}

/// Build the initial mappings, populate the frame directory from the boot
/// memory map, and turn paging on.
///
/// # Safety
/// Must be called exactly once, from early boot, with paging disabled and
/// the kernel running identity-mapped.
pub unsafe fn init(regions: &[crate::boot::MemoryRegion]) {
    let _guard = IrqGuard::new();

    // Stage 1: the frame table, reached through its physical address while
    // paging is still off.
    // SAFETY: KDIR_PHYS_ADDR..+2M is reserved for the frame table and
    // nothing else touches it during single-threaded boot.
    let phys_entries = unsafe {
        core::slice::from_raw_parts_mut(KDIR_PHYS_ADDR as *mut i16, frame::NUM_SMALL)
    };
    // SAFETY: exclusive ownership per above.
    let mut staged = unsafe { frame::FrameDir::new(phys_entries) };
    for region in regions {
        if region.usable {
            staged.add_region(region.base, region.len);
        }
    }
    staged.claim_kernel_prealloc();
    core::mem::forget(staged);

    // SAFETY: single-threaded boot; these statics are not yet shared.
    unsafe {
        ZERO_PAGE_TABLE.0[page_table_idx(VIDEO_ADDR)] = Entry::new(
            VIDEO_ADDR & !0xfff,
            PteFlags::PRESENT | PteFlags::RW | PteFlags::GLOBAL,
        );

        let dir = &mut INIT_DIRECTORY.0;
        dir[0] = Entry::new(
            ptr::addr_of!(ZERO_PAGE_TABLE) as usize,
            PteFlags::PRESENT | PteFlags::RW | PteFlags::GLOBAL,
        );
        dir[page_dir_idx(KLOW_ADDR)] = Entry::new(
            KLOW_ADDR,
            PteFlags::PRESENT | PteFlags::RW | PteFlags::LARGE | PteFlags::GLOBAL,
        );
        dir[KDIR_PDIR_IDX] = Entry::new(
            KDIR_PHYS_ADDR,
            PteFlags::PRESENT | PteFlags::RW | PteFlags::LARGE | PteFlags::GLOBAL,
        );

        // Kernel heap page tables live in the last MiB of the KERN DIR
        // region, one per 4 MiB of heap, indexed by directory slot.
        for dir_idx in page_dir_idx(KHEAP_ADDR)..NUM_ENTRIES {
            let table_phys = KDIR_PHYS_ADDR + (dir_idx * PAGE_SIZE_SMALL) % PAGE_SIZE_LARGE;
            ptr::write_bytes(table_phys as *mut u8, 0, PAGE_SIZE_SMALL);
            dir[dir_idx] = Entry::new(
                table_phys,
                PteFlags::PRESENT | PteFlags::RW | PteFlags::GLOBAL,
            );
        }

        cpu::write_cr3(init_directory() as usize);
        cpu::enable_paging();
        CURRENT_DIR = init_directory();
    }

    // Stage 2: hand the (already populated) table to the global service,
    // now reached through the KERN DIR window.
    // SAFETY: same memory as stage 1, now at its permanent virtual address
    // and owned by the frame directory from here on.
    unsafe {
        let virt_entries =
            core::slice::from_raw_parts_mut(KDIR_VIRT_ADDR as *mut i16, frame::NUM_SMALL);
        frame::init(frame::FrameDir::from_initialized(virt_entries));
    }

    log::info!(
        "paging on: kernel heap {:#x}..{:#x}, frame table in KERN DIR window",
        KHEAP_ADDR,
        usize::MAX
    );
}

/// Locate the kernel-virtual alias of a user page table from its directory
/// entry by scanning the heap window.
fn find_user_page_table(dir_entry: Entry) -> *mut PageTable {
    for idx in KHEAP_PAGE_IDX..KHEAP_PAGE_IDX + NUM_KHEAP_PAGES {
        // SAFETY: window is always mapped; entries are plain words.
        let entry = unsafe { *heap_table_entry(idx) };
        if entry.present() && entry.phys() == dir_entry.phys() {
            return page_idx_addr(idx) as *mut PageTable;
        }
    }
    panic!(
        "no virtual alias for page table at phys {:#x}",
        dir_entry.phys()
    );
}

/// Allocate and install a fresh user page table in `dir_entry`.
fn mk_user_table(dir_entry: *mut Entry) -> KernelResult<*mut PageTable> {
    // A user page needs a kernel page to hold its table.
    let table = alloc_pages(1, 0, Gfp::empty())? as *mut PageTable;
    // SAFETY: freshly mapped kernel page, exclusively ours.
    unsafe {
        ptr::write_bytes(table as *mut u8, 0, PAGE_SIZE_SMALL);
        *dir_entry = Entry::new(
            heap_phys_of(table as usize),
            PteFlags::PRESENT | PteFlags::RW | PteFlags::USER,
        );
    }
    Ok(table as *mut PageTable)
}

/// Map exactly `num` contiguous pages at `addr` with the requested class.
///
/// Atomic: on failure no partial mapping survives. TLB entries for the
/// range are invalidated on the current CPU. User pages come back zeroed.
pub fn request_pages(addr: usize, num: usize, gfp: Gfp) -> KernelResult<usize> {
    if addr % gfp.page_size() != 0 {
        return Err(Errno::EINVAL);
    }
    if num == 0 || num > NUM_ENTRIES {
        return Err(Errno::EINVAL);
    }

    let guard = IrqGuard::new();
    let mut mapped = 0usize;

    let res = (|| -> KernelResult<()> {
        if gfp.contains(Gfp::USER) {
            let dir = current_directory();
            if gfp.contains(Gfp::LARGE) {
                // SAFETY: directory pointers we hand out stay mapped.
                unsafe {
                    for off in 0..num {
                        if (*dir)[page_dir_idx(addr) + off].present() {
                            return Err(Errno::EEXIST);
                        }
                    }
                    for off in 0..num {
                        let phys = frame::alloc(gfp).ok_or(Errno::ENOMEM)?;
                        let mut flags = PteFlags::PRESENT | PteFlags::USER | PteFlags::LARGE;
                        if !gfp.contains(Gfp::RO) {
                            flags |= PteFlags::RW;
                        }
                        (*dir)[page_dir_idx(addr) + off] = Entry::new(phys, flags);
                        mapped += 1;
                    }
                }
            } else {
                // SAFETY: as above; table aliases come from the heap window.
                unsafe {
                    let dir_entry = &mut (*dir)[page_dir_idx(addr)] as *mut Entry;
                    let table = if (*dir_entry).present() {
                        if !(*dir_entry).contains(PteFlags::USER) {
                            return Err(Errno::EEXIST);
                        }
                        let table = find_user_page_table(*dir_entry);
                        for off in 0..num {
                            if (*table)[page_table_idx(addr) + off].present() {
                                return Err(Errno::EEXIST);
                            }
                        }
                        table
                    } else {
                        mk_user_table(dir_entry)?
                    };

                    for off in 0..num {
                        let phys = frame::alloc(gfp).ok_or(Errno::ENOMEM)?;
                        let mut flags = PteFlags::PRESENT | PteFlags::USER;
                        if !gfp.contains(Gfp::RO) {
                            flags |= PteFlags::RW;
                        }
                        (*table)[page_table_idx(addr) + off] = Entry::new(phys, flags);
                        mapped += 1;
                    }
                }
            }
        } else {
            if gfp.contains(Gfp::LARGE) {
                // No 4 MiB kernel mappings outside the preallocated set.
                return Err(Errno::EINVAL);
            }
            if addr < KHEAP_ADDR {
                return Err(Errno::EINVAL);
            }
            // SAFETY: heap window entries for a valid heap range.
            unsafe {
                for off in 0..num {
                    if (*heap_table_entry(page_idx(addr) + off)).present() {
                        return Err(Errno::EEXIST);
                    }
                }
                for off in 0..num {
                    let phys = frame::alloc(gfp).ok_or(Errno::ENOMEM)?;
                    let mut flags = PteFlags::PRESENT | PteFlags::GLOBAL;
                    if !gfp.contains(Gfp::RO) {
                        flags |= PteFlags::RW;
                    }
                    *heap_table_entry(page_idx(addr) + off) = Entry::new(phys, flags);
                    mapped += 1;
                }
            }
        }
        Ok(())
    })();

    match res {
        Ok(()) => {
            for off in 0..num {
                cpu::invlpg(addr + off * gfp.page_size());
            }
            drop(guard);
            if gfp.contains(Gfp::USER) && !gfp.contains(Gfp::RO) {
                // SAFETY: the range was just mapped writable for us.
                unsafe { ptr::write_bytes(addr as *mut u8, 0, num * gfp.page_size()) };
            }
            Ok(addr)
        }
        Err(e) => {
            // Unmap whatever prefix we managed before failing.
            free_pages(addr, mapped, gfp);
            drop(guard);
            Err(e)
        }
    }
}

/// Pick any free virtual range satisfying the constraints and map it.
///
/// Kernel allocations come from the reserved heap window; user allocations
/// scan user virtual space. `align_pow` is log2 of the page-granular
/// alignment.
pub fn alloc_pages(num: usize, align_pow: u8, gfp: Gfp) -> KernelResult<usize> {
    let align = 1usize << align_pow;
    if align > NUM_ENTRIES || num == 0 {
        return Err(Errno::EINVAL);
    }

    if gfp.contains(Gfp::USER) {
        if gfp.contains(Gfp::LARGE) {
            let mut start = page_dir_idx(USER_FLOOR);
            while start + num <= page_dir_idx(USER_CEILING) {
                if let Ok(addr) = request_pages(start * PAGE_SIZE_LARGE, num, gfp) {
                    return Ok(addr);
                }
                start += align;
            }
        } else {
            for big in page_dir_idx(USER_FLOOR)..page_dir_idx(USER_CEILING) {
                let mut start = 0usize;
                while start + num <= NUM_ENTRIES {
                    let addr = big * PAGE_SIZE_LARGE + start * PAGE_SIZE_SMALL;
                    if let Ok(addr) = request_pages(addr, num, gfp) {
                        return Ok(addr);
                    }
                    start += align;
                }
            }
        }
        Err(Errno::ENOMEM)
    } else {
        if gfp.contains(Gfp::LARGE) {
            return Err(Errno::EINVAL);
        }
        if KHEAP_PAGE_IDX % align != 0 {
            return Err(Errno::EINVAL);
        }
        let mut idx = KHEAP_PAGE_IDX;
        while idx + num <= KHEAP_PAGE_IDX + NUM_KHEAP_PAGES {
            if let Ok(addr) = request_pages(page_idx_addr(idx), num, gfp) {
                return Ok(addr);
            }
            idx += align;
        }
        Err(Errno::ENOMEM)
    }
}

fn free_one_page(addr: usize, gfp: Gfp) {
    let _guard = IrqGuard::new();
    let mut phys = None;

    if gfp.contains(Gfp::USER) {
        let dir = current_directory();
        // SAFETY: active directory walk under IrqGuard.
        unsafe {
            let dir_entry = &mut (*dir)[page_dir_idx(addr)];
            if dir_entry.present() && dir_entry.contains(PteFlags::USER) {
                if gfp.contains(Gfp::LARGE) && dir_entry.contains(PteFlags::LARGE) {
                    if !dir_entry.contains(PteFlags::SHARED) {
                        phys = Some(dir_entry.phys());
                    }
                    *dir_entry = Entry::empty();
                } else if !dir_entry.contains(PteFlags::LARGE) {
                    let table = find_user_page_table(*dir_entry);
                    let table_entry = &mut (*table)[page_table_idx(addr)];
                    if table_entry.present() && table_entry.contains(PteFlags::USER) {
                        if !table_entry.contains(PteFlags::SHARED) {
                            phys = Some(table_entry.phys());
                        }
                        *table_entry = Entry::empty();
                    }
                }
            }
        }
    } else if !gfp.contains(Gfp::LARGE) && addr >= KHEAP_ADDR {
        // SAFETY: heap window entry for a heap address.
        unsafe {
            let entry = heap_table_entry(page_idx(addr));
            if (*entry).present() && !(*entry).contains(PteFlags::USER) {
                phys = Some((*entry).phys());
                *entry = Entry::empty();
            }
        }
    }

    cpu::invlpg(addr);

    if let Some(phys) = phys {
        frame::free(phys, gfp);
    }
}

/// Release `num` pages starting at `addr`: drop the mapping, decrement the
/// physical share, invalidate the TLB. Unmapped pages in the range are
/// skipped silently, which makes rollback paths idempotent.
pub fn free_pages(addr: usize, num: usize, gfp: Gfp) {
    for off in 0..num {
        free_one_page(addr + off * gfp.page_size(), gfp);
    }
}

/// Produce a new directory: kernel half copied verbatim, every writable
/// user mapping downgraded to read-only CoW *in both source and
/// destination*, shares bumped. Kernel-only and SHARED mappings are left
/// alone.
pub fn clone_directory(src: *mut PageDirectory) -> KernelResult<*mut PageDirectory> {
    let dst = alloc_pages(1, 0, Gfp::empty())? as *mut PageDirectory;
    let guard = IrqGuard::new();

    // SAFETY: both directories are mapped kernel pages; we hold the irq
    // guard so no fault handler races the downgrade.
    let res = unsafe {
        (|| -> KernelResult<()> {
            for i in 0..NUM_ENTRIES {
                let src_entry = &mut (*src)[i];
                let dst_entry = &mut (*dst)[i];

                if !src_entry.present() {
                    *dst_entry = Entry::empty();
                } else if !src_entry.contains(PteFlags::USER) {
                    *dst_entry = *src_entry;
                } else if src_entry.contains(PteFlags::LARGE) {
                    *dst_entry = *src_entry;
                    if src_entry.contains(PteFlags::SHARED) {
                        // Alias mapping (videomem): copied verbatim, no
                        // ownership to account for.
                        continue;
                    }
                    if src_entry.contains(PteFlags::RW) {
                        src_entry.set_flags(PteFlags::COW, PteFlags::RW);
                        dst_entry.set_flags(PteFlags::COW, PteFlags::RW);
                    }
                    frame::share(src_entry.phys(), Gfp::USER | Gfp::LARGE);
                } else {
                    *dst_entry = Entry::empty();
                    let src_table = find_user_page_table(*src_entry);
                    let mut dst_table: Option<*mut PageTable> = None;

                    for j in 0..NUM_ENTRIES {
                        let src_te = &mut (*src_table)[j];
                        if !src_te.present() {
                            continue;
                        }
                        let table = match dst_table {
                            Some(t) => t,
                            None => {
                                let t = mk_user_table(dst_entry)?;
                                dst_table = Some(t);
                                t
                            }
                        };
                        let dst_te = &mut (*table)[j];
                        *dst_te = *src_te;
                        if src_te.contains(PteFlags::SHARED) {
                            continue;
                        }
                        if src_te.contains(PteFlags::RW) {
                            src_te.set_flags(PteFlags::COW, PteFlags::RW);
                            dst_te.set_flags(PteFlags::COW, PteFlags::RW);
                        }
                        frame::share(src_te.phys(), Gfp::USER);
                    }
                }
            }
            Ok(())
        })()
    };

    // The source lost write permission on CoW pages; flush stale TLB
    // entries before anyone writes through them.
    cpu::flush_tlb();
    drop(guard);

    match res {
        Ok(()) => Ok(dst),
        Err(e) => {
            free_directory(dst);
            Err(e)
        }
    }
}

/// A fresh address space: the kernel mapping and nothing else.
pub fn new_directory() -> KernelResult<*mut PageDirectory> {
    clone_directory(init_directory())
}

fn clone_cow_in(dir: *mut PageDirectory, addr: usize) -> bool {
    let _guard = IrqGuard::new();

    // SAFETY: directory walk under IrqGuard; scratch mappings are private.
    unsafe {
        let dir_entry = &mut (*dir)[page_dir_idx(addr)];
        if !dir_entry.present() || !dir_entry.contains(PteFlags::USER) {
            return false;
        }

        if dir_entry.contains(PteFlags::LARGE) {
            if dir_entry.contains(PteFlags::RW) || !dir_entry.contains(PteFlags::COW) {
                return false;
            }
            split_cow(dir_entry, addr & !(PAGE_SIZE_LARGE - 1), Gfp::USER | Gfp::LARGE)
        } else {
            let table = find_user_page_table(*dir_entry);
            let table_entry = &mut (*table)[page_table_idx(addr)];
            if !table_entry.present() || !table_entry.contains(PteFlags::USER) {
                return false;
            }
            if table_entry.contains(PteFlags::RW) || !table_entry.contains(PteFlags::COW) {
                return false;
            }
            split_cow(table_entry, addr & !(PAGE_SIZE_SMALL - 1), Gfp::USER)
        }
    }
}

/// Resolve one CoW fault on the entry mapping `page_addr`.
///
/// Share count 1: flip back to private writable in place. Otherwise copy
/// through a scratch mapping into a fresh frame, retarget the PTE, and drop
/// one share from the old frame.
///
/// # Safety
/// `entry` must be the live PTE mapping `page_addr` in the current
/// directory, and interrupts must be disabled.
unsafe fn split_cow(entry: *mut Entry, page_addr: usize, gfp: Gfp) -> bool {
    // SAFETY: per function contract.
    unsafe {
        (*entry).set_flags(PteFlags::RW, PteFlags::COW);

        let old_phys = (*entry).phys();
        if frame::share_count(old_phys, gfp) > 1 {
            let new_phys = match frame::alloc(gfp) {
                Some(p) => p,
                None => return false,
            };
            let scratch = match alloc_pages(1, 0, gfp) {
                Ok(s) => s,
                Err(_) => {
                    frame::free(new_phys, gfp);
                    return false;
                }
            };

            let size = gfp.page_size();
            ptr::copy_nonoverlapping(page_addr as *const u8, scratch as *mut u8, size);

            (*entry).set_phys(new_phys);
            cpu::invlpg(page_addr);
            ptr::copy_nonoverlapping(scratch as *const u8, page_addr as *mut u8, size);

            frame::free(old_phys, gfp);
            free_pages(scratch, 1, gfp);
        } else {
            cpu::invlpg(page_addr);
        }
    }
    true
}

/// Handle a write fault at `addr` in the current directory. Returns false
/// when the address is not a CoW mapping (a genuine fault).
pub fn clone_cow(addr: usize) -> bool {
    clone_cow_in(current_directory(), addr)
}

/// Tear down every user mapping in `dir`, then free the directory page.
/// Switches into `dir` for the walk so page-table pages resolve locally.
pub fn free_directory(dir: *mut PageDirectory) {
    let _guard = IrqGuard::new();

    let mut back = current_directory();
    if back == dir {
        back = init_directory();
    }
    switch_directory(dir);

    // SAFETY: walking the now-active directory with interrupts off.
    unsafe {
        for i in 0..NUM_ENTRIES {
            let dir_entry = (*dir)[i];
            if !dir_entry.present() || !dir_entry.contains(PteFlags::USER) {
                continue;
            }
            if dir_entry.contains(PteFlags::LARGE) {
                if !dir_entry.contains(PteFlags::SHARED) {
                    frame::free(dir_entry.phys(), Gfp::USER | Gfp::LARGE);
                }
            } else {
                let table = find_user_page_table(dir_entry);
                for j in 0..NUM_ENTRIES {
                    let te = (*table)[j];
                    if te.present() && !te.contains(PteFlags::SHARED) {
                        frame::free(te.phys(), Gfp::USER);
                    }
                }
                free_pages(table as usize, 1, Gfp::empty());
            }
        }
    }

    switch_directory(back);
    free_pages(dir as usize, 1, Gfp::empty());
}

/// Can `addr` be read (or written) through `dir` by the kernel on behalf of
/// the user? A write to a CoW page splits it right here, because the
/// supervisor ignores PTE write protection and would otherwise scribble on
/// a shared frame.
pub(super) fn addr_is_safe(dir: *mut PageDirectory, addr: usize, write: bool) -> bool {
    let _guard = IrqGuard::new();

    // SAFETY: directory walk under IrqGuard.
    unsafe {
        let dir_entry = (*dir)[page_dir_idx(addr)];
        if !dir_entry.present() || !dir_entry.contains(PteFlags::USER) {
            return false;
        }
        if dir_entry.contains(PteFlags::LARGE) {
            if write && !dir_entry.contains(PteFlags::RW) {
                if !dir_entry.contains(PteFlags::COW) {
                    return false;
                }
                return clone_cow_in(dir, addr);
            }
        } else {
            let table = find_user_page_table(dir_entry);
            let table_entry = (*table)[page_table_idx(addr)];
            if !table_entry.present() {
                return false;
            }
            if write && !table_entry.contains(PteFlags::RW) {
                if !table_entry.contains(PteFlags::COW) {
                    return false;
                }
                return clone_cow_in(dir, addr);
            }
        }
    }
    true
}

/// Turn a freshly allocated user 4 KiB page into an alias of `phys`: the
/// backing frame the allocation brought along is released and the PTE
/// retargeted, flagged SHARED so fork copies it verbatim and teardown
/// never frees the target frame (which the kernel owns).
pub fn make_alias(user_vaddr: usize, phys: usize) -> KernelResult<()> {
    let _guard = IrqGuard::new();
    let dir = current_directory();
    // SAFETY: walk of the active directory under IrqGuard; the caller just
    // mapped `user_vaddr` as a small user page.
    unsafe {
        let dir_entry = (*dir)[page_dir_idx(user_vaddr)];
        if !dir_entry.present() || dir_entry.contains(PteFlags::LARGE) {
            return Err(Errno::EINVAL);
        }
        let table = find_user_page_table(dir_entry);
        let entry = &mut (*table)[page_table_idx(user_vaddr)];
        if !entry.present() || !entry.contains(PteFlags::USER) {
            return Err(Errno::EINVAL);
        }
        frame::free(entry.phys(), Gfp::USER);
        entry.set_phys(phys & !0xfff);
        entry.set_flags(PteFlags::SHARED | PteFlags::RW, PteFlags::COW);
    }
    cpu::invlpg(user_vaddr);
    Ok(())
}

/// Point an existing SHARED alias in `dir` at a different physical page
/// (TTY foreground switch). The caller flushes the TLB afterwards.
pub fn rebind_alias(dir: *mut PageDirectory, user_vaddr: usize, phys: usize) -> KernelResult<()> {
    let _guard = IrqGuard::new();
    // SAFETY: directory walk under IrqGuard; only SHARED entries move.
    unsafe {
        let dir_entry = (*dir)[page_dir_idx(user_vaddr)];
        if !dir_entry.present() || dir_entry.contains(PteFlags::LARGE) {
            return Err(Errno::EINVAL);
        }
        let table = find_user_page_table(dir_entry);
        let entry = &mut (*table)[page_table_idx(user_vaddr)];
        if !entry.present() || !entry.contains(PteFlags::SHARED) {
            return Err(Errno::EINVAL);
        }
        entry.set_phys(phys & !0xfff);
    }
    Ok(())
}

/// Owning handle for a task address space. Clone of the handle is *not*
/// fork; `fork_cow` is. Dropping the last handle frees every user mapping.
pub struct AddressSpace {
    dir: *mut PageDirectory,
}

// SAFETY: the raw directory pointer is only dereferenced under IrqGuard.
unsafe impl Send for AddressSpace {}
// SAFETY: as above.
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    /// Fresh user address space (kernel mapping only).
    pub fn new() -> KernelResult<Self> {
        Ok(Self {
            dir: new_directory()?,
        })
    }

    /// CoW snapshot of this space, for fork without `CLONE_VM`.
    pub fn fork_cow(&self) -> KernelResult<Self> {
        Ok(Self {
            dir: clone_directory(self.dir)?,
        })
    }

    pub fn raw(&self) -> *mut PageDirectory {
        self.dir
    }

    /// Make this the active address space.
    pub fn activate(&self) {
        switch_directory(self.dir);
    }

    pub fn is_active(&self) -> bool {
        current_directory() == self.dir
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // If we are tearing down the active space, free_directory parks the
        // CPU back on the init directory.
        free_directory(self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let mut e = Entry::new(0x1234_5000, PteFlags::PRESENT | PteFlags::RW | PteFlags::USER);
        assert!(e.present());
        assert_eq!(e.phys(), 0x1234_5000);
        e.set_flags(PteFlags::COW, PteFlags::RW);
        assert!(!e.contains(PteFlags::RW));
        assert!(e.contains(PteFlags::COW));
        e.set_phys(0x7700_0000);
        assert_eq!(e.phys(), 0x7700_0000);
        assert!(e.contains(PteFlags::COW | PteFlags::PRESENT));
    }

    #[test]
    fn cow_flag_transitions_are_exclusive() {
        // private writable -> shared CoW -> private writable
        let mut e = Entry::new(0x40_0000, PteFlags::PRESENT | PteFlags::USER | PteFlags::RW);
        e.set_flags(PteFlags::COW, PteFlags::RW);
        assert_eq!(
            e.flags() & (PteFlags::RW | PteFlags::COW),
            PteFlags::COW
        );
        e.set_flags(PteFlags::RW, PteFlags::COW);
        assert_eq!(e.flags() & (PteFlags::RW | PteFlags::COW), PteFlags::RW);
    }
}
