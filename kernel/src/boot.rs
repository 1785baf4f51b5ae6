//! Boot handoff.
//!
//! A multiboot-compliant loader (external collaborator) parses its own
//! tables and hands the kernel this normalized view: the physical memory
//! map, the boot device, the command line, and the module list whose first
//! entry is the initial ramdisk image.

#[cfg(feature = "alloc")]
extern crate alloc;

/// One physical memory range from the loader's memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub len: u64,
    /// True for plain usable RAM; everything else stays reserved.
    pub usable: bool,
}

/// One boot module: a byte range the loader left in memory for us.
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub start: usize,
    pub end: usize,
}

impl BootModule {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// The module contents. Only valid while the module region stays
    /// mapped (the low 16 MiB always is).
    pub fn as_slice(&self) -> &'static [u8] {
        // SAFETY: the loader guarantees the range holds the module and the
        // kernel never hands those frames out (they sit in the reserved
        // low region).
        unsafe { core::slice::from_raw_parts(self.start as *const u8, self.len()) }
    }
}

/// Everything the kernel keeps from the loader handshake.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub memory_map: &'static [MemoryRegion],
    pub modules: &'static [BootModule],
    pub cmdline: &'static str,
    pub boot_device: u32,
}

impl BootInfo {
    /// The initial ramdisk: first module by convention.
    pub fn initrd(&self) -> Option<BootModule> {
        self.modules.first().copied()
    }
}

static BOOT_INFO: spin::Once<BootInfo> = spin::Once::new();

/// Record the handoff. Called once by the loader shim before `kernel_main`.
pub fn set_boot_info(info: BootInfo) {
    BOOT_INFO.call_once(|| info);
}

pub fn boot_info() -> Option<&'static BootInfo> {
    BOOT_INFO.get()
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;

    #[test]
    fn initrd_is_first_module() {
        let modules = [
            BootModule {
                start: 0x40_0000,
                end: 0x47_c000,
            },
            BootModule {
                start: 0x50_0000,
                end: 0x50_1000,
            },
        ];
        let info = BootInfo {
            memory_map: &[],
            modules: Box::leak(Box::new(modules)),
            cmdline: "",
            boot_device: 0,
        };
        let initrd = info.initrd().unwrap();
        assert_eq!(initrd.len(), 0x7_c000);
    }
}
