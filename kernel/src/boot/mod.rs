//! Multiboot2 boot information.
//!
//! The boot stub leaves two facts behind in the statics below before
//! jumping to `kmain`: where the bootloader put its info block, and where
//! the loaded image (including bss) ends. Everything else -- memory map,
//! framebuffer, modules -- is parsed out of the info block on demand.
//!
//! Modules stay in their boot-time physical location until the last one
//! has been handed to a process, at which point the whole bootloader
//! scratch region is released.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};
use spin::Mutex;

use crate::{
    mm::{self, temp_map, PhysAddr, PAGE_SIZE},
    process::{Process, ProcessName},
};

/// Physical address of the multiboot2 information block. Written by the
/// boot stub before `kmain` runs.
#[no_mangle]
pub static BOOT_MULTIBOOT_INFO_PHYS: AtomicU64 = AtomicU64::new(0);

/// Physical end of the loaded kernel image, including bss. Written by the
/// boot stub from the linker-provided end symbol.
#[no_mangle]
pub static BOOT_KERNEL_IMAGE_END: AtomicU64 = AtomicU64::new(0);

pub fn kernel_image_end() -> u64 {
    BOOT_KERNEL_IMAGE_END.load(Ordering::Acquire)
}

/// Parse the info block through the kernel-half view of low memory.
fn boot_information() -> Option<BootInformation<'static>> {
    let phys = BOOT_MULTIBOOT_INFO_PHYS.load(Ordering::Acquire);
    if phys == 0 {
        return None;
    }
    let virt = mm::phys_to_boot_virt(PhysAddr::new(phys)).as_u64();
    // SAFETY: the boot stub mapped low physical memory into the kernel
    // half, and the kernel keeps that mapping until the modules have been
    // consumed; the block is never written after boot.
    match unsafe { BootInformation::load(virt as *const BootInformationHeader) } {
        Ok(info) => Some(info),
        Err(e) => {
            log::error!("multiboot2 info at {:#x} failed to parse: {:?}", phys, e);
            None
        }
    }
}

/// Find the first byte past everything the bootloader left in memory: the
/// kernel image, the info block, and every module.
fn compute_start_of_free_memory(info: &BootInformation) -> u64 {
    let mut end = kernel_image_end();

    let info_end = (info.end_address() as u64).saturating_sub(mm::VIRTUAL_MEMORY_OFFSET);
    end = end.max(info_end);

    for module in info.module_tags() {
        end = end.max(module.end_address() as u64);
    }

    mm::round_up_to_page(end)
}

/// Read the memory map and build the physical frame stack. Runs before
/// the kernel address space exists.
pub fn init_physical_memory() {
    let info = match boot_information() {
        Some(info) => info,
        None => {
            log::error!("no multiboot2 information; no physical memory to manage");
            return;
        }
    };

    mm::set_start_of_free_memory_at_boot(compute_start_of_free_memory(&info));

    let memory_map = match info.memory_map_tag() {
        Some(tag) => tag,
        None => {
            log::error!("multiboot2 info carries no memory map");
            return;
        }
    };

    let total: u64 = memory_map.memory_areas().iter().map(|a| a.size()).sum();
    let available = memory_map
        .memory_areas()
        .iter()
        .filter(|area| MemoryAreaType::from(area.typ()) == MemoryAreaType::Available)
        .map(|area| (area.start_address(), area.size()));

    crate::mm::frame_allocator::init(available, total);
}

/// Framebuffer details for the get-framebuffer syscall:
/// `(physical address, width, height, pitch, bits per pixel)`.
pub fn framebuffer_details() -> Option<(u64, u64, u64, u64, u64)> {
    let info = boot_information()?;
    let fb = info.framebuffer_tag()?.ok()?;
    Some((
        fb.address(),
        fb.width() as u64,
        fb.height() as u64,
        fb.pitch() as u64,
        fb.bpp() as u64,
    ))
}

/// Flags parsed from the letters before the first space of a module
/// command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleFlags {
    pub is_driver: bool,
    pub can_create_processes: bool,
}

/// Split a module command line into its letter flags and name. `d` marks a
/// driver, `l` a process that may create others, `-` nothing. Returns
/// `None` on unknown letters or a missing name.
pub fn parse_module_command_line(cmdline: &str) -> Option<(ModuleFlags, &str)> {
    let mut flags = ModuleFlags::default();
    for (i, c) in cmdline.char_indices() {
        match c {
            ' ' => {
                let name = &cmdline[i + 1..];
                if name.is_empty() {
                    return None;
                }
                return Some((flags, name));
            }
            'd' => flags.is_driver = true,
            'l' => flags.can_create_processes = true,
            '-' => {}
            _ => {
                log::warn!("unknown module attribute '{}'", c);
                return None;
            }
        }
    }
    None
}

/// Hand-off state for the module syscall: modules go to exactly one
/// process (the first one that asks), one per call.
struct ModuleHandoff {
    next_index: usize,
    assigned_pid: Option<u64>,
    exhausted: bool,
}

static MODULE_HANDOFF: Mutex<ModuleHandoff> = Mutex::new(ModuleHandoff {
    next_index: 0,
    assigned_pid: None,
    exhausted: false,
});

/// Copy `bytes` into a process's address space at `dst_virt` (page
/// granular, the range must be mapped). The process need not be current:
/// each destination frame is reached through the temp window.
fn copy_bytes_into_process(process: &Arc<Process>, bytes: &[u8], dst_virt: u64) {
    let mut space = process.address_space.lock();
    let mut copied = 0usize;
    while copied < bytes.len() {
        let page_virt = dst_virt + copied as u64;
        let chunk = (bytes.len() - copied).min(PAGE_SIZE);
        let phys = match space.translate(page_virt, false) {
            Some(phys) => phys,
            None => return,
        };
        // SAFETY: the frame was just allocated for this copy and is only
        // reachable through this mapping until the syscall returns.
        unsafe {
            let dst = temp_map::map(phys, 7);
            core::ptr::copy_nonoverlapping(bytes.as_ptr().add(copied), dst, chunk);
        }
        copied += chunk;
    }
}

/// Result of handing one module to a process.
pub struct LoadedModule {
    /// Virtual address of the copy, with the flag bits in the low bits:
    /// bit 0 driver, bit 1 may-create-processes.
    pub address_and_flags: u64,
    pub size: u64,
    pub name: ProcessName,
}

/// Copy the next unconsumed module into the requesting process. Only the
/// first process that ever asks may consume modules; after the last one
/// the bootloader scratch memory is released.
pub fn load_next_module_into_process(process: &Arc<Process>) -> Option<LoadedModule> {
    let mut handoff = MODULE_HANDOFF.lock();
    if handoff.exhausted {
        return None;
    }
    match handoff.assigned_pid {
        None => handoff.assigned_pid = Some(process.pid.0),
        Some(pid) if pid != process.pid.0 => return None,
        _ => {}
    }

    let info = boot_information()?;
    let result = {
        let mut result = None;
        for (index, module) in info.module_tags().enumerate() {
            if index < handoff.next_index {
                continue;
            }
            handoff.next_index = index + 1;

            let size = (module.end_address() - module.start_address()) as u64;
            if size == 0 {
                continue;
            }
            let (flags, name) = match module.cmdline().ok().and_then(parse_module_command_line)
            {
                Some(parsed) => parsed,
                None => continue,
            };

            let pages = mm::pages_that_contain_bytes(size as usize) as u64;
            let address = match process.address_space.lock().allocate_pages(pages) {
                Some(address) => address,
                None => {
                    log::warn!("out of memory passing module {} to {}", name, process.name);
                    return None;
                }
            };

            // The module bytes are visible through the kernel half until
            // the boot memory is released below.
            let src_virt =
                mm::phys_to_boot_virt(PhysAddr::new(module.start_address() as u64)).as_u64();
            // SAFETY: boot memory is mapped and unaliased; size was
            // measured from the module tag.
            let bytes =
                unsafe { core::slice::from_raw_parts(src_virt as *const u8, size as usize) };
            copy_bytes_into_process(process, bytes, address);

            let mut address_and_flags = address;
            if flags.is_driver {
                address_and_flags |= 1;
            }
            if flags.can_create_processes {
                address_and_flags |= 2;
            }
            result = Some(LoadedModule {
                address_and_flags,
                size,
                name: ProcessName::from_str(name),
            });
            break;
        }
        result
    };

    if result.is_none() || handoff.next_index >= info.module_tags().count() {
        // Nothing left to hand out: the bootloader scratch region can be
        // reclaimed.
        handoff.exhausted = true;
        crate::mm::frame_allocator::done_with_boot_memory(kernel_image_end());
    }

    result
}

/// When the bootloader brought no modules at all, nothing will ever call
/// the module syscall, so the boot scratch region is released right away.
pub fn release_boot_memory_if_no_modules() {
    let has_modules = boot_information()
        .map(|info| info.module_tags().next().is_some())
        .unwrap_or(false);
    if has_modules {
        return;
    }
    MODULE_HANDOFF.lock().exhausted = true;
    crate::mm::frame_allocator::done_with_boot_memory(kernel_image_end());
}

/// Log the modules the bootloader brought, for the boot console.
pub fn log_modules() {
    if let Some(info) = boot_information() {
        for module in info.module_tags() {
            match module.cmdline().ok().and_then(parse_module_command_line) {
                Some((flags, name)) => log::info!(
                    "module {} ({} bytes{}{})",
                    name,
                    module.end_address() - module.start_address(),
                    if flags.is_driver { ", driver" } else { "" },
                    if flags.can_create_processes {
                        ", launcher"
                    } else {
                        ""
                    }
                ),
                None => log::warn!("module with unparsable command line"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_letters_select_properties() {
        let (flags, name) = parse_module_command_line("dl mouse driver").unwrap();
        assert!(flags.is_driver);
        assert!(flags.can_create_processes);
        assert_eq!(name, "mouse driver");

        let (flags, name) = parse_module_command_line("- shell").unwrap();
        assert_eq!(flags, ModuleFlags::default());
        assert_eq!(name, "shell");
    }

    #[test]
    fn bad_command_lines_are_rejected() {
        // Unknown attribute letter.
        assert!(parse_module_command_line("x shell").is_none());
        // No space, so no name.
        assert!(parse_module_command_line("dl").is_none());
        // Space but empty name.
        assert!(parse_module_command_line("d ").is_none());
    }

    #[test]
    fn flags_may_be_empty_before_the_space() {
        // A bare leading space means no flags at all.
        let (flags, name) = parse_module_command_line(" init").unwrap();
        assert_eq!(flags, ModuleFlags::default());
        assert_eq!(name, "init");
    }
}
