//! GDT, TSS, and the selector layout the SYSCALL contract imposes.
//!
//! Order matters: SYSCALL loads CS from STAR[47:32] and SS from +8, SYSRET
//! loads SS from STAR[63:48]+8 and CS from +16. Kernel code at 0x08 and
//! kernel data at 0x10, user data at 0x18 and user code at 0x20 satisfy
//! both directions.

use lazy_static::lazy_static;
use x86_64::{
    registers::segmentation::SegmentSelector,
    structures::{gdt::GlobalDescriptorTable, tss::TaskStateSegment},
    VirtAddr,
};

/// Stack used by the CPU for ring-3 -> ring-0 interrupt transitions
/// (TSS.RSP0).
const INTERRUPT_STACK_SIZE: usize = 32 * 1024;

#[repr(C, align(16))]
struct InterruptStack([u8; INTERRUPT_STACK_SIZE]);

static mut INTERRUPT_STACK: InterruptStack = InterruptStack([0; INTERRUPT_STACK_SIZE]);

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    user_data: SegmentSelector,
    user_code: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        // SAFETY: taking the address of the static stack; never aliased as
        // a Rust reference.
        let stack_start =
            VirtAddr::new(unsafe { core::ptr::addr_of!(INTERRUPT_STACK) } as u64);
        tss.privilege_stack_table[0] = stack_start + INTERRUPT_STACK_SIZE as u64;
        tss
    };
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        use x86_64::structures::gdt::Descriptor;
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss = gdt.append(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_data,
                user_code,
                tss,
            },
        )
    };
}

pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.kernel_code
}

pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.kernel_data
}

pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data
}

pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code
}

/// Load the GDT, reload the kernel segments, and install the TSS.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::{
            segmentation::{Segment, CS, DS, ES, SS},
            tables::load_tss,
        };

        GDT.0.load();
        // SAFETY: the selectors index the GDT just loaded.
        unsafe {
            CS::set_reg(GDT.1.kernel_code);
            SS::set_reg(GDT.1.kernel_data);
            DS::set_reg(GDT.1.kernel_data);
            ES::set_reg(GDT.1.kernel_data);
            load_tss(GDT.1.tss);
        }
    }
}
