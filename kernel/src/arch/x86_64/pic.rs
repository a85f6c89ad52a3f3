//! Legacy 8259 PIC pair, remapped so IRQ 0..15 land on vectors 32..47
//! instead of overlapping the CPU exceptions.

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the primary PIC.
pub const PIC_1_OFFSET: u8 = 32;
/// First vector of the secondary PIC.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

// SAFETY: the offsets do not overlap CPU exceptions.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap the controllers and unmask every line; drivers decide what they
/// listen to by registering message bindings, not by PIC masks.
pub fn init() {
    #[cfg(target_os = "none")]
    // SAFETY: standard remap sequence during single-flow boot.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0, 0);
    }
}

/// Signal end-of-interrupt for `irq` (0..16). Notifies the secondary
/// controller too when the line belongs to it.
pub fn end_of_interrupt(irq: u8) {
    #[cfg(target_os = "none")]
    // SAFETY: called exactly once per taken IRQ.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq);
    }
}
