//! Raw I/O port access, used by the IRQ port-drain bindings and the PIT.

use x86_64::instructions::port::Port;

/// Read one byte from an I/O port.
pub fn read_io_byte(port: u16) -> u8 {
    // SAFETY: port I/O only reaches devices; drivers name the ports they
    // registered for and the kernel's own uses are fixed (PIT, PIC, UART).
    unsafe { Port::new(port).read() }
}

/// Write one byte to an I/O port.
pub fn write_io_byte(port: u16, value: u8) {
    // SAFETY: see read_io_byte.
    unsafe { Port::new(port).write(value) }
}
