//! COM1 serial console.
//!
//! All kernel console output (print macros and the log backend) goes through
//! the 16550 UART so it is visible under QEMU's `-serial stdio` and on real
//! hardware debug headers.

use core::fmt;

#[cfg(target_os = "none")]
use core::fmt::Write;

#[cfg(target_os = "none")]
use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use spin::Mutex;

/// I/O port base of the first serial port.
#[cfg(target_os = "none")]
const COM1: u16 = 0x3F8;

#[cfg(target_os = "none")]
lazy_static! {
    static ref SERIAL1: Mutex<uart_16550::SerialPort> = {
        // SAFETY: COM1 is the standard first-UART port block; no other code
        // in the kernel touches ports 0x3F8..0x400.
        let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments) {
    SERIAL1
        .lock()
        .write_fmt(args)
        .expect("serial write failed");
}

// Host builds route console output to stdout so tests can print normally.
#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    use std::io::Write as _;
    let _ = std::io::stdout().write_fmt(args);
}

/// Write a single string with no formatting machinery. Used by the panic
/// path where the lock state of [`SERIAL1`] cannot be trusted.
#[cfg(target_os = "none")]
pub fn write_str_raw(s: &str) {
    // SAFETY: panic path only; the port may already be locked by the
    // interrupted flow, so bypass the mutex rather than deadlock.
    let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
    let _ = port.write_str(s);
}
