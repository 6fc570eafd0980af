//! The module containing the UART (serial port) logger implementation.
//!
//! The embedding kernel may install any `log` backend before initializing
//! this crate; this module is the fallback used during bring-up, writing to
//! COM1 with the originating processor's APIC ID prefixed to each line.

use crate::{
    config::LOGGING_LEVEL,
    x86_instructions::{inb, outb},
};
use core::{fmt, fmt::Write};
use spin::Mutex;

/// Installs the UART logger as the `log` backend. Must be called at most
/// once, before any other processor starts logging.
pub fn init_uart_logger() {
    log::set_logger(&UART_LOGGER)
        .map(|()| log::set_max_level(LOGGING_LEVEL))
        .unwrap();
}

const UART_COM1: u16 = 0x3f8;
const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0;
const UART_OFFSET_LINE_STATUS: u16 = 5;

struct Uart {
    io_port_base: u16,
}

impl Write for Uart {
    // Waits for the transmitter to drain, then emits bytes one at a time.
    fn write_str(&mut self, string: &str) -> Result<(), fmt::Error> {
        for byte in string.bytes() {
            while (inb(self.io_port_base + UART_OFFSET_LINE_STATUS) & 0x20) == 0 {}
            outb(
                self.io_port_base + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER,
                byte,
            );
        }
        Ok(())
    }
}

struct UartLogger {
    port: Mutex<Uart>,
}

impl log::Log for UartLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Trace
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                self.port.lock(),
                "#{}:{}: {}",
                apic_id(),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Gets the local APIC ID of the calling processor.
fn apic_id() -> u32 {
    // See: CPUID Fn0000_0001_EBX LocalApicId, LogicalProcessorCount, CLFlush
    x86::cpuid::cpuid!(0x1).ebx >> 24
}

static UART_LOGGER: UartLogger = UartLogger {
    port: Mutex::new(Uart {
        io_port_base: UART_COM1,
    }),
};
