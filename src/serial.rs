use core::fmt::{self, Write};
use spin::Mutex;
use uart_16550::SerialPort;

/// COM1 base port, the conventional kernel console
const COM1: u16 = 0x3F8;

struct SerialConsole {
    port: Option<SerialPort>,
}

impl SerialConsole {
    const fn new() -> Self {
        Self { port: None }
    }

    fn ensure_init(&mut self) {
        if self.port.is_none() {
            let mut port = unsafe { SerialPort::new(COM1) };
            port.init();
            self.port = Some(port);
        }
    }

    fn write_str_normalized(&mut self, s: &str) {
        if let Some(ref mut port) = self.port {
            for byte in s.bytes() {
                // Terminal emulators on the other end expect CRLF
                if byte == b'\n' {
                    port.send(b'\r');
                }
                port.send(byte);
            }
        }
    }
}

impl fmt::Write for SerialConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str_normalized(s);
        Ok(())
    }
}

static SERIAL1: Mutex<SerialConsole> = Mutex::new(SerialConsole::new());

pub fn init() {
    SERIAL1.lock().ensure_init();
}

pub(crate) fn _print(args: fmt::Arguments<'_>) {
    let mut console = SERIAL1.lock();
    console.ensure_init();
    console.write_fmt(args).ok();
}
