//! Kernel print macros over an opaque character sink (§1 "out of scope":
//! the VGA text terminal and keyboard line editor are external; this module
//! only defines the narrow interface the core uses to reach them).

use core::fmt;

use crate::sync::Spinlock;

/// Anything the kernel can write formatted text to. The real kernel plugs
/// in a VGA text-mode writer (outside this crate's scope); host tests use
/// an in-memory buffer so `print!`/`println!` call sites stay exercised.
pub trait CharSink: Send {
    fn put_byte(&mut self, byte: u8);

    fn put_str(&mut self, s: &str) {
        for b in s.bytes() {
            self.put_byte(b);
        }
    }
}

struct Writer {
    sink: Option<&'static mut dyn CharSink>,
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.put_str(s);
        }
        Ok(())
    }
}

static CONSOLE: Spinlock<Writer> = Spinlock::new("console", Writer { sink: None });

/// Installs the real character sink. Called once at boot; before this runs,
/// `print!`/`println!` silently discard output rather than panicking, so
/// early boot tracing before the console driver exists is harmless.
pub fn install_sink(sink: &'static mut dyn CharSink) {
    CONSOLE.acquire().sink = Some(sink);
}

/// The PS/2 keyboard line editor (§1 "out of scope"), seen from the core
/// only as "something that can hand back one already-edited line at a
/// time". Real backspace/echo handling lives in the driver that implements
/// this trait.
pub trait KeyboardSource: Send {
    /// Copies up to `buf.len()` bytes of the next completed input line into
    /// `buf`, without a trailing newline, and returns how many were copied.
    /// Blocks (parking the calling process `ON_KBDIN`) until a line is
    /// available.
    fn read_line(&mut self, buf: &mut [u8]) -> usize;
}

static KEYBOARD: Spinlock<Option<&'static mut dyn KeyboardSource>> = Spinlock::new("keyboard", None);

pub fn install_keyboard(source: &'static mut dyn KeyboardSource) {
    *KEYBOARD.acquire() = Some(source);
}

/// `sys_kbdstr`'s backing call: 0 bytes if no keyboard driver was ever
/// installed (e.g. under host tests), matching a closed-but-empty stream.
pub fn read_line(buf: &mut [u8]) -> usize {
    KEYBOARD.acquire().as_deref_mut().map(|kbd| kbd.read_line(buf)).unwrap_or(0)
}

/// Writes `s` in foreground color `color` (0..=15, VGA text attribute low
/// nibble); the host/test sink ignores color and writes plain text.
pub fn print_colored(color: u8, s: &str) {
    use fmt::Write;
    let _ = color;
    let _ = CONSOLE.acquire().write_str(s);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = CONSOLE.acquire().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<u8>>);
    impl CharSink for &'static RecordingSink {
        fn put_byte(&mut self, byte: u8) {
            self.0.lock().unwrap().push(byte);
        }
    }

    #[test]
    fn println_reaches_installed_sink() {
        // `install_sink` takes over the single global console for the rest
        // of the process, so this is the only test allowed to touch it.
        static SINK: RecordingSink = RecordingSink(Mutex::new(Vec::new()));
        let leaked: &'static mut dyn CharSink = Box::leak(Box::new(&SINK));
        install_sink(leaked);
        println!("hello {}", 42);
        let bytes = SINK.0.lock().unwrap().clone();
        assert_eq!(bytes, b"hello 42\n");
    }
}
