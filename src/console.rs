//! Console access for user processes
//!
//! Standard input and standard output of every process are the kernel
//! console. The console device itself is provided by the platform.
//!
//! # Security Considerations
//! - User bytes are copied into kernel memory before they reach the device
//! - Output goes out in one call per buffer so lines are not interleaved

use core::fmt::{self, Write};

/// A character console.
pub trait Console: Send + Sync {
    /// Write `bytes` to the console in one piece.
    fn put_bytes(&self, bytes: &[u8]);

    /// Block until a byte of keyboard input is available and return it.
    fn get_byte(&self) -> u8;
}

/// `fmt::Write` adapter over a [`Console`].
pub struct ConsoleWriter<'a>(pub &'a dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_bytes(s.as_bytes());
        Ok(())
    }
}

/// Print to a console.
#[macro_export]
macro_rules! kprint {
    ($console:expr, $($arg:tt)*) => {{
        use core::fmt::Write;
        let mut writer = $crate::console::ConsoleWriter(&*$console);
        let _ = write!(writer, $($arg)*);
    }};
}

/// Print a line to a console.
#[macro_export]
macro_rules! kprintln {
    ($console:expr) => {
        $crate::kprint!($console, "\n")
    };
    ($console:expr, $($arg:tt)*) => {{
        $crate::kprint!($console, "{}\n", format_args!($($arg)*));
    }};
}
