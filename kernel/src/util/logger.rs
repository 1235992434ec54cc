//! Kernel logger backend for the `log` facade.
//!
//! The core logs through `log::{trace!, debug!, info!, warn!, error!}` and
//! stays agnostic about where the text goes. The embedder hands `init` a
//! sink function (the serial driver, a framebuffer console); unit tests
//! hand it a capture buffer. Formatting happens into a fixed stack buffer,
//! so logging never allocates and works before the heap is up.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{LevelFilter, Log, Metadata, Record};

/// Where formatted log lines are delivered.
pub type Sink = fn(&str);

/// Formatted line budget. Longer records are truncated, not dropped.
const LINE_BUF: usize = 256;

static SINK: AtomicUsize = AtomicUsize::new(0);
static LOGGER: SinkLogger = SinkLogger;

struct SinkLogger;

/// Install the kernel logger.
///
/// The first call wins; later calls only adjust the level filter.
pub fn init(sink: Sink, level: LevelFilter) {
    SINK.store(sink as usize, Ordering::Release);
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let sink = SINK.load(Ordering::Acquire);
        if sink == 0 {
            return;
        }
        // Function pointers round-trip through usize; 0 means "not set".
        let sink: Sink = unsafe { core::mem::transmute(sink) };

        let mut buf = LineBuf::new();
        let _ = write!(buf, "[{:>5}] {}", record.level(), record.args());
        sink(buf.as_str());
        sink("\n");
    }

    fn flush(&self) {}
}

/// Fixed-capacity formatting buffer; overflow truncates.
struct LineBuf {
    bytes: [u8; LINE_BUF],
    len: usize,
}

impl LineBuf {
    fn new() -> Self {
        Self {
            bytes: [0; LINE_BUF],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        // Only whole UTF-8 chunks are ever appended.
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_BUF - self.len;
        let take = s.len().min(room);
        // Truncate on a char boundary so as_str stays valid UTF-8.
        let take = (0..=take)
            .rev()
            .find(|&i| s.is_char_boundary(i))
            .unwrap_or(0);
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buf_formats_and_truncates() {
        let mut buf = LineBuf::new();
        write!(buf, "tick {}", 42).unwrap();
        assert_eq!(buf.as_str(), "tick 42");

        let mut buf = LineBuf::new();
        for _ in 0..100 {
            let _ = write!(buf, "0123456789");
        }
        assert_eq!(buf.as_str().len(), LINE_BUF);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut buf = LineBuf::new();
        let s = "é".repeat(200); // 2 bytes per char, overflows the buffer
        let _ = write!(buf, "{s}");
        assert!(buf.as_str().chars().all(|c| c == 'é'));
    }
}
