//! Logging backend
//!
//! Implements the `log` facade for the framework. Lines are formatted into a
//! fixed stack buffer (no allocation, usable from interrupt context) and
//! handed to a sink installed by the platform:
//!
//! ```text
//! [     1.250] INFO  cfw::cfw::manager: svc#10 registered on port#3
//! ```

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

/// Size of one formatted line; longer lines are truncated
pub const LINE_SIZE: usize = 192;

/// Destination of formatted lines
pub type LogSink = fn(&str);

/// Millisecond time stamp source
pub type TimeSource = fn() -> u64;

/// Stack buffer for formatting log lines
struct LineBuffer {
    data: [u8; LINE_SIZE],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            data: [0u8; LINE_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        match core::str::from_utf8(&self.data[..self.len]) {
            Ok(s) => s,
            // truncated inside a multi-byte character
            Err(e) => core::str::from_utf8(&self.data[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let to_copy = bytes.len().min(LINE_SIZE - self.len);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

fn render(buf: &mut LineBuffer, time_ms: u64, level: Level, target: &str, args: fmt::Arguments<'_>) {
    let _ = write!(
        buf,
        "[{:>6}.{:03}] {:<5} {}: {}",
        time_ms / 1000,
        time_ms % 1000,
        level,
        target,
        args
    );
}

struct Config {
    sink: LogSink,
    level: LevelFilter,
}

static CONFIG: Once<Config> = Once::new();
static TIME: Once<TimeSource> = Once::new();

/// Framework logger
struct CfwLogger;

impl Log for CfwLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        CONFIG
            .get()
            .is_some_and(|c| metadata.level() <= c.level)
    }

    fn log(&self, record: &Record) {
        let Some(config) = CONFIG.get() else {
            return;
        };
        if record.level() > config.level {
            return;
        }
        let time_ms = TIME.get().map_or(0, |now| now());
        let mut line = LineBuffer::new();
        render(&mut line, time_ms, record.level(), record.target(), *record.args());
        (config.sink)(line.as_str());
    }

    fn flush(&self) {}
}

static LOGGER: CfwLogger = CfwLogger;

/// Install the logger; only the first call has an effect
pub fn init(sink: LogSink, level: LevelFilter) -> bool {
    CONFIG.call_once(|| Config { sink, level });
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(level))
        .is_ok()
}

/// Install the time stamp source; only the first call has an effect
pub fn set_time_source(now: TimeSource) {
    TIME.call_once(|| now);
}

/// Sink writing to the host's standard error
#[cfg(feature = "std")]
pub fn stderr_sink(line: &str) {
    std::eprintln!("{}", line);
}

/// Install the logger with the standard error sink
#[cfg(feature = "std")]
pub fn init_stderr(level: LevelFilter) -> bool {
    init(stderr_sink, level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_layout() {
        let mut buf = LineBuffer::new();
        render(&mut buf, 1250, Level::Info, "cfw::test", format_args!("svc#{} up", 10));
        assert_eq!(buf.as_str(), "[     1.250] INFO  cfw::test: svc#10 up");
    }

    #[test]
    fn long_lines_are_truncated() {
        let mut buf = LineBuffer::new();
        let long = [b'x'; LINE_SIZE * 2];
        let long = core::str::from_utf8(&long).unwrap();
        render(&mut buf, 0, Level::Warn, "t", format_args!("{}", long));
        assert_eq!(buf.as_str().len(), LINE_SIZE);
    }

    #[test]
    fn truncation_keeps_valid_utf8() {
        let mut buf = LineBuffer::new();
        let pad = [b'a'; LINE_SIZE - 1];
        let _ = buf.write_str(core::str::from_utf8(&pad).unwrap());
        let _ = buf.write_str("é");
        assert_eq!(buf.as_str().len(), LINE_SIZE - 1);
    }
}
