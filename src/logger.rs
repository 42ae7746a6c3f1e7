//! Logging infrastructure
//!
//! Routes the `log` crate to the COM1 serial console. Lines carry a TSC
//! timestamp relative to [`init`] so transfer timings can be read straight off
//! the log.

use core::sync::atomic::{AtomicU64, Ordering};
use log::{Level, LevelFilter, Metadata, Record};

/// TSC value when the logger was installed
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

#[cfg(target_arch = "x86_64")]
fn rdtsc() -> u64 {
    crate::arch::x86_64::rdtsc()
}

#[cfg(not(target_arch = "x86_64"))]
fn rdtsc() -> u64 {
    0
}

/// Relative TSC ticks since boot, in thousands
pub fn get_timestamp_k() -> u64 {
    rdtsc().saturating_sub(BOOT_TSC.load(Ordering::Relaxed)) / 1000
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31mERROR\x1b[0m",
        Level::Warn => "\x1b[33mWARN\x1b[0m ",
        Level::Info => "\x1b[32mINFO\x1b[0m ",
        Level::Debug => "\x1b[34mDEBUG\x1b[0m",
        Level::Trace => "\x1b[35mTRACE\x1b[0m",
    }
}

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial_println!(
                "[{:>10}] [{}] {}",
                get_timestamp_k(),
                level_str(record.level()),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger
///
/// Safe to call more than once; later calls only reset the timestamp base.
pub fn init() {
    BOOT_TSC.store(rdtsc(), Ordering::Relaxed);
    crate::drivers::serial::init_early();

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
