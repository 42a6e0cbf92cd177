//! Logger installation. The level is fixed at build time by the `log-*`
//! features; `log-info` is the default.

use log::LevelFilter;

pub const MAX_LEVEL: LevelFilter = if cfg!(feature = "log-trace") {
    LevelFilter::Trace
} else if cfg!(feature = "log-debug") {
    LevelFilter::Debug
} else if cfg!(feature = "log-info") {
    LevelFilter::Info
} else if cfg!(feature = "log-warn") {
    LevelFilter::Warn
} else if cfg!(feature = "log-error") {
    LevelFilter::Error
} else {
    LevelFilter::Off
};

#[cfg(feature = "qemu")]
static LOGGER: kernel_qemu::QemuLogger = kernel_qemu::QemuLogger::new(MAX_LEVEL);

/// Install the kernel logger. Later calls keep the first logger.
pub fn init_logging() {
    #[cfg(feature = "qemu")]
    if LOGGER.init().is_err() {
        kernel_qemu::qemu_trace!("logger already installed\n");
    }
}
