use std::sync::Once;

use env_logger::{Builder, Env};
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Parse a textual level such as `"debug"`; `None` or garbage yields `None`.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize logging (stderr formatter) based on `DZE_LOG`/`RUST_LOG`.
pub fn init_logging() {
    init_logging_with(None);
}

/// Initialize logging with an explicit level that wins over the environment.
/// Safe to call multiple times; only the first call installs the logger.
pub fn init_logging_with(level: Option<LevelFilter>) {
    RUST_LOG_ONCE.call_once(|| {
        builder(level)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

/// An explicit level or `DZE_LOG` sets one global level; otherwise `RUST_LOG`
/// is read as a full filter spec, defaulting to info.
fn builder(level: Option<LevelFilter>) -> Builder {
    let level = level.or_else(|| parse_level(std::env::var("DZE_LOG").ok().as_deref()));
    match level {
        Some(level) => {
            let mut builder = Builder::new();
            builder.filter_level(level);
            builder
        }
        None => Builder::from_env(Env::default().default_filter_or("info")),
    }
}
