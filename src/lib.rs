//! `ec-sensord` runs the identity and file tracking engine of
//! [`tracking_core`] over a stream of raw probe records.
//!
//! Records are read as JSON lines (from a file or stdin), routed through a
//! [`tracking_core::Sensor`] and the resulting events are written to stdout
//! as JSON lines, in delivery order. Example:
//!
//! ```sh
//! ec-sensord --input records.jsonl --dump
//! ```
//!
//! Engine settings come from the `[tracking]` section of the INI
//! configuration file, see [`sensord::SensorConfig`].

pub mod cli;
pub mod sensord;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder()
            .filter_level(level_filter)
            .format_timestamp(None)
            .format_target(false)
            .init();
    }
}
