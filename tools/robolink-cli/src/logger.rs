//! Stderr logger setup.

use log::LevelFilter;

/// Initialise the logger for this execution. Must only be called once.
pub fn init(min_level: LevelFilter) -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {:5} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(min_level)
        .chain(std::io::stderr())
        .apply()
}
