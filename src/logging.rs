//! `env_logger` setup shared by both binaries.

use std::io::Write;

use log::LevelFilter;

/// Level for a `-v` count: Info, Debug, then Trace.
pub fn level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialise logging to stderr. `RUST_LOG` overrides the `-v` level.
pub fn init(verbose: u8) {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(level_for(verbose));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    // A second call (tests, embedding) keeps the first logger.
    builder.try_init().ok();
}
