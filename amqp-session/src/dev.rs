use env_logger::Builder;
use std::io::Write;

/// Install a colored `env_logger` with millisecond timestamps. The filter comes from
/// `RUST_LOG`. Calling it again is a no-op.
pub fn setup_logger() {
    let mut builder = Builder::from_default_env();

    builder
        .format_timestamp_millis()
        .format(|buf, record| {
            let lvl = buf.default_level_style(record.level()).bold();

            writeln!(
                buf,
                "{} - [{lvl}{:5}{lvl:#}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Always);

    let _ = builder.try_init();
}

/// Log session progress when the session is verbose.
macro_rules! progress {
    ($verbose:expr, $($arg:tt)*) => {
        if $verbose {
            log::info!($($arg)*);
        }
    };
}

pub(crate) use progress;
