use env_logger::fmt::style::{AnsiColor, Style};
use log::LevelFilter;
use std::io::Write;

use crate::Result;
use crate::common::error::GridError;

const CRATE_TARGET: &str = "gridflow";

/// Logger that shows gridflow records at info level (debug when `verbose`) and only
/// warnings from other crates.
///
/// Verbose output carries millisecond timestamps and full targets. Otherwise lines are
/// `<time> <level> <module> <message>` with the module relative to the crate.
pub fn logging_builder(verbose: bool) -> env_logger::Builder {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module(
        CRATE_TARGET,
        if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
    );

    if verbose {
        builder.format_timestamp_millis();
    } else {
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            let dim = Style::new().fg_color(Some(AnsiColor::BrightBlack.into()));
            writeln!(
                buf,
                "{dim}{}{dim:#} {level_style}{}{level_style:#} {dim}{}{dim:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                short_target(record.target()),
                record.args()
            )
        });
    }
    builder
}

fn short_target(target: &str) -> &str {
    target
        .strip_prefix(CRATE_TARGET)
        .and_then(|rest| rest.strip_prefix("::"))
        .unwrap_or(target)
}

/// Installs [`logging_builder`] as the global logger. `RUST_LOG` overrides the levels.
pub fn setup_logging(verbose: bool) -> Result<()> {
    logging_builder(verbose)
        .parse_default_env()
        .try_init()
        .map_err(|error| GridError::Generic(format!("Cannot install logger: {error}")))
}

#[cfg(test)]
mod tests {
    use log::{Level, Log, Metadata};

    use crate::common::error::GridError;
    use crate::common::setup::{logging_builder, setup_logging, short_target};
    use crate::tests::utils::init_logging;

    fn enabled(verbose: bool, target: &str, level: Level) -> bool {
        let logger = logging_builder(verbose).build();
        logger.enabled(&Metadata::builder().target(target).level(level).build())
    }

    #[test]
    fn test_crate_levels() {
        assert!(enabled(false, "gridflow::engine", Level::Info));
        assert!(!enabled(false, "gridflow::engine", Level::Debug));
        assert!(enabled(true, "gridflow::engine", Level::Debug));
        assert!(!enabled(true, "gridflow::engine", Level::Trace));
    }

    #[test]
    fn test_other_crates_only_warn() {
        assert!(!enabled(true, "tokio::runtime", Level::Info));
        assert!(enabled(true, "tokio::runtime", Level::Warn));
    }

    #[test]
    fn test_short_target() {
        assert_eq!(short_target("gridflow::backend::batch"), "backend::batch");
        assert_eq!(short_target("gridflow"), "gridflow");
        assert_eq!(short_target("tokio::time"), "tokio::time");
        assert_eq!(short_target("gridflowx::io"), "gridflowx::io");
    }

    #[test]
    fn test_second_logger_is_rejected() {
        init_logging();
        assert!(matches!(setup_logging(false), Err(GridError::Generic(_))));
    }
}
