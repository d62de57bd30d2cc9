use crate::common::config::LoggerConfig;
use log::{debug, info, LevelFilter};
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};
use std::fs;
use std::path::Path;
use std::str::FromStr;

const CONSOLE_PATTERN: &str = "{d(%H:%M:%S%.3f)} {h({l:<5})} {m}{n}";
const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}\n";

/// Falls back to `Info` for level names log does not know.
pub fn parse_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::Info)
}

fn rolling_file(config: &LoggerConfig) -> Result<RollingFileAppender, Box<dyn std::error::Error>> {
    let trigger = SizeTrigger::new(config.file_size * 1024 * 1024);
    let roller = FixedWindowRoller::builder()
        .base(0)
        .build(&config.archive_pattern, config.file_count)?;
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    if let Some(parent) = Path::new(&config.path).parent() {
        fs::create_dir_all(parent)?;
    }

    Ok(RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
        .build(&config.path, Box::new(policy))?)
}

/// Console on stderr, plus a rolling file when `path` is set. Stdout is left
/// to the probe report.
pub fn setup_logger(config: &LoggerConfig) -> Result<log4rs::Handle, Box<dyn std::error::Error>> {
    let level = parse_level(&config.level);

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();

    let mut builder = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(level)))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");

    if !config.path.is_empty() {
        let logfile = rolling_file(config)?;
        builder = builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    let handle = log4rs::init_config(builder.build(root.build(level))?)?;

    debug!("Logger initialized ({})", level);
    if !config.path.is_empty() {
        info!(
            "Log file: '{}', archive: '{}'",
            config.path, config.archive_pattern
        );
    }

    Ok(handle)
}
