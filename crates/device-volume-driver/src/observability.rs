//! Log sinks of the daemon: stderr or an append-only file, optionally mirrored to
//! journald under the plugin id.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry};

#[cfg(debug_assertions)]
const FALLBACK_LEVEL: Level = Level::DEBUG;

/// Granted devices are reported at info.
#[cfg(not(debug_assertions))]
const FALLBACK_LEVEL: Level = Level::INFO;

type FormatLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(format: &str) -> Result<Self> {
        match format {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            unknown => bail!("unknown log format: {}", unknown),
        }
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

fn format_layer(format: LogFormat, writer: BoxMakeWriter, ansi: bool) -> FormatLayer {
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    match format {
        LogFormat::Text => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .boxed(),
    }
}

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub log_debug_flag: bool,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
    pub systemd_log: bool,
    /// Syslog identifier of journald entries.
    pub identifier: String,
}

impl From<&crate::Opts> for ObservabilityConfig {
    fn from(opts: &crate::Opts) -> Self {
        Self {
            log_debug_flag: opts.debug,
            log_level: opts.log_level.to_owned(),
            log_file: opts.log_file.to_owned(),
            log_format: opts.log_format.to_owned(),
            systemd_log: opts.systemd_log,
            identifier: opts.plugin_id.to_owned(),
        }
    }
}

impl ObservabilityConfig {
    /// An explicit level wins over `--debug`.
    fn level(&self) -> Result<Level> {
        match (self.log_level.as_deref(), self.log_debug_flag) {
            (Some(level), _) => level
                .parse()
                .with_context(|| format!("invalid log level {level:?}")),
            (None, true) => Ok(Level::DEBUG),
            (None, false) => Ok(FALLBACK_LEVEL),
        }
    }

    fn format(&self) -> Result<LogFormat> {
        self.log_format
            .as_deref()
            .map_or(Ok(LogFormat::Text), LogFormat::from_str)
    }

    fn writer(&self) -> Result<BoxMakeWriter> {
        match &self.log_file {
            None => Ok(BoxMakeWriter::new(std::io::stderr)),
            Some(path) => Ok(BoxMakeWriter::new(open_log_file(path)?)),
        }
    }
}

pub fn init<T>(config: T) -> Result<()>
where
    T: Into<ObservabilityConfig>,
{
    let config = config.into();
    let level = LevelFilter::from(config.level()?);
    let fmt_layer = format_layer(config.format()?, config.writer()?, config.log_file.is_none());

    let (journald, journald_err) = if config.systemd_log {
        match tracing_journald::layer() {
            Ok(layer) => (Some(layer.with_syslog_identifier(config.identifier.clone())), None),
            Err(err) => (None, Some(err)),
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(level)
        .with(journald)
        .try_init()
        .map_err(|err| anyhow!("failed to init logger: {}", err))?;

    // the host journal socket is not always mounted into the daemon's container
    if let Some(err) = journald_err {
        tracing::warn!("journald logging unavailable: {}", err);
    }

    Ok(())
}
