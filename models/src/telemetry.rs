//! Process-wide tracing setup for the lifecycle tool.
//!
//! Log lines go to stderr so that the JSON results printed on stdout stay machine-readable.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use std::io;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACING_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
const LOGGING_FORMATTER_ENV_VAR: &str = "LOGGING_FORMATTER";
const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// How tracing events are rendered: the line format plus ANSI coloring.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LogFormatter {
    message_format: MessageFormat,
    ansi_enabled: bool,
}

impl LogFormatter {
    pub fn try_from_env() -> Result<Self> {
        Ok(Self {
            message_format: MessageFormat::try_from_env()?,
            ansi_enabled: parse_ansi_enabled(env::var(LOGGING_ANSI_ENABLED_ENV_VAR).ok())?,
        })
    }

    fn add_format_layer<S>(&self, event_subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // Each formatter is a distinct layer type, so the subscriber is boxed per arm.
        let layer = fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(self.ansi_enabled);
        match self.message_format {
            MessageFormat::Full => Box::new(event_subscriber.with(layer)),
            MessageFormat::Compact => Box::new(event_subscriber.with(layer.compact())),
            MessageFormat::Pretty => Box::new(event_subscriber.with(layer.pretty())),
            MessageFormat::Json => Box::new(event_subscriber.with(layer.json())),
        }
    }
}

fn parse_ansi_enabled(value: Option<String>) -> Result<bool> {
    value
        .map(|ansi_enabled_str| {
            ansi_enabled_str
                .to_lowercase()
                .parse()
                .context(error::LogAnsiEnvSnafu {
                    env_value: ansi_enabled_str.to_string(),
                })
        })
        .unwrap_or(Ok(false))
}

/// Line formats offered by `tracing_subscriber::fmt`, selected by `LOGGING_FORMATTER`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Full,
    Compact,
    /// Multi-line, for reading a single run by eye.
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

impl MessageFormat {
    pub fn try_from_env() -> Result<Self> {
        Self::parse(env::var(LOGGING_FORMATTER_ENV_VAR).ok())
    }

    fn parse(value: Option<String>) -> Result<Self> {
        value
            .map(|formatter| {
                serde_plain::from_str(&formatter).context(error::LogFormatterEnvSnafu {
                    env_value: formatter,
                })
            })
            .unwrap_or(Ok(Default::default()))
    }
}

/// Installs the global tracing subscriber. `verbose` lowers the default level to DEBUG; an explicit
/// `TRACING_FILTER_DIRECTIVE` always wins.
pub fn init_telemetry_from_env(verbose: bool) -> Result<()> {
    let default_directive = if verbose {
        LevelFilter::DEBUG
    } else {
        DEFAULT_TRACING_FILTER_DIRECTIVE
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter);
    let subscriber = LogFormatter::try_from_env()?.add_format_layer(subscriber);

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use std::str::ParseBoolError;

    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Unable to install the tracing subscriber: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Unknown log format in {}='{}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "{}='{}' is not a boolean: '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;
