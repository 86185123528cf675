//! Daemon configuration.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format as _, Yaml};
use figment::Figment;
use serde::Deserialize;
use snafu::Snafu;

const fn default_flush_interval() -> u64 {
    10
}

const fn default_max_unprocessed() -> usize {
    1000
}

const fn default_max_timers_per_s() -> u64 {
    1000
}

const fn default_flush_rates() -> bool {
    true
}

const fn default_org_id() -> i32 {
    1
}

fn default_instance() -> String {
    "default".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8125".to_string()
}

fn default_admin_addr() -> String {
    "0.0.0.0:8126".to_string()
}

fn default_graphite_addr() -> String {
    "127.0.0.1:2003".to_string()
}

fn default_prefix_rates() -> String {
    "stats.".to_string()
}

fn default_prefix_counts() -> String {
    "stats_counts.".to_string()
}

fn default_prefix_gauges() -> String {
    "stats.gauges.".to_string()
}

fn default_prefix_timers() -> String {
    "stats.timers.".to_string()
}

fn default_percentiles() -> Vec<f64> {
    vec![0.9]
}

/// A configuration error.
#[derive(Debug, Snafu)]
pub enum ConfigurationError {
    /// The configuration sources could not be loaded or deserialized.
    #[snafu(display("failed to load configuration: {source}"))]
    Load {
        /// Error source.
        source: Box<figment::Error>,
    },

    /// Both downstream sinks were enabled.
    #[snafu(display("cannot enable both the graphite and tsdbgw outputs"))]
    BothSinksEnabled,

    /// Neither downstream sink was enabled.
    #[snafu(display("one of the graphite or tsdbgw outputs must be enabled"))]
    NoSinkEnabled,

    /// A configured percentile was outside `(0, 1)`.
    #[snafu(display("percentile {value} is not in (0, 1)"))]
    InvalidPercentile {
        /// The offending value.
        value: f64,
    },
}

/// Daemon configuration.
///
/// Loaded from an optional YAML file layered under `STATSD_`-prefixed
/// environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct Configuration {
    /// Instance name, used in internal metric namespacing.
    ///
    /// Defaults to `default`.
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Address the UDP listener binds to.
    ///
    /// Defaults to `0.0.0.0:8125`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address the plain-text TCP admin interface binds to.
    ///
    /// Defaults to `0.0.0.0:8126`.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    /// How often to flush aggregates, in seconds.
    ///
    /// Flushes are aligned to wall-clock multiples of this interval.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,

    /// Capacity of the parsed-metric channels feeding the aggregator and the
    /// stats monitor.
    ///
    /// When a channel is full the UDP read loop stalls, and further traffic
    /// is dropped by the kernel rather than silently inside the daemon.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_max_unprocessed")]
    pub max_unprocessed: usize,

    /// Target ceiling for timer submissions per second, used by the
    /// `sample_rate` admin command to advise clients on sampling.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_max_timers_per_s")]
    pub max_timers_per_s: u64,

    /// Whether flushes emit per-counter rates (sum divided by the flush
    /// interval).
    ///
    /// Defaults to `true`.
    #[serde(default = "default_flush_rates")]
    pub flush_rates: bool,

    /// Whether flushes emit per-counter raw counts.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub flush_counts: bool,

    /// Percentiles to summarize timers at, each in `(0, 1)`.
    ///
    /// A percentile `p` contributes `upper_<label>` and `mean_<label>`
    /// lines per timer bucket, where the label is the percentile number
    /// with the decimal point removed (0.75 becomes `75`).
    ///
    /// Defaults to `[0.9]`.
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,

    /// Prefix for counter rate lines.
    ///
    /// Defaults to `stats.`.
    #[serde(default = "default_prefix_rates")]
    pub prefix_rates: String,

    /// Prefix for counter count lines.
    ///
    /// Defaults to `stats_counts.`.
    #[serde(default = "default_prefix_counts")]
    pub prefix_counts: String,

    /// Prefix for gauge lines.
    ///
    /// Defaults to `stats.gauges.`.
    #[serde(default = "default_prefix_gauges")]
    pub prefix_gauges: String,

    /// Prefix for timer summary lines.
    ///
    /// Defaults to `stats.timers.`.
    #[serde(default = "default_prefix_timers")]
    pub prefix_timers: String,

    /// Namespace prefix for the daemon's own metrics.
    ///
    /// Defaults to `service_is_statsdaemon.instance_is_<instance>.`.
    #[serde(default)]
    pub prefix_internal: Option<String>,

    /// Organization id stamped on every metric sent to the gateway.
    ///
    /// Defaults to 1.
    #[serde(default = "default_org_id")]
    pub org_id: i32,

    /// Whether to write flushed metrics to Graphite.
    ///
    /// Mutually exclusive with `enable_tsdbgw`.
    #[serde(default)]
    pub enable_graphite: bool,

    /// Address of the Graphite line-protocol endpoint.
    ///
    /// Defaults to `127.0.0.1:2003`.
    #[serde(default = "default_graphite_addr")]
    pub graphite_addr: String,

    /// Whether to write flushed metrics to the HTTP metrics gateway.
    ///
    /// Mutually exclusive with `enable_graphite`.
    #[serde(default)]
    pub enable_tsdbgw: bool,

    /// URL of the HTTP metrics gateway.
    #[serde(default)]
    pub tsdbgw_addr: String,

    /// Bearer token for the HTTP metrics gateway.
    #[serde(default)]
    pub tsdbgw_api_key: String,
}

impl Configuration {
    /// Loads the configuration from the given YAML file, if any, layered
    /// under `STATSD_`-prefixed environment variables, and validates it.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("STATSD_"));

        let configuration: Self = figment.extract().map_err(|e| ConfigurationError::Load {
            source: Box::new(e),
        })?;
        configuration.validate()?;

        Ok(configuration)
    }

    /// Validates sink exclusivity and percentile bounds.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.enable_graphite && self.enable_tsdbgw {
            return Err(ConfigurationError::BothSinksEnabled);
        }
        if !self.enable_graphite && !self.enable_tsdbgw {
            return Err(ConfigurationError::NoSinkEnabled);
        }
        for &value in &self.percentiles {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigurationError::InvalidPercentile { value });
            }
        }
        Ok(())
    }

    /// The flush interval as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    /// The internal-metric namespace prefix, derived from the instance name
    /// unless overridden.
    pub fn prefix_internal(&self) -> String {
        self.prefix_internal
            .clone()
            .unwrap_or_else(|| format!("service_is_statsdaemon.instance_is_{}.", self.instance))
    }
}

/// Programmatic defaults, mirroring the serde defaults with the Graphite
/// sink enabled so the result passes validation.
impl Default for Configuration {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            flush_interval: default_flush_interval(),
            max_unprocessed: default_max_unprocessed(),
            max_timers_per_s: default_max_timers_per_s(),
            flush_rates: default_flush_rates(),
            flush_counts: false,
            percentiles: default_percentiles(),
            prefix_rates: default_prefix_rates(),
            prefix_counts: default_prefix_counts(),
            prefix_gauges: default_prefix_gauges(),
            prefix_timers: default_prefix_timers(),
            prefix_internal: None,
            org_id: default_org_id(),
            enable_graphite: true,
            graphite_addr: default_graphite_addr(),
            enable_tsdbgw: false,
            tsdbgw_addr: String::new(),
            tsdbgw_api_key: String::new(),
        }
    }
}
