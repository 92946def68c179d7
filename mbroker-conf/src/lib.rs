#![deny(unsafe_code)]

//! Settings for the mbroker core.
//!
//! Sources are layered in this order, later ones overriding earlier ones:
//! `/etc/mbroker/mbroker.toml`, `./mbroker.toml`, the file named by
//! [`Options::cfg_name`], then `MBROKER__*` environment variables
//! (`MBROKER__DELIVERY__WORKERS=8`).

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use serde::Deserialize;

use mbroker_utils::deserialize_duration;

pub use self::logging::Log;
pub use self::options::Options;

pub mod logging;
pub mod options;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub delivery: Delivery,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub dead_letter: DeadLetter,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Settings(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mbroker/mbroker").required(false))
            .add_source(File::with_name("mbroker").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("mbroker").prefix_separator("__").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(workers) = opts.delivery_workers {
            inner.delivery.workers = workers;
        }
        if let Some(enabled) = opts.dead_letter_enabled {
            inner.dead_letter.enabled = enabled;
        }

        inner.opts = opts;
        inner.validate()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("delivery workers is {}", self.delivery.workers);
        log::info!("delivery queue_max is {}", self.delivery.queue_max);
        log::info!("delivery idle_delay is {:?}", self.delivery.idle_delay);
        log::info!("queue default_capacity is {}", self.queue.default_capacity);
        log::info!("dead letter config is {:?}", self.dead_letter);
    }
}

impl Inner {
    fn validate(&self) -> Result<()> {
        if self.delivery.workers == 0 {
            return Err(anyhow!("delivery.workers must be greater than 0"));
        }
        if self.delivery.idle_delay.is_zero() {
            return Err(anyhow!("delivery.idle_delay must be greater than 0"));
        }
        if self.delivery.batch_size == 0 {
            return Err(anyhow!("delivery.batch_size must be greater than 0"));
        }
        if self.queue.default_capacity == 0 {
            return Err(anyhow!("queue.default_capacity must be greater than 0"));
        }
        let (low, high) = (self.queue.flow_low_watermark, self.queue.flow_high_watermark);
        if !(0.0 < low && low <= high && high <= 1.0) {
            return Err(anyhow!("queue flow watermarks must satisfy 0 < low <= high <= 1, got {low}/{high}"));
        }
        if self.dead_letter.exchange.is_empty() || self.dead_letter.queue.is_empty() {
            return Err(anyhow!("dead_letter exchange and queue names must not be empty"));
        }
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Delivery {
    //Worker count of the delivery task pool.
    #[serde(default = "Delivery::workers_default")]
    pub workers: usize,

    //Pending submissions the delivery task pool accepts.
    #[serde(default = "Delivery::queue_max_default")]
    pub queue_max: usize,

    //Delay before a delivery task that found no work runs again.
    #[serde(default = "Delivery::idle_delay_default", deserialize_with = "deserialize_duration")]
    pub idle_delay: Duration,

    //Messages moved per delivery task execution.
    #[serde(default = "Delivery::batch_size_default")]
    pub batch_size: usize,
}

impl Default for Delivery {
    #[inline]
    fn default() -> Self {
        Self {
            workers: Self::workers_default(),
            queue_max: Self::queue_max_default(),
            idle_delay: Self::idle_delay_default(),
            batch_size: Self::batch_size_default(),
        }
    }
}

impl Delivery {
    fn workers_default() -> usize {
        16
    }
    fn queue_max_default() -> usize {
        100_000
    }
    fn idle_delay_default() -> Duration {
        Duration::from_millis(50)
    }
    fn batch_size_default() -> usize {
        32
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Queue {
    #[serde(default = "Queue::default_capacity_default")]
    pub default_capacity: usize,
    //Occupancy ratio at which a queue reports itself blocked.
    #[serde(default = "Queue::flow_high_watermark_default")]
    pub flow_high_watermark: f64,
    //Occupancy ratio at which a blocked queue reports itself unblocked.
    #[serde(default = "Queue::flow_low_watermark_default")]
    pub flow_low_watermark: f64,
}

impl Default for Queue {
    #[inline]
    fn default() -> Self {
        Self {
            default_capacity: Self::default_capacity_default(),
            flow_high_watermark: Self::flow_high_watermark_default(),
            flow_low_watermark: Self::flow_low_watermark_default(),
        }
    }
}

impl Queue {
    fn default_capacity_default() -> usize {
        100_000
    }
    fn flow_high_watermark_default() -> f64 {
        0.8
    }
    fn flow_low_watermark_default() -> f64 {
        0.5
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetter {
    #[serde(default = "DeadLetter::enabled_default")]
    pub enabled: bool,
    #[serde(default = "DeadLetter::exchange_default")]
    pub exchange: String,
    #[serde(default = "DeadLetter::queue_default")]
    pub queue: String,
}

impl Default for DeadLetter {
    #[inline]
    fn default() -> Self {
        Self {
            enabled: Self::enabled_default(),
            exchange: Self::exchange_default(),
            queue: Self::queue_default(),
        }
    }
}

impl DeadLetter {
    fn enabled_default() -> bool {
        true
    }
    fn exchange_default() -> String {
        "amq.dlx".into()
    }
    fn queue_default() -> String {
        "amq.dlq".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_files() {
        let settings = Settings::new(Options::default()).expect("Settings creation failed");
        assert_eq!(settings.delivery.workers, 16);
        assert_eq!(settings.delivery.idle_delay, Duration::from_millis(50));
        assert_eq!(settings.dead_letter.exchange, "amq.dlx");
        assert_eq!(settings.dead_letter.queue, "amq.dlq");
        assert!(settings.dead_letter.enabled);
    }

    #[test]
    fn options_override() {
        let opts = Options { delivery_workers: Some(3), dead_letter_enabled: Some(false), ..Default::default() };
        let settings = Settings::new(opts).expect("Settings creation failed");
        assert_eq!(settings.delivery.workers, 3);
        assert!(!settings.dead_letter.enabled);
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut inner = Inner::default();
        inner.queue.flow_low_watermark = 0.9;
        inner.queue.flow_high_watermark = 0.5;
        assert!(inner.validate().is_err());

        let mut inner = Inner::default();
        inner.delivery.workers = 0;
        assert!(inner.validate().is_err());

        let mut inner = Inner::default();
        inner.delivery.idle_delay = Duration::ZERO;
        assert!(inner.validate().is_err());

        assert!(Inner::default().validate().is_ok());
    }

    fn from_toml(text: &str) -> Result<Inner> {
        let inner: Inner = Config::builder()
            .add_source(File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(inner)
    }

    #[test]
    fn idle_delay_from_file() {
        let inner = from_toml("[delivery]\nidle_delay = \"250ms\"\n").unwrap();
        assert_eq!(inner.delivery.idle_delay, Duration::from_millis(250));

        let err = from_toml("[delivery]\nidle_delay = \"50 millis\"\n").unwrap_err();
        assert!(err.to_string().contains("malformed duration"));

        let inner = from_toml("[delivery]\nidle_delay = \"0ms\"\n").unwrap();
        assert!(inner.validate().is_err());
    }
}
