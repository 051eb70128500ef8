use std::str::FromStr;
use std::time;

use common_kafka::config::KafkaConfig;
use envconfig::Envconfig;

use crate::consumer::{DispatchMode, DispatchOptions};
use crate::error::ConfigError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "kafka-consumer")]
    pub app_name: String,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "0")]
    pub max_concurrent_records: usize, // per batch, 0 means unbounded

    #[envconfig(default = "parallel")]
    pub dispatch_mode: DispatchMode, // parallel, partition

    #[envconfig(default = "true")]
    pub drop_batch_on_fetch_error: bool,

    #[envconfig(default = "false")]
    pub otel_enabled: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "5000")]
    pub shutdown_timeout_ms: EnvMsDuration, // bound on stopping the probe server
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            mode: self.dispatch_mode,
            max_concurrent_records: self.max_concurrent_records,
            drop_batch_on_fetch_error: self.drop_batch_on_fetch_error,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::EmptyAppName);
        }
        if !(0.0..=1.0).contains(&self.otel_sampling_rate) {
            return Err(ConfigError::InvalidSamplingRate(self.otel_sampling_rate));
        }
        if self.otel_enabled && self.otel_url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingOtelUrl);
        }
        self.kafka.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use common_kafka::config::KafkaConfigError;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, envconfig::Error> {
        let mut env = HashMap::from([(
            "KAFKA_CONSUMER_TOPIC".to_string(),
            "transactions".to_string(),
        )]);
        for (k, v) in pairs {
            drop(env.insert(k.to_string(), v.to_string()));
        }
        Config::init_from_hashmap(&env)
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]).expect("failed to load config");

        assert_eq!(config.app_name, "kafka-consumer");
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.kafka.kafka_consumer_topic, "transactions");
        assert_eq!(config.shutdown_timeout_ms.0, time::Duration::from_secs(5));
        assert!(!config.otel_enabled);

        let options = config.dispatch_options();
        assert_eq!(options.mode, DispatchMode::Parallel);
        assert_eq!(options.max_concurrent_records, 0);
        assert!(options.drop_batch_on_fetch_error);

        config.validate().expect("defaults are valid");
    }

    #[test]
    fn dispatch_settings() {
        let config = config_from(&[
            ("DISPATCH_MODE", "partition"),
            ("MAX_CONCURRENT_RECORDS", "16"),
            ("DROP_BATCH_ON_FETCH_ERROR", "false"),
        ])
        .expect("failed to load config");

        let options = config.dispatch_options();
        assert_eq!(options.mode, DispatchMode::Partition);
        assert_eq!(options.max_concurrent_records, 16);
        assert!(!options.drop_batch_on_fetch_error);

        assert!(config_from(&[("DISPATCH_MODE", "fifo")]).is_err());
    }

    #[test]
    fn telemetry_needs_an_endpoint() {
        let config = config_from(&[("OTEL_ENABLED", "true")]).expect("failed to load config");
        assert!(matches!(config.validate(), Err(ConfigError::MissingOtelUrl)));

        let config = config_from(&[("OTEL_ENABLED", "true"), ("OTEL_URL", "http://otel:4317")])
            .expect("failed to load config");
        config.validate().expect("valid telemetry config");
    }

    #[test]
    fn sampling_rate_bounds() {
        let config = config_from(&[("OTEL_SAMPLING_RATE", "1.5")]).expect("failed to load config");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSamplingRate(r)) if r == 1.5
        ));
    }

    #[test]
    fn kafka_errors_surface_through_validate() {
        let config = config_from(&[("KAFKA_SASL", "true"), ("KAFKA_SASL_MECHANISM", "OAUTHBEARER")])
            .expect("failed to load config");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Kafka(KafkaConfigError::UnsupportedSaslMechanism(_)))
        ));
    }
}
