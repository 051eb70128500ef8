use std::fs::File;
use std::io;
use std::str::FromStr;

use envconfig::Envconfig;
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::warn;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // comma-separated broker list

    pub kafka_consumer_topic: String,

    #[envconfig(default = "kafka-consumer-group")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "")]
    pub kafka_rebalance_strategy: String, // roundrobin, range, sticky

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
    pub kafka_tls_ca_file: Option<String>,
    pub kafka_tls_cert_file: Option<String>,
    pub kafka_tls_key_file: Option<String>,

    #[envconfig(default = "false")]
    pub kafka_sasl: bool,
    #[envconfig(default = "PLAIN")]
    pub kafka_sasl_mechanism: String, // PLAIN, SCRAM-SHA-256, SCRAM-SHA-512
    pub kafka_sasl_username: Option<String>,
    pub kafka_sasl_password: Option<String>,

    #[envconfig(default = "5242880")]
    pub kafka_fetch_max_bytes: u32, // 5 MiB

    #[envconfig(default = "500")]
    pub kafka_fetch_max_records: usize, // upper bound on records returned by one poll

    #[envconfig(default = "100")]
    pub kafka_fetch_wait_ms: u64, // how long a poll keeps filling a batch after the first record
}

#[derive(Error, Debug)]
pub enum KafkaConfigError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("unsupported SASL mechanism: {0}")]
    UnsupportedSaslMechanism(String),
    #[error("SASL is enabled but username or password is missing")]
    MissingSaslCredentials,
    #[error("TLS certificate and key must be configured together")]
    IncompleteKeyPair,
    #[error("cannot read TLS file {path}: {source}")]
    TlsFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("kafka client error: {0}")]
    Client(#[from] KafkaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceStrategy {
    RoundRobin,
    Range,
    Sticky,
}

impl RebalanceStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "roundrobin" => Some(Self::RoundRobin),
            "range" => Some(Self::Range),
            "sticky" => Some(Self::Sticky),
            _ => None,
        }
    }

    /// Value for librdkafka's `partition.assignment.strategy`.
    pub fn assignment_strategy(&self) -> &'static str {
        match self {
            Self::RoundRobin => "roundrobin",
            Self::Range => "range",
            Self::Sticky => "cooperative-sticky",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = KafkaConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            _ => Err(KafkaConfigError::UnsupportedSaslMechanism(s.to_owned())),
        }
    }
}

impl KafkaConfig {
    pub fn validate(&self) -> Result<(), KafkaConfigError> {
        if self.kafka_hosts.trim().is_empty() {
            return Err(KafkaConfigError::EmptyField("KAFKA_HOSTS"));
        }
        if self.kafka_consumer_topic.trim().is_empty() {
            return Err(KafkaConfigError::EmptyField("KAFKA_CONSUMER_TOPIC"));
        }
        if self.kafka_consumer_group.trim().is_empty() {
            return Err(KafkaConfigError::EmptyField("KAFKA_CONSUMER_GROUP"));
        }
        if self.kafka_tls && self.kafka_tls_cert_file.is_some() != self.kafka_tls_key_file.is_some()
        {
            return Err(KafkaConfigError::IncompleteKeyPair);
        }
        if self.kafka_sasl {
            self.kafka_sasl_mechanism.parse::<SaslMechanism>()?;
            if self.kafka_sasl_username.as_deref().unwrap_or_default().is_empty()
                || self.kafka_sasl_password.is_none()
            {
                return Err(KafkaConfigError::MissingSaslCredentials);
            }
        }
        Ok(())
    }

    /// Builds the rdkafka client options for a group consumer of this config.
    /// TLS files are opened here so a bad path fails startup instead of the
    /// first broker connection.
    pub fn client_config(&self) -> Result<ClientConfig, KafkaConfigError> {
        self.validate()?;

        let mut builder =
            ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
                .with_offset_reset(&self.kafka_consumer_offset_reset)
                .with_fetch_max_bytes(self.kafka_fetch_max_bytes);

        match RebalanceStrategy::from_name(&self.kafka_rebalance_strategy) {
            Some(strategy) => builder = builder.with_rebalance_strategy(strategy),
            None => warn!(
                strategy = %self.kafka_rebalance_strategy,
                "unknown rebalance strategy, using client default"
            ),
        }

        if self.kafka_tls {
            builder = builder.with_tls(
                self.kafka_tls_ca_file.as_deref(),
                self.kafka_tls_cert_file
                    .as_deref()
                    .zip(self.kafka_tls_key_file.as_deref()),
            )?;
        }

        if self.kafka_sasl {
            let (Some(username), Some(password)) = (
                self.kafka_sasl_username.as_deref(),
                self.kafka_sasl_password.as_deref(),
            ) else {
                return Err(KafkaConfigError::MissingSaslCredentials);
            };
            builder = builder.with_sasl(self.kafka_sasl_mechanism.parse()?, username, password);
        }

        Ok(builder.build())
    }
}

/// Consumer option builder. Security protocol is derived at `build` time from
/// whichever of TLS and SASL were enabled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
    tls: bool,
    sasl: bool,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000");

        Self {
            config,
            tls: false,
            sasl: false,
        }
    }

    /// Enable TLS. The CA and the client key pair are optional; any file
    /// given must be readable.
    pub fn with_tls(
        mut self,
        ca_file: Option<&str>,
        key_pair: Option<(&str, &str)>,
    ) -> Result<Self, KafkaConfigError> {
        self.tls = true;
        if let Some(ca) = ca_file {
            check_readable(ca)?;
            self.config.set("ssl.ca.location", ca);
        }
        if let Some((cert, key)) = key_pair {
            check_readable(cert)?;
            check_readable(key)?;
            self.config
                .set("ssl.certificate.location", cert)
                .set("ssl.key.location", key);
        }
        Ok(self)
    }

    pub fn with_sasl(mut self, mechanism: SaslMechanism, username: &str, password: &str) -> Self {
        self.sasl = true;
        self.config
            .set("sasl.mechanisms", mechanism.as_str())
            .set("sasl.username", username)
            .set("sasl.password", password);
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_fetch_max_bytes(mut self, bytes: u32) -> Self {
        self.config.set("fetch.max.bytes", bytes.to_string());
        self
    }

    pub fn with_rebalance_strategy(mut self, strategy: RebalanceStrategy) -> Self {
        self.config
            .set("partition.assignment.strategy", strategy.assignment_strategy());
        self
    }

    pub fn build(mut self) -> ClientConfig {
        let protocol = match (self.tls, self.sasl) {
            (false, false) => None,
            (true, false) => Some("ssl"),
            (false, true) => Some("sasl_plaintext"),
            (true, true) => Some("sasl_ssl"),
        };
        if let Some(protocol) = protocol {
            self.config.set("security.protocol", protocol);
        }
        self.config
    }
}

fn check_readable(path: &str) -> Result<(), KafkaConfigError> {
    File::open(path)
        .map(|_| ())
        .map_err(|source| KafkaConfigError::TlsFile {
            path: path.to_owned(),
            source,
        })
}
