use anyhow::{Context, Result, anyhow};
use axum::http::HeaderName;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IDEMPOTENCY_HEADER: &str = "idempotency-key";

const DEFAULT_OPERATION_TTLS: &[(&str, i64)] = &[
    ("payment_intent", 86_400),
    ("payment_confirm", 86_400),
    ("pos_transaction", 86_400),
    ("refund", 259_200),
    ("payout", 259_200),
];

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub idempotency_header: HeaderName,
    pub ttl: TtlPolicy,
    pub wait_timeout: Duration,
    pub lock_lease: Duration,
    pub distributed_locks: bool,
    pub abandon_after_seconds: i64,
    pub sweep_interval: Duration,
    pub max_payload_bytes: usize,
    pub admin_token: Option<String>,
    pub stripe: StripeConfig,
    pub kafka: KafkaConfig,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub webhook_secret: String,
    pub timestamp_tolerance_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub tls: Option<KafkaTls>,
    pub topic_prefix: String,
    pub publish_max_retries: u32,
    pub publish_backoff_base_ms: u64,
    pub publish_backoff_max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct KafkaTls {
    pub cert: String,
    pub key: String,
    pub ca: String,
}

/// Record lifetime per operation type.
///
/// Lookup order: exact `operation_type`, then its family (the part before
/// `:`, so `webhook:stripe` resolves through `webhook`), then the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    default_seconds: i64,
    by_operation: BTreeMap<String, i64>,
}

impl TtlPolicy {
    pub fn new(default_seconds: i64) -> Self {
        Self {
            default_seconds,
            by_operation: BTreeMap::new(),
        }
    }

    pub fn with_operation(mut self, operation_type: &str, ttl_seconds: i64) -> Self {
        self.by_operation
            .insert(operation_type.to_string(), ttl_seconds);
        self
    }

    /// True when `operation_type` has its own entry rather than falling
    /// back to a family or the default.
    pub fn has_operation(&self, operation_type: &str) -> bool {
        self.by_operation.contains_key(operation_type)
    }

    pub fn ttl_for(&self, operation_type: &str) -> i64 {
        if let Some(ttl) = self.by_operation.get(operation_type) {
            return *ttl;
        }
        operation_type
            .split_once(':')
            .and_then(|(family, _)| self.by_operation.get(family))
            .copied()
            .unwrap_or(self.default_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.default_seconds <= 0 {
            return Err(anyhow!("GATE_DEFAULT_TTL_SECONDS must be a positive integer"));
        }
        if let Some((operation, _)) = self.by_operation.iter().find(|(_, ttl)| **ttl <= 0) {
            return Err(anyhow!("ttl for operation {operation} must be positive"));
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(lookup);

        let header = vars
            .get("GATE_IDEMPOTENCY_HEADER")
            .unwrap_or_else(|| DEFAULT_IDEMPOTENCY_HEADER.to_string());
        let idempotency_header = HeaderName::try_from(header.trim())
            .with_context(|| format!("invalid GATE_IDEMPOTENCY_HEADER: {header}"))?;

        let webhook_ttl_seconds = vars.i64("GATE_WEBHOOK_TTL_SECONDS", 172_800)?;
        let mut ttl = TtlPolicy::new(vars.i64("GATE_DEFAULT_TTL_SECONDS", 86_400)?)
            .with_operation("webhook", webhook_ttl_seconds);
        for (operation, seconds) in DEFAULT_OPERATION_TTLS {
            ttl = ttl.with_operation(operation, *seconds);
        }
        if let Some(raw) = vars.get("GATE_OPERATION_TTLS") {
            for (operation, seconds) in parse_operation_ttls(&raw)? {
                ttl = ttl.with_operation(&operation, seconds);
            }
        }

        let tls = match (
            vars.get("KAFKA_TLS_CERT"),
            vars.get("KAFKA_TLS_KEY"),
            vars.get("KAFKA_TLS_CA"),
        ) {
            (Some(cert), Some(key), Some(ca)) => Some(KafkaTls { cert, key, ca }),
            (None, None, None) => None,
            _ => {
                return Err(anyhow!(
                    "KAFKA_TLS_CERT, KAFKA_TLS_KEY and KAFKA_TLS_CA must be set together"
                ));
            }
        };

        let config = Self {
            bind_addr: vars
                .get("GATE_BIND")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            db_path: PathBuf::from(
                vars.get("GATE_DB_PATH")
                    .unwrap_or_else(|| "./var/idempotency.redb".to_string()),
            ),
            idempotency_header,
            ttl,
            wait_timeout: Duration::from_millis(vars.u64("GATE_WAIT_TIMEOUT_MS", 10_000)?),
            lock_lease: Duration::from_millis(vars.u64("GATE_LOCK_LEASE_MS", 30_000)?),
            distributed_locks: vars.bool("GATE_DISTRIBUTED_LOCKS", false),
            abandon_after_seconds: vars.i64("GATE_ABANDON_AFTER_SECONDS", 900)?,
            sweep_interval: Duration::from_secs(vars.u64("GATE_SWEEP_INTERVAL_SECONDS", 60)?),
            max_payload_bytes: vars.usize("GATE_MAX_PAYLOAD_BYTES", 1_048_576)?,
            admin_token: vars.get("GATE_ADMIN_TOKEN"),
            stripe: StripeConfig {
                webhook_secret: vars.required("STRIPE_WEBHOOK_SECRET")?,
                timestamp_tolerance_seconds: vars
                    .i64("STRIPE_TIMESTAMP_TOLERANCE_SECONDS", 300)?,
            },
            kafka: KafkaConfig {
                brokers: vars.required("KAFKA_BROKERS")?,
                tls,
                topic_prefix: vars
                    .get("KAFKA_TOPIC_PREFIX")
                    .unwrap_or_else(|| "webhooks".to_string()),
                publish_max_retries: vars.u32("GATE_PUBLISH_MAX_RETRIES", 5)?,
                publish_backoff_base_ms: vars.u64("GATE_PUBLISH_BACKOFF_BASE_MS", 200)?,
                publish_backoff_max_ms: vars.u64("GATE_PUBLISH_BACKOFF_MAX_MS", 5_000)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.ttl.validate()?;

        if self.abandon_after_seconds <= 0 {
            return Err(anyhow!("GATE_ABANDON_AFTER_SECONDS must be a positive integer"));
        }

        let abandon_after = Duration::from_secs(self.abandon_after_seconds.unsigned_abs());
        if self.wait_timeout >= abandon_after {
            return Err(anyhow!(
                "GATE_WAIT_TIMEOUT_MS must be shorter than GATE_ABANDON_AFTER_SECONDS"
            ));
        }

        if self.lock_lease < Duration::from_secs(1) {
            return Err(anyhow!("GATE_LOCK_LEASE_MS must be at least 1000"));
        }

        if self.sweep_interval.is_zero() {
            return Err(anyhow!("GATE_SWEEP_INTERVAL_SECONDS must be a positive integer"));
        }

        if self.stripe.timestamp_tolerance_seconds <= 0 {
            return Err(anyhow!(
                "STRIPE_TIMESTAMP_TOLERANCE_SECONDS must be a positive integer"
            ));
        }

        if self.kafka.publish_max_retries == 0 {
            return Err(anyhow!("GATE_PUBLISH_MAX_RETRIES must be at least 1"));
        }

        Ok(())
    }
}

/// Parses `op=seconds,op=seconds`.
pub fn parse_operation_ttls(raw: &str) -> Result<Vec<(String, i64)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (operation, seconds) = entry
                .split_once('=')
                .with_context(|| format!("GATE_OPERATION_TTLS entry {entry} is not op=seconds"))?;
            let operation = operation.trim();
            if operation.is_empty() {
                return Err(anyhow!("GATE_OPERATION_TTLS entry {entry} has no operation"));
            }
            let seconds = seconds
                .trim()
                .parse::<i64>()
                .with_context(|| format!("invalid ttl seconds for {operation}"))?;
            Ok((operation.to_string(), seconds))
        })
        .collect()
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        let value = (self.0)(name).with_context(|| format!("missing required env var: {name}"))?;
        if value.trim().is_empty() {
            return Err(anyhow!("required env var {name} cannot be empty"));
        }
        Ok(value)
    }

    fn u32(&self, name: &str, default: u32) -> Result<u32> {
        self.parsed(name, default)
    }

    fn u64(&self, name: &str, default: u64) -> Result<u64> {
        self.parsed(name, default)
    }

    fn i64(&self, name: &str, default: i64) -> Result<i64> {
        self.parsed(name, default)
    }

    fn usize(&self, name: &str, default: usize) -> Result<usize> {
        self.parsed(name, default)
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.get(name)
            .map(|value| {
                value
                    .trim()
                    .parse::<T>()
                    .with_context(|| format!("invalid {} for {name}", std::any::type_name::<T>()))
            })
            .transpose()
            .map(|value| value.unwrap_or(default))
    }

    fn bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(value) => matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            None => default,
        }
    }
}
