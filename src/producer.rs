use crate::config::Config;
use crate::envelope::EventEnvelope;
use anyhow::{Context, Result, anyhow};
use futures_util::future::BoxFuture;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio::time::{Duration, sleep};
use tracing::warn;

/// Downstream hand-off for verified webhook events.
pub trait EventSink: Send + Sync {
    fn publish<'a>(&'a self, topic: &'a str, envelope: &'a EventEnvelope) -> BoxFuture<'a, Result<()>>;
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    max_retries: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl KafkaPublisher {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &config.kafka.brokers)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.ms", "5")
            .set("enable.idempotence", "true");

        if let Some(tls) = &config.kafka.tls {
            client
                .set("security.protocol", "ssl")
                .set("ssl.certificate.location", &tls.cert)
                .set("ssl.key.location", &tls.key)
                .set("ssl.ca.location", &tls.ca);
        }

        let producer = client
            .create::<FutureProducer>()
            .context("create kafka future producer")?;

        Ok(Self {
            producer,
            max_retries: config.kafka.publish_max_retries,
            backoff_base_ms: config.kafka.publish_backoff_base_ms,
            backoff_max_ms: config.kafka.publish_backoff_max_ms,
        })
    }

    async fn publish_with_retry(&self, topic: &str, envelope: &EventEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope).context("serialize webhook envelope")?;
        let key = envelope.event_id.as_str();

        let mut attempt = 0u32;
        loop {
            let record = FutureRecord::to(topic).key(key).payload(&payload);
            match self
                .producer
                .send(record, Timeout::After(Duration::from_secs(5)))
                .await
            {
                Ok(_) => return Ok(()),
                Err((error, _message)) => {
                    attempt = attempt.saturating_add(1);
                    if attempt >= self.max_retries {
                        return Err(anyhow!(
                            "kafka publish failed after {attempt} attempts: {error}"
                        ));
                    }

                    let backoff = retry_backoff_ms(
                        self.backoff_base_ms,
                        self.backoff_max_ms,
                        attempt.saturating_sub(1),
                    );
                    warn!(
                        topic = %topic,
                        event_id = %envelope.event_id,
                        attempt,
                        backoff_ms = backoff,
                        error = %error,
                        "kafka publish failed; retrying"
                    );
                    sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }
}

impl EventSink for KafkaPublisher {
    fn publish<'a>(&'a self, topic: &'a str, envelope: &'a EventEnvelope) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.publish_with_retry(topic, envelope))
    }
}

pub fn retry_backoff_ms(base_ms: u64, max_ms: u64, attempt_index: u32) -> u64 {
    let exponent = attempt_index.min(31);
    let scaled = base_ms.saturating_mul(1u64 << exponent);
    scaled.min(max_ms)
}
