use crate::store::{StoreStats, SweepReport};
use anyhow::{Context, Result};
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    executions_total: IntCounterVec,
    records: IntGaugeVec,
    expired_records: IntGauge,
    sweeps_total: IntCounterVec,
    swept_records_total: IntCounterVec,
    sweeper_consecutive_failures: IntGauge,
    webhooks_received_total: IntCounterVec,
    webhooks_rejected_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "idempotency_requests_total",
                "Idempotent requests by operation type and how they were resolved.",
            ),
            &["operation_type", "outcome"],
        )
        .context("create requests_total metric")?;

        let executions_total = IntCounterVec::new(
            Opts::new(
                "idempotency_executions_total",
                "Business operations executed under a claimed key.",
            ),
            &["operation_type", "result"],
        )
        .context("create executions_total metric")?;

        let records = IntGaugeVec::new(
            Opts::new(
                "idempotency_records",
                "Stored idempotency records at the last sweep.",
            ),
            &["operation_type", "status"],
        )
        .context("create records metric")?;

        let expired_records = IntGauge::new(
            "idempotency_expired_records",
            "Records past their expiry and not yet removed, as of the last sweep.",
        )
        .context("create expired_records metric")?;

        let sweeps_total = IntCounterVec::new(
            Opts::new("idempotency_sweeps_total", "Cleanup sweep passes."),
            &["result"],
        )
        .context("create sweeps_total metric")?;

        let swept_records_total = IntCounterVec::new(
            Opts::new(
                "idempotency_swept_records_total",
                "Records removed or reclaimed by the cleanup sweeper.",
            ),
            &["action"],
        )
        .context("create swept_records_total metric")?;

        let sweeper_consecutive_failures = IntGauge::new(
            "idempotency_sweeper_consecutive_failures",
            "Sweep passes that failed in a row.",
        )
        .context("create sweeper_consecutive_failures metric")?;

        let webhooks_received_total = IntCounterVec::new(
            Opts::new(
                "idempotency_webhooks_received_total",
                "Webhook deliveries received.",
            ),
            &["source"],
        )
        .context("create webhooks_received_total metric")?;

        let webhooks_rejected_total = IntCounterVec::new(
            Opts::new(
                "idempotency_webhooks_rejected_total",
                "Webhook deliveries rejected before reaching the idempotency layer.",
            ),
            &["source", "reason"],
        )
        .context("create webhooks_rejected_total metric")?;

        register(&registry, &requests_total, "requests_total")?;
        register(&registry, &executions_total, "executions_total")?;
        register(&registry, &records, "records")?;
        register(&registry, &expired_records, "expired_records")?;
        register(&registry, &sweeps_total, "sweeps_total")?;
        register(&registry, &swept_records_total, "swept_records_total")?;
        register(
            &registry,
            &sweeper_consecutive_failures,
            "sweeper_consecutive_failures",
        )?;
        register(&registry, &webhooks_received_total, "webhooks_received_total")?;
        register(&registry, &webhooks_rejected_total, "webhooks_rejected_total")?;

        Ok(Self {
            registry,
            requests_total,
            executions_total,
            records,
            expired_records,
            sweeps_total,
            swept_records_total,
            sweeper_consecutive_failures,
            webhooks_received_total,
            webhooks_rejected_total,
        })
    }

    pub fn inc_request(&self, operation_type: &str, outcome: &str) {
        self.requests_total
            .with_label_values(&[operation_type, outcome])
            .inc();
    }

    pub fn inc_execution(&self, operation_type: &str, result: &str) {
        self.executions_total
            .with_label_values(&[operation_type, result])
            .inc();
    }

    pub fn observe_sweep(&self, report: &SweepReport, stats: &StoreStats) {
        self.sweeps_total.with_label_values(&["ok"]).inc();
        self.swept_records_total
            .with_label_values(&["deleted"])
            .inc_by(report.deleted as u64);
        self.swept_records_total
            .with_label_values(&["abandoned"])
            .inc_by(report.abandoned as u64);
        self.swept_records_total
            .with_label_values(&["expired_lease"])
            .inc_by(report.expired_leases as u64);

        self.records.reset();
        for (operation_type, counts) in &stats.by_operation {
            for (status, count) in [
                ("pending", counts.pending),
                ("completed", counts.completed),
                ("failed", counts.failed),
            ] {
                self.records
                    .with_label_values(&[operation_type.as_str(), status])
                    .set(count as i64);
            }
        }
        self.expired_records.set(stats.expired as i64);
    }

    pub fn inc_sweep_failure(&self) {
        self.sweeps_total.with_label_values(&["error"]).inc();
    }

    pub fn set_sweeper_consecutive_failures(&self, count: u64) {
        self.sweeper_consecutive_failures
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn inc_webhook_received(&self, source: &str) {
        self.webhooks_received_total
            .with_label_values(&[source])
            .inc();
    }

    pub fn inc_webhook_rejected(&self, source: &str, reason: &str) {
        self.webhooks_rejected_total
            .with_label_values(&[source, reason])
            .inc();
    }

    pub fn render(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encode metrics")?;
        String::from_utf8(buffer).context("metrics text is valid utf-8")
    }
}

fn register<C>(registry: &Registry, collector: &C, name: &str) -> Result<()>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .with_context(|| format!("register {name}"))
}
