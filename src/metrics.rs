use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, routing::get};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, MeterProvider};
use opentelemetry_sdk::metrics::{MetricError, SdkMeterProvider};
use prometheus::{Encoder, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<prometheus::Registry>,
    _provider: SdkMeterProvider,
    pub chain_name: String,

    // Pagination metrics
    pub pages_fetched: Counter<u64>,
    pub page_failures: Counter<u64>,
    pub retries: Counter<u64>,
    pub pages_skipped: Counter<u64>,
    pub latest_processed_block: Gauge<u64>,
    pub progress_percent: Gauge<f64>,

    // Decoding metrics
    pub events_classified: Counter<u64>,
    pub unknown_events: Counter<u64>,
    pub decode_failures: Counter<u64>,

    // Publishing metrics
    pub records_published: Counter<u64>,
    pub publish_failures: Counter<u64>,

    // Request metrics
    pub requests: Counter<u64>,
    pub request_errors: Counter<u64>,
    pub request_latency: Histogram<f64>,
}

impl Metrics {
    pub fn new(chain_name: String) -> Result<Self, MetricError> {
        let registry = prometheus::Registry::new();

        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("contract_indexer_metrics");

        let pages_fetched = meter
            .u64_counter("indexer_pages_fetched")
            .with_description("Pages successfully fetched from a source")
            .build();

        let page_failures = meter
            .u64_counter("indexer_page_failures")
            .with_description("Failed page fetch attempts")
            .build();

        let retries = meter
            .u64_counter("indexer_page_retries")
            .with_description("Page fetches retried after a failure")
            .build();

        let pages_skipped = meter
            .u64_counter("indexer_pages_skipped")
            .with_description("Pages abandoned after exhausting retries")
            .build();

        let latest_processed_block = meter
            .u64_gauge("indexer_latest_processed_block_number")
            .with_description("Highest block number seen in processed pages")
            .build();

        let progress_percent = meter
            .f64_gauge("indexer_progress_percent")
            .with_description("Completion of the current block-range scan")
            .build();

        let events_classified = meter
            .u64_counter("indexer_events_classified")
            .with_description("Logs classified as a known event kind")
            .build();

        let unknown_events = meter
            .u64_counter("indexer_unknown_events")
            .with_description("Logs with an unrecognized topic signature")
            .build();

        let decode_failures = meter
            .u64_counter("indexer_decode_failures")
            .with_description("Logs or call inputs that failed to decode")
            .build();

        let records_published = meter
            .u64_counter("indexer_records_published")
            .with_description("Records accepted by the destination")
            .build();

        let publish_failures = meter
            .u64_counter("indexer_publish_failures")
            .with_description("Batches rejected by or undeliverable to the destination")
            .build();

        let requests = meter
            .u64_counter("indexer_requests")
            .with_description("Number of requests made to external sources")
            .build();

        let request_errors = meter
            .u64_counter("indexer_request_errors")
            .with_description("Number of failed requests to external sources")
            .build();

        let request_latency = meter
            .f64_histogram("indexer_request_latency")
            .with_description("External request latency")
            .with_boundaries(vec![
                0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0, 5.0, 10.0, 30.0,
            ])
            .with_unit("s")
            .build();

        Ok(Self {
            registry: Arc::new(registry),
            _provider: provider,
            chain_name,
            pages_fetched,
            page_failures,
            retries,
            pages_skipped,
            latest_processed_block,
            progress_percent,
            events_classified,
            unknown_events,
            decode_failures,
            records_published,
            publish_failures,
            requests,
            request_errors,
            request_latency,
        })
    }

    /// Same instruments and registry, labelled for another chain.
    pub fn for_chain(&self, chain_name: &str) -> Self {
        let mut metrics = self.clone();
        metrics.chain_name = chain_name.to_string();
        metrics
    }

    fn chain_attr(&self) -> KeyValue {
        KeyValue::new("chain", self.chain_name.clone())
    }

    pub fn record_request(&self, endpoint: &str) {
        self.requests.add(
            1,
            &[self.chain_attr(), KeyValue::new("endpoint", endpoint.to_string())],
        );
    }

    pub fn record_latency(&self, endpoint: &str, secs: f64, is_err: bool) {
        let attrs = [self.chain_attr(), KeyValue::new("endpoint", endpoint.to_string())];
        self.request_latency.record(secs, &attrs);
        if is_err {
            self.request_errors.add(1, &attrs);
        }
    }

    pub fn record_page(&self, source: &str, progress: Option<f64>) {
        let attrs = [self.chain_attr(), KeyValue::new("source", source.to_string())];
        self.pages_fetched.add(1, &attrs);
        if let Some(percent) = progress {
            self.progress_percent.record(percent, &attrs);
        }
    }

    pub fn record_block(&self, block_number: u64) {
        self.latest_processed_block
            .record(block_number, &[self.chain_attr()]);
    }

    pub fn record_page_failure(&self, source: &str, retried: bool) {
        let attrs = [self.chain_attr(), KeyValue::new("source", source.to_string())];
        self.page_failures.add(1, &attrs);
        if retried {
            self.retries.add(1, &attrs);
        }
    }

    pub fn record_skip(&self, source: &str) {
        self.pages_skipped.add(
            1,
            &[self.chain_attr(), KeyValue::new("source", source.to_string())],
        );
    }

    pub fn record_event(&self, kind: &str) {
        self.events_classified
            .add(1, &[self.chain_attr(), KeyValue::new("kind", kind.to_string())]);
    }

    pub fn record_unknown_event(&self) {
        self.unknown_events.add(1, &[self.chain_attr()]);
    }

    pub fn record_decode_failure(&self, what: &str) {
        self.decode_failures
            .add(1, &[self.chain_attr(), KeyValue::new("what", what.to_string())]);
    }

    pub fn record_published(&self, dataset: &str, count: u64) {
        self.records_published.add(
            count,
            &[self.chain_attr(), KeyValue::new("dataset", dataset.to_string())],
        );
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.add(1, &[self.chain_attr()]);
    }

    pub async fn start_metrics_server(&self, addr: &str, port: u16) -> Result<()> {
        let addr = format!("{addr}:{port}")
            .parse::<SocketAddr>()
            .context("Invalid metrics address")?;
        let registry = self.registry.clone();

        let app = Router::new().route("/metrics", get(move || metrics_handler(registry.clone())));

        // Only used for logging
        let access_url = if addr.ip().is_unspecified() {
            format!("http://localhost:{port}/metrics")
        } else {
            format!("http://{}:{port}/metrics", addr.ip())
        };

        info!(
            "Starting metrics server - binding to {} (accessible at {})",
            addr, access_url
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", addr))?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server stopped: {}", e);
            }
        });

        Ok(())
    }
}

async fn metrics_handler(registry: Arc<prometheus::Registry>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_render_after_recording() {
        let metrics = Metrics::new("testnet".to_string()).unwrap();
        metrics.record_request("eth_getLogs");
        metrics.record_latency("eth_getLogs", 0.12, false);
        metrics.record_page("rpc logs", Some(50.0));
        metrics.record_block(120);
        metrics.record_event("TransactionExecuted");
        metrics.record_published("events", 3);

        let body = metrics_handler(metrics.registry.clone()).await.unwrap();
        assert!(body.contains("indexer_pages_fetched"));
        assert!(body.contains("indexer_records_published"));
        assert!(body.contains("chain=\"testnet\""));

        metrics.for_chain("mainnet").record_block(7);
        let body = metrics_handler(metrics.registry.clone()).await.unwrap();
        assert!(body.contains("chain=\"mainnet\""));
    }
}
