pub mod http;
pub mod local;

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, error, info};

use crate::metrics::Metrics;
use crate::models::datasets::NaturalKey;
use crate::models::datasets::aggregates::{DailyStat, SolverAggregate};
use crate::models::datasets::payloads::PayloadRecord;
use crate::models::datasets::privacy::PrivacyPoolSnapshot;
use crate::models::datasets::transactions::TransactionRecord;
use crate::models::errors::PublishError;
use crate::storage::http::HttpImportClient;
use crate::storage::local::LocalArtifacts;

pub use crate::storage::local::PageLabel;

/// One import request. Empty sections are left out of the body.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ImportBatch<'a> {
    #[serde(skip_serializing_if = "<[_]>::is_empty", serialize_with = "keyed")]
    pub events: &'a [TransactionRecord],
    #[serde(skip_serializing_if = "<[_]>::is_empty", serialize_with = "keyed")]
    pub payloads: &'a [PayloadRecord],
    #[serde(skip_serializing_if = "<[_]>::is_empty", serialize_with = "keyed")]
    pub privacy_stats: &'a [PrivacyPoolSnapshot],
    #[serde(skip_serializing_if = "<[_]>::is_empty", serialize_with = "keyed")]
    pub solvers: &'a [SolverAggregate],
    #[serde(skip_serializing_if = "<[_]>::is_empty", serialize_with = "keyed")]
    pub daily_stats: &'a [DailyStat],
}

impl ImportBatch<'_> {
    pub fn len(&self) -> usize {
        self.events.len()
            + self.payloads.len()
            + self.privacy_stats.len()
            + self.solvers.len()
            + self.daily_stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize)]
struct KeyedRow<'a, T> {
    id: String,
    #[serde(flatten)]
    row: &'a T,
}

// Every row carries its natural key so the destination can upsert
fn keyed<S, T>(rows: &&[T], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + NaturalKey,
{
    serializer.collect_seq(rows.iter().map(|row| KeyedRow {
        id: row.natural_key(),
        row,
    }))
}

/// A destination that accepts import batches.
pub trait ImportSink {
    fn import(&self, batch: &ImportBatch<'_>) -> impl Future<Output = Result<(), PublishError>>;
}

/// Where reconstructed records go.
pub enum Destination {
    Http(HttpImportClient),
    /// Nothing leaves the process; local artifacts are the only output.
    LocalOnly,
}

impl ImportSink for Destination {
    async fn import(&self, batch: &ImportBatch<'_>) -> Result<(), PublishError> {
        match self {
            Destination::Http(client) => client.import(batch).await,
            Destination::LocalOnly => {
                debug!("Local-only mode, keeping {} records on disk", batch.len());
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PublishReport {
    pub batches_published: usize,
    pub batches_failed: usize,
    pub records_published: BTreeMap<&'static str, usize>,
}

/// Chunks records into fixed-size batches per dataset and pushes them to an [`ImportSink`].
/// A failed batch is logged and counted; the remaining batches are still sent.
pub struct BatchPublisher<S: ImportSink> {
    sink: S,
    batch_size: usize,
    artifacts: Option<LocalArtifacts>,
    metrics: Option<Metrics>,
    report: PublishReport,
}

impl<S: ImportSink> BatchPublisher<S> {
    pub fn new(
        sink: S,
        batch_size: usize,
        artifacts: Option<LocalArtifacts>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            artifacts,
            metrics,
            report: PublishReport::default(),
        }
    }

    pub fn report(&self) -> &PublishReport {
        &self.report
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Publishes the events and payloads produced by one page, and writes them as a local
    /// artifact named by the page's phase and block range.
    pub async fn publish_page(
        &mut self,
        label: PageLabel,
        events: &[TransactionRecord],
        payloads: &[PayloadRecord],
        block_range: Option<(u64, u64)>,
    ) {
        if let (Some(artifacts), Some(range)) = (&self.artifacts, block_range) {
            if let Err(e) = artifacts.write_range(label, range, events, payloads).await {
                error!("Failed to write artifact for blocks {} to {}: {}", range.0, range.1, e);
            }
        }

        for chunk in events.chunks(self.batch_size) {
            let batch = ImportBatch {
                events: chunk,
                ..Default::default()
            };
            self.send("events", &batch).await;
        }
        for chunk in payloads.chunks(self.batch_size) {
            let batch = ImportBatch {
                payloads: chunk,
                ..Default::default()
            };
            self.send("payloads", &batch).await;
        }
    }

    pub async fn publish_snapshots(&mut self, snapshots: &[PrivacyPoolSnapshot]) {
        for chunk in snapshots.chunks(self.batch_size) {
            let batch = ImportBatch {
                privacy_stats: chunk,
                ..Default::default()
            };
            self.send("privacy_stats", &batch).await;
        }
    }

    /// Aggregates are recomputed in full and sent as one batch.
    pub async fn publish_aggregates(&mut self, solvers: &[SolverAggregate], daily_stats: &[DailyStat]) {
        let batch = ImportBatch {
            solvers,
            daily_stats,
            ..Default::default()
        };
        if batch.is_empty() {
            return;
        }
        self.send("aggregates", &batch).await;
    }

    async fn send(&mut self, dataset: &'static str, batch: &ImportBatch<'_>) {
        let rows = batch.len();
        match self.sink.import(batch).await {
            Ok(()) => {
                debug!("Published {} {} rows", rows, dataset);
                self.report.batches_published += 1;
                *self.report.records_published.entry(dataset).or_default() += rows;
                if let Some(metrics) = &self.metrics {
                    metrics.record_published(dataset, rows as u64);
                }
            }
            Err(e) => {
                error!("Failed to publish batch of {} {} rows: {}", rows, dataset, e);
                self.report.batches_failed += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_publish_failure();
                }
            }
        }
    }

    pub fn log_report(&self) {
        info!(
            "Published {} batches ({} failed): {:?}",
            self.report.batches_published, self.report.batches_failed, self.report.records_published
        );
    }
}
