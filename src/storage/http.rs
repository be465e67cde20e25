use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::indexer::sources::{Cursor, Page, PageSource, next_range};
use crate::indexer::sources::rpc::{range_progress, range_window};
use crate::models::errors::{PublishError, SourceError};
use crate::storage::{ImportBatch, ImportSink};
use crate::utils::strip_html;

const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackfillRequest {
    chain_id: u64,
    from_block: u64,
    to_block: u64,
}

#[derive(Debug, Default, Deserialize)]
struct BackfillResponse {
    #[serde(default, alias = "eventsFound", alias = "events_found", alias = "count")]
    events: u64,
}

/// Client for the remote store's admin API.
pub struct HttpImportClient {
    client: reqwest::Client,
    base_url: Url,
    secret_header: String,
    secret: String,
}

impl HttpImportClient {
    pub fn new(
        api_url: &str,
        secret_header: &str,
        secret: &str,
        timeout: Duration,
    ) -> Result<Self, PublishError> {
        let base_url = Url::parse(api_url)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            secret_header: secret_header.to_string(),
            secret: secret.to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, PublishError> {
        let url = self.base_url.join(path)?;
        let response = self
            .client
            .post(url)
            .header(self.secret_header.as_str(), self.secret.as_str())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut body = strip_html(&body);
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    pub async fn import(&self, batch: &ImportBatch<'_>) -> Result<(), PublishError> {
        self.post("api/admin/import", batch).await?;
        Ok(())
    }

    /// Asks the remote side to ingest `[from_block, to_block]` itself. Returns events found.
    pub async fn trigger_backfill(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<u64, PublishError> {
        let request = BackfillRequest {
            chain_id,
            from_block,
            to_block,
        };
        let response = self.post("api/admin/backfill", &request).await?;
        let text = response.text().await?;
        // Some deployments answer with an empty body
        let parsed = if text.trim().is_empty() {
            BackfillResponse::default()
        } else {
            serde_json::from_str::<BackfillResponse>(&text)?
        };
        debug!(
            "Backfill of blocks {} to {} found {} events",
            from_block, to_block, parsed.events
        );
        Ok(parsed.events)
    }
}

impl ImportSink for HttpImportClient {
    async fn import(&self, batch: &ImportBatch<'_>) -> Result<(), PublishError> {
        HttpImportClient::import(self, batch).await
    }
}

/// Walks `[start_block, head]` in windows, triggering a remote backfill per window.
/// Each page yields the number of events the remote side found.
pub struct BackfillSource<'a> {
    client: &'a HttpImportClient,
    chain_id: u64,
    start_block: u64,
    head: u64,
    range_size: u64,
}

impl<'a> BackfillSource<'a> {
    pub fn new(
        client: &'a HttpImportClient,
        chain_id: u64,
        start_block: u64,
        head: u64,
        range_size: u64,
    ) -> Self {
        info!(
            "Backfilling chain {} from block {} to {} in windows of {}",
            chain_id, start_block, head, range_size
        );
        Self {
            client,
            chain_id,
            start_block,
            head,
            range_size,
        }
    }
}

impl PageSource for BackfillSource<'_> {
    type Item = u64;

    fn name(&self) -> &str {
        "backfill"
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<u64>, SourceError> {
        let (from, to) = match cursor {
            Cursor::Range { from, to } => (*from, *to),
            _ => match range_window(self.start_block, self.range_size, self.head) {
                Some(range) => range,
                None => return Ok(Page::last(Vec::new())),
            },
        };

        let found = self
            .client
            .trigger_backfill(self.chain_id, from, to)
            .await
            .map_err(|e| SourceError::Remote(e.to_string()))?;

        Ok(Page {
            items: vec![found],
            next: next_range(to, self.range_size, self.head),
        })
    }

    fn skip(&self, cursor: &Cursor) -> Option<Cursor> {
        let to = match cursor {
            Cursor::Range { to, .. } => *to,
            _ => range_window(self.start_block, self.range_size, self.head)?.1,
        };
        next_range(to, self.range_size, self.head)
    }

    fn block_window(&self, cursor: &Cursor) -> Option<(u64, u64)> {
        match cursor {
            Cursor::Range { from, to } => Some((*from, *to)),
            _ => range_window(self.start_block, self.range_size, self.head),
        }
    }

    fn progress(&self, cursor: &Cursor) -> Option<f64> {
        let (_, to) = self.block_window(cursor)?;
        Some(range_progress(self.start_block, to, self.head))
    }
}
