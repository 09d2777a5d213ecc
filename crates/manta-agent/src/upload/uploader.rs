use manta_common::time::format_duration;
use reqwest::header::CONTENT_TYPE;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bundle::{make_chunks, split_records, Chunk, WorkBundle};
use super::{Result, UploadError, UploadReport, UploadSettings, AUTH_TOKEN_HEADER};

/// Posts CSV files to the ingestion endpoint with a bounded worker pool
#[derive(Debug, Clone)]
pub struct Uploader {
    client: reqwest::Client,
    settings: Arc<UploadSettings>,
}

impl Uploader {
    pub fn new(settings: UploadSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            client,
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Upload `path` to `url`; `report.success` tells whether every chunk landed
    pub async fn upload_file(&self, url: &str, path: &Path) -> Result<UploadReport> {
        self.upload_file_with_cancel(url, path, CancellationToken::new())
            .await
    }

    /// Like [`Uploader::upload_file`]. Cancelling `cancel` stops workers from
    /// taking new chunks; requests already in flight run to completion and
    /// the call returns [`UploadError::Cancelled`] once every task is joined.
    pub async fn upload_file_with_cancel(
        &self,
        url: &str,
        path: &Path,
        cancel: CancellationToken,
    ) -> Result<UploadReport> {
        // Dumps go out byte for byte; the client's encoding is not ours to judge
        let data = tokio::fs::read(path).await?;
        let mut records = split_records(&data)?.into_iter();
        let header = records.next().unwrap_or_default();
        let records: Vec<Vec<u8>> = records.collect();

        if records.is_empty() {
            warn!(file = %path.display(), "Nothing to upload, file has no data lines");
            return Ok(WorkBundle::new(header, Vec::new()).report());
        }

        let chunks = make_chunks(&records, self.settings.chunk_size);
        let worker_count = self.settings.num_workers.min(chunks.len());
        info!(
            file = %path.display(),
            url,
            lines = records.len(),
            chunks = chunks.len(),
            workers = worker_count,
            "Uploading file"
        );

        let bundle = Arc::new(WorkBundle::new(header, chunks));
        let url: Arc<str> = Arc::from(url);

        let finished = CancellationToken::new();
        let stalled = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            bundle.clone(),
            self.settings.clone(),
            finished.clone(),
            stalled.clone(),
        ));

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(run_worker(
                worker_id,
                self.client.clone(),
                url.clone(),
                self.settings.clone(),
                bundle.clone(),
                stalled.clone(),
            ));
        }

        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    warn!(file = %path.display(), "Upload cancelled, waiting for in-flight requests");
                    bundle.report_error("cancelled".to_string());
                },
                joined = workers.join_next() => match joined {
                    Some(Ok(())) => {},
                    Some(Err(e)) => {
                        error!(error = %e, "Upload worker failed");
                        bundle.report_error(format!("worker failed: {}", e));
                    },
                    None => break,
                },
            }
        }

        finished.cancel();
        monitor.await?;

        if cancelled {
            return Err(UploadError::Cancelled);
        }

        let report = bundle.report();
        if report.success {
            info!(
                file = %path.display(),
                lines = report.uploaded_lines,
                chunks = report.chunks,
                "Upload complete"
            );
        } else {
            error!(
                file = %path.display(),
                uploaded = report.uploaded_lines,
                total = report.total_lines,
                last_status = %report.last_status,
                "Upload failed"
            );
        }
        Ok(report)
    }
}

async fn run_worker(
    worker_id: usize,
    client: reqwest::Client,
    url: Arc<str>,
    settings: Arc<UploadSettings>,
    bundle: Arc<WorkBundle>,
    stalled: CancellationToken,
) {
    while let Some(chunk) = bundle.take_work() {
        let delivered = tokio::select! {
            delivered = send_with_retries(worker_id, &client, &url, &settings, &bundle, &chunk) => {
                delivered
            },
            _ = stalled.cancelled() => false,
        };
        if !delivered {
            break;
        }
    }
    debug!(
        worker_id,
        done = bundle.is_done(),
        errored = bundle.is_error(),
        "Upload worker finished"
    );
}

/// Returns false when the chunk was not delivered and the worker should stop
async fn send_with_retries(
    worker_id: usize,
    client: &reqwest::Client,
    url: &str,
    settings: &UploadSettings,
    bundle: &WorkBundle,
    chunk: &Chunk,
) -> bool {
    for attempt in 1..=settings.max_retries {
        if bundle.should_stop() {
            return false;
        }

        match post_chunk(client, url, settings, bundle.body(chunk)).await {
            Ok(status) => {
                debug!(worker_id, chunk = chunk.index, status = %status, "Chunk accepted");
                bundle.record_success(chunk, status);
                return true;
            },
            Err(reason) => {
                warn!(
                    worker_id,
                    chunk = chunk.index,
                    attempt,
                    max_retries = settings.max_retries,
                    error = %reason,
                    "Chunk upload failed"
                );
                bundle.record_status(reason);
                if attempt < settings.max_retries {
                    sleep(settings.retry_delay).await;
                }
            },
        }
    }

    bundle.report_error(format!(
        "chunk {} failed after {} attempts",
        chunk.index, settings.max_retries
    ));
    false
}

/// One POST; any transport error or non-success status is a failure
async fn post_chunk(
    client: &reqwest::Client,
    url: &str,
    settings: &UploadSettings,
    body: Vec<u8>,
) -> std::result::Result<String, String> {
    let mut request = client.post(url).header(CONTENT_TYPE, "text/csv").body(body);
    if let Some(token) = &settings.auth_token {
        request = request.header(AUTH_TOKEN_HEADER, token);
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    let text = response.text().await.map_err(|e| e.to_string())?;
    let text = text.trim().to_string();

    if status.is_success() {
        Ok(text)
    } else {
        Err(format!("HTTP {}: {}", status, text))
    }
}

/// Logs progress every `progress_interval`. On stall the bundle is failed
/// and `stalled` drops the requests still in flight.
async fn monitor(
    bundle: Arc<WorkBundle>,
    settings: Arc<UploadSettings>,
    finished: CancellationToken,
    stalled: CancellationToken,
) {
    let period = settings.progress_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = finished.cancelled() => break,
            _ = ticker.tick() => {
                let progress = bundle.progress_tick(settings.max_idle);
                info!(
                    uploaded = progress.uploaded,
                    total = progress.total,
                    remaining = %progress.remaining.map(format_duration).unwrap_or_else(|| "unknown".to_string()),
                    elapsed = %format_duration(progress.elapsed),
                    rate = %format!("{:.1}/s", progress.rate),
                    last_status = %progress.last_status,
                    "Upload progress"
                );
                if progress.stalled {
                    error!(
                        idle = %format_duration(progress.idle),
                        max_idle = %format_duration(settings.max_idle),
                        "Upload stalled, abandoning file"
                    );
                    stalled.cancel();
                    break;
                }
            },
        }
    }
}
