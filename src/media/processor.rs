/// Media queue worker
///
/// One job at a time: transcode, publish the variant files, then record the
/// outcome in a fresh write transaction. No write transaction is held while
/// decoding or touching the filesystem.
use super::files::write_atomic;
use super::transcoder::{self, Transcoded, VariantFormat, VariantSize};
use super::{finish, MediaJob, MediaRecord, MediaStatus};
use crate::jobs::queue::JobQueue;
use crate::metrics;
use crate::store::Store;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Queue feeding the media worker
pub type MediaQueue = JobQueue<MediaJob>;

/// How a media job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Active,
    Failed,
    /// Record missing or already terminal
    Abandoned,
}

impl JobOutcome {
    fn label(self) -> &'static str {
        match self {
            JobOutcome::Active => "active",
            JobOutcome::Failed => "failed",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

/// Turns media jobs into published variants
#[derive(Clone)]
pub struct MediaProcessor {
    store: Store,
    static_root: PathBuf,
    keep_originals: bool,
}

impl MediaProcessor {
    pub fn new(store: Store, static_root: PathBuf, keep_originals: bool) -> Self {
        Self {
            store,
            static_root,
            keep_originals,
        }
    }

    /// Start the single worker behind a queue of `capacity` jobs
    pub fn spawn(self, capacity: usize) -> MediaQueue {
        let (queue, mut rx) = JobQueue::bounded("media", capacity);

        let handle = tokio::spawn(async move {
            info!("Media worker started");
            while let Some(job) = rx.next().await {
                self.process(job).await;
            }
            info!("Media worker stopped");
        });
        queue.attach(handle);

        queue
    }

    /// Process one job to completion
    pub async fn process(&self, job: MediaJob) -> JobOutcome {
        let started = Instant::now();
        let image_id = job.image_id;

        let outcome = self.run(job).await;

        metrics::record_media_job(outcome.label(), started.elapsed().as_secs_f64());
        info!(image_id, outcome = outcome.label(), "Media job finished");
        outcome
    }

    async fn run(&self, job: MediaJob) -> JobOutcome {
        let image_id = job.image_id;

        // Status beacon: the record must still exist and still be Pending
        let record = match self
            .store
            .update_blocking(move |tx| tx.get::<MediaRecord>(image_id))
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(image_id, "Media record missing, abandoning job");
                return JobOutcome::Abandoned;
            }
            Err(e) => {
                error!(image_id, error = %e, "Failed to read media record");
                return self.fail(image_id).await;
            }
        };
        if record.status.is_terminal() {
            warn!(image_id, status = ?record.status, "Media record already processed, abandoning job");
            return JobOutcome::Abandoned;
        }

        let data = job.data.clone();
        let mime_type = job.mime_type.clone();
        let transcoded =
            match tokio::task::spawn_blocking(move || transcoder::transcode(&data, &mime_type))
                .await
            {
                Ok(Ok(transcoded)) => transcoded,
                Ok(Err(e)) => {
                    warn!(image_id, error = %e, "Transcoding failed");
                    return self.fail(image_id).await;
                }
                Err(e) => {
                    error!(image_id, error = %e, "Transcoder task panicked");
                    return self.fail(image_id).await;
                }
            };

        let dimensions = (transcoded.width, transcoded.height);
        let root = self.static_root.clone();
        let original = self.keep_originals.then(|| job.data.clone());
        let published = tokio::task::spawn_blocking(move || {
            publish(&root, &record, &transcoded, original.as_deref())
        })
        .await;

        match published {
            Ok(Ok(count)) => debug!(image_id, files = count, "Variants published"),
            Ok(Err(e)) => {
                error!(image_id, error = %e, "Failed to publish variants");
                return self.fail(image_id).await;
            }
            Err(e) => {
                error!(image_id, error = %e, "Publish task panicked");
                return self.fail(image_id).await;
            }
        }

        let committed = self
            .store
            .update_blocking(move |tx| finish(tx, image_id, MediaStatus::Active, Some(dimensions)))
            .await;

        match committed {
            Ok(Some(record)) if record.status == MediaStatus::Active => {
                debug!(image_id, width = record.width, height = record.height, "Media record active");
                JobOutcome::Active
            }
            Ok(Some(record)) => {
                warn!(image_id, status = ?record.status, "Media record changed while processing");
                JobOutcome::Abandoned
            }
            Ok(None) => {
                warn!(image_id, "Media record deleted while processing");
                JobOutcome::Abandoned
            }
            Err(e) => {
                error!(image_id, error = %e, "Failed to commit media record");
                self.fail(image_id).await
            }
        }
    }

    async fn fail(&self, image_id: u64) -> JobOutcome {
        if let Err(e) = self
            .store
            .update_blocking(move |tx| finish(tx, image_id, MediaStatus::Failed, None))
            .await
        {
            error!(image_id, error = %e, "Failed to mark media record failed");
        }
        JobOutcome::Failed
    }
}

/// Write every variant, then the archived original when asked. Returns the
/// number of files written.
fn publish(
    root: &Path,
    record: &MediaRecord,
    transcoded: &Transcoded,
    original: Option<&[u8]>,
) -> std::io::Result<usize> {
    let mut written = 0;

    for size in VariantSize::ALL {
        for &format in VariantFormat::available() {
            match transcoded.variant(size, format) {
                Some(bytes) if !bytes.is_empty() => {
                    write_atomic(&root.join(record.variant_path(size, format)), bytes)?;
                    written += 1;
                }
                _ => {}
            }
        }
    }

    if let Some(data) = original {
        let path = root.join(record.original_path());
        if !path.exists() {
            write_atomic(&path, data)?;
            written += 1;
        }
    }

    Ok(written)
}
