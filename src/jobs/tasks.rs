/// Background task implementations
use crate::{
    context::AppContext,
    error::AppResult,
    media::{self, MediaJob, MediaRecord, MediaStatus},
    metrics,
};
use bytes::Bytes;

/// Health check - verify the KV store answers
pub async fn health_check(ctx: &AppContext) -> AppResult<()> {
    crate::api::health::probe_store(ctx).await
}

/// Publish queue depths and the live connection count
pub fn refresh_gauges(ctx: &AppContext) {
    metrics::MEDIA_QUEUE_DEPTH.set(ctx.media_queue.len() as i64);
    metrics::PUSH_QUEUE_DEPTH.set(ctx.push.len() as i64);
    metrics::CHAT_CONNECTIONS_ACTIVE.set(ctx.hub.total_connections() as i64);
}

/// What boot recovery did with Pending records
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

/// Re-queue Pending records whose original upload is archived on disk and
/// mark the rest Failed
///
/// Runs before the server accepts requests, so every Pending record found
/// belongs to a job lost at the previous shutdown. A full queue is waited
/// on; only a stopped worker fails a record whose original is on disk.
pub async fn recover_pending_media(ctx: &AppContext) -> AppResult<RecoveryReport> {
    let pending: Vec<MediaRecord> = ctx
        .store
        .view_blocking(|tx| {
            Ok(tx
                .scan::<MediaRecord>()?
                .into_iter()
                .filter(|r| r.status == MediaStatus::Pending)
                .collect())
        })
        .await?;

    let mut report = RecoveryReport::default();
    if pending.is_empty() {
        return Ok(report);
    }

    tracing::info!(count = pending.len(), "Recovering pending media records");

    for record in pending {
        let image_id = record.id;
        let original = ctx.config.storage.static_directory.join(record.original_path());

        let requeued = match tokio::fs::read(&original).await {
            Ok(data) => {
                let job = MediaJob {
                    image_id,
                    data: Bytes::from(data),
                    mime_type: record.mime_type.clone(),
                };
                match ctx.media_queue.submit_wait(job).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(image_id, error = %e, "Could not re-queue pending media");
                        false
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(image_id, error = %e, "Failed to read archived original");
                false
            }
        };

        if requeued {
            report.requeued += 1;
            continue;
        }

        ctx.store
            .update_blocking(move |tx| media::finish(tx, image_id, MediaStatus::Failed, None))
            .await?;
        report.failed += 1;
    }

    tracing::info!(
        requeued = report.requeued,
        failed = report.failed,
        "Pending media recovery finished"
    );
    metrics::record_background_job("media_recovery", "success");
    Ok(report)
}
