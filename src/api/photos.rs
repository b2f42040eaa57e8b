/// Photo upload and media record endpoints
use crate::{
    api::{chat::PageParams, middleware::AuthUser},
    context::AppContext,
    error::{AppError, AppResult},
    media::{self, files::write_atomic, MediaJob, MediaRecord, MediaStatus, NewMedia},
    store::{tables, Window},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build photo routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/photos", get(list_photos).post(upload_photo))
        .route("/api/photos/:id", get(get_photo))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    person_id: Option<u64>,
    filename: Option<String>,
    title: Option<String>,
    description: Option<String>,
    photo_date: Option<DateTime<Utc>>,
}

/// Declared MIME type without parameters
fn declared_mime(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
}

/// Random 16-byte base name under `photos/`
fn new_file_path() -> String {
    let base: [u8; 16] = rand::random();
    format!("photos/{}.jpg", hex::encode(base))
}

/// Accept a raw image body and queue it for processing
///
/// The record is written Pending before the job is submitted. When the
/// media queue is full the record is marked Failed and the caller gets 503.
async fn upload_photo(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> AppResult<impl IntoResponse> {
    let limit = ctx.config.media.upload_limit;

    let person_id = params
        .person_id
        .ok_or_else(|| AppError::Validation("person_id is required".to_string()))?;

    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > limit) {
        media_rejected();
        return Err(AppError::TooLarge(format!("Upload exceeds {} bytes", limit)));
    }

    let mime_type = declared_mime(&headers).unwrap_or_default();
    let Some(extension) = media::source_extension(&mime_type) else {
        media_rejected();
        return Err(AppError::InvalidType(format!(
            "Unsupported content type '{}', expected one of {}",
            mime_type,
            media::ALLOWED_MIME_TYPES.join(", ")
        )));
    };

    let data = axum::body::to_bytes(body, limit).await.map_err(|_| {
        media_rejected();
        AppError::TooLarge(format!("Upload exceeds {} bytes", limit))
    })?;
    if data.is_empty() {
        return Err(AppError::Validation("Empty upload".to_string()));
    }

    let new = NewMedia {
        family_id: user.family_id,
        person_id,
        user_id: user.id,
        filename: params
            .filename
            .unwrap_or_else(|| format!("upload{}", extension)),
        mime_type: mime_type.clone(),
        size: data.len() as u64,
        file_path: new_file_path(),
        title: params.title,
        description: params.description,
        photo_date: params.photo_date,
    };

    let record = ctx
        .store
        .update_blocking(move |tx| media::create_pending(tx, new))
        .await?;

    if ctx.config.media.keep_originals {
        let path = ctx.config.storage.static_directory.join(record.original_path());
        let original = data.clone();
        let staged = tokio::task::spawn_blocking(move || write_atomic(&path, &original)).await?;
        if let Err(e) = staged {
            tracing::warn!(image_id = record.id, error = %e, "Failed to stage original upload");
        }
    }

    let job = MediaJob {
        image_id: record.id,
        data,
        mime_type,
    };

    if let Err(e) = ctx.media_queue.submit(job) {
        let image_id = record.id;
        tracing::warn!(image_id, error = %e, "Media queue rejected job, marking record failed");
        ctx.store
            .update_blocking(move |tx| media::finish(tx, image_id, MediaStatus::Failed, None))
            .await?;
        media_rejected();
        return Err(e);
    }

    tracing::info!(
        image_id = record.id,
        family_id = record.family_id,
        person_id = record.person_id,
        size = record.size,
        "Photo accepted for processing"
    );

    Ok((StatusCode::ACCEPTED, Json(record)))
}

fn media_rejected() {
    crate::metrics::record_media_rejected();
}

/// Get one record of the caller's family
async fn get_photo(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Path(id): Path<u64>,
) -> AppResult<Json<MediaRecord>> {
    let record = ctx
        .store
        .view_blocking(move |tx| tx.get::<MediaRecord>(id))
        .await?
        .filter(|r| r.family_id == user.family_id)
        .ok_or_else(|| AppError::NotFound(format!("Photo not found: {}", id)))?;

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    person_id: Option<u64>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct PhotosResponse {
    photos: Vec<MediaRecord>,
}

/// Newest-first records of the family, or of one person in it
async fn list_photos(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Query(params): Query<ListParams>,
) -> AppResult<Json<PhotosResponse>> {
    let (limit, offset) = PageParams {
        limit: params.limit,
        offset: params.offset,
    }
    .window();
    let family_id = user.family_id;

    let photos = ctx
        .store
        .view_blocking(move |tx| {
            let window = Window::newest(limit, offset);
            let records: Vec<MediaRecord> = match params.person_id {
                Some(person_id) => tx.records_for(tables::IMAGE_BY_PERSON, person_id, window)?,
                None => tx.records_for(tables::IMAGE_BY_FAMILY, family_id, window)?,
            };
            Ok(records
                .into_iter()
                .filter(|r| r.family_id == family_id)
                .collect::<Vec<_>>())
        })
        .await?;

    Ok(Json(PhotosResponse { photos }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_declared_mime_strips_parameters() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_mime(&headers), None);

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Image/JPEG; charset=binary"),
        );
        assert_eq!(declared_mime(&headers).as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn test_new_file_path_shape() {
        let path = new_file_path();
        let base = path
            .strip_prefix("photos/")
            .and_then(|p| p.strip_suffix(".jpg"))
            .unwrap();
        assert_eq!(base.len(), 32);
        assert!(base.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_file_path(), path);
    }
}
