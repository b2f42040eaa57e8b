/// Photo media pipeline
///
/// Uploaded photos are stored as a Pending `MediaRecord` and handed to the
/// media queue, whose single worker transcodes them into size and format
/// variants, publishes the files and flips the record to Active or Failed.

pub mod files;
pub mod processor;
pub mod transcoder;

pub use processor::{JobOutcome, MediaProcessor, MediaQueue};
pub use transcoder::{VariantFormat, VariantSize};

use crate::error::AppResult;
use crate::store::codec::{self, CodecError, Packer, Unpacker};
use crate::store::{tables, Record, WriteTx};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use redb::TableDefinition;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// MIME types accepted for upload
pub const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// File extension for an accepted upload type
pub fn source_extension(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "image/jpeg" => Some(".jpg"),
        "image/png" => Some(".png"),
        "image/gif" => Some(".gif"),
        "image/webp" => Some(".webp"),
        _ => None,
    }
}

/// Processing status of a media record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Active = 0,
    Pending = 1,
    Failed = 2,
}

impl MediaStatus {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Active),
            1 => Some(Self::Pending),
            2 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// An uploaded photo and the state of its variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: u64,
    pub family_id: u64,
    pub person_id: u64,
    pub user_id: u64,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    /// Primary rendition dimensions, 0 until processed
    pub width: u32,
    pub height: u32,
    /// Path of the primary rendition relative to the static root
    pub file_path: String,
    pub status: MediaStatus,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub photo_date: Option<DateTime<Utc>>,
}

impl Record for MediaRecord {
    const BUCKET: TableDefinition<'static, u64, &'static [u8]> = tables::IMAGES;

    fn id(&self) -> u64 {
        self.id
    }

    fn pack(&self) -> Vec<u8> {
        let mut p = Packer::new(1);
        p.u64(self.id)
            .u64(self.family_id)
            .u64(self.person_id)
            .u64(self.user_id)
            .str(&self.filename)
            .str(&self.mime_type)
            .u64(self.size)
            .u32(self.width)
            .u32(self.height)
            .str(&self.file_path)
            .u8(self.status as u8)
            .time(self.created_at)
            .opt_str(self.title.as_deref())
            .opt_str(self.description.as_deref())
            .opt_time(self.photo_date);
        p.finish()
    }

    fn unpack(buf: &[u8]) -> Result<Self, CodecError> {
        let (mut u, _) = Unpacker::new("media_record", buf, &[1])?;

        let id = u.u64()?;
        let family_id = u.u64()?;
        let person_id = u.u64()?;
        let user_id = u.u64()?;
        let filename = u.str()?;
        let mime_type = u.str()?;
        let size = u.u64()?;
        let width = u.u32()?;
        let height = u.u32()?;
        let file_path = u.str()?;
        let raw_status = u.u8()?;
        let status = MediaStatus::from_u8(raw_status)
            .ok_or_else(|| u.invalid("status", raw_status as u64))?;
        let created_at = u.time()?;

        // Application fields were appended later
        let (mut title, mut description, mut photo_date) = (None, None, None);
        if u.has_remaining() {
            title = u.opt_str()?;
            description = u.opt_str()?;
            photo_date = u.opt_time()?;
        }

        Ok(Self {
            id,
            family_id,
            person_id,
            user_id,
            filename,
            mime_type,
            size,
            width,
            height,
            file_path,
            status,
            created_at,
            title,
            description,
            photo_date,
        })
    }
}

impl MediaRecord {
    /// Base filename shared by every variant
    pub fn base_name(&self) -> &str {
        Path::new(&self.file_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    }

    /// Relative path of one variant: large is `<base><ext>`, other sizes
    /// are `<base>_<size><ext>`
    pub fn variant_path(&self, size: VariantSize, format: VariantFormat) -> PathBuf {
        let name = match size {
            VariantSize::Large => format!("{}{}", self.base_name(), format.extension()),
            _ => format!("{}_{}{}", self.base_name(), size.name(), format.extension()),
        };
        Path::new(&self.file_path).with_file_name(name)
    }

    /// Relative path of the archived upload
    pub fn original_path(&self) -> PathBuf {
        let ext = source_extension(&self.mime_type).unwrap_or(".bin");
        Path::new(&self.file_path).with_file_name(format!("{}_original{}", self.base_name(), ext))
    }
}

/// One image awaiting processing
#[derive(Debug, Clone)]
pub struct MediaJob {
    pub image_id: u64,
    pub data: Bytes,
    pub mime_type: String,
}

/// Fields supplied by the upload handler
#[derive(Debug, Clone)]
pub struct NewMedia {
    pub family_id: u64,
    pub person_id: u64,
    pub user_id: u64,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub file_path: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub photo_date: Option<DateTime<Utc>>,
}

/// Insert a Pending record and index it by family and person
pub fn create_pending(tx: &WriteTx, new: NewMedia) -> AppResult<MediaRecord> {
    let record = MediaRecord {
        id: tx.next_id::<MediaRecord>()?,
        family_id: new.family_id,
        person_id: new.person_id,
        user_id: new.user_id,
        filename: new.filename,
        mime_type: new.mime_type,
        size: new.size,
        width: 0,
        height: 0,
        file_path: new.file_path,
        status: MediaStatus::Pending,
        created_at: codec::now(),
        title: new.title,
        description: new.description,
        photo_date: new.photo_date.map(codec::stored_precision),
    };

    tx.put(&record)?;
    tx.set_term(tables::IMAGE_BY_FAMILY, record.id, record.family_id)?;
    tx.set_term(tables::IMAGE_BY_PERSON, record.id, record.person_id)?;
    Ok(record)
}

/// Move a Pending record to a terminal status. Terminal records are left
/// untouched; returns the record as stored afterwards.
pub fn finish(
    tx: &WriteTx,
    id: u64,
    status: MediaStatus,
    dimensions: Option<(u32, u32)>,
) -> AppResult<Option<MediaRecord>> {
    let Some(mut record) = tx.get::<MediaRecord>(id)? else {
        return Ok(None);
    };
    if record.status.is_terminal() {
        return Ok(Some(record));
    }

    record.status = status;
    if let Some((width, height)) = dimensions {
        record.width = width;
        record.height = height;
    }
    tx.put(&record)?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn sample(id: u64) -> MediaRecord {
        MediaRecord {
            id,
            family_id: 7,
            person_id: 3,
            user_id: 10,
            filename: "beach.png".into(),
            mime_type: "image/png".into(),
            size: 1234,
            width: 0,
            height: 0,
            file_path: "photos/abc.jpg".into(),
            status: MediaStatus::Pending,
            created_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            title: Some("Beach".into()),
            description: None,
            photo_date: None,
        }
    }

    #[test]
    fn test_variant_paths() {
        let record = sample(1);
        assert_eq!(
            record.variant_path(VariantSize::Large, VariantFormat::Jpeg),
            PathBuf::from("photos/abc.jpg")
        );
        assert_eq!(
            record.variant_path(VariantSize::Medium, VariantFormat::Webp),
            PathBuf::from("photos/abc_medium.webp")
        );
        assert_eq!(
            record.variant_path(VariantSize::Thumb, VariantFormat::Avif),
            PathBuf::from("photos/abc_thumb.avif")
        );
        assert_eq!(record.original_path(), PathBuf::from("photos/abc_original.png"));
    }

    #[test]
    fn test_record_without_trailing_fields_decodes() {
        let record = sample(1);
        let full = record.pack();

        // Cut the three optional trailing fields: title (1 + 4 + 5), description (1), photo_date (1)
        let legacy = &full[..full.len() - 12];
        let decoded = MediaRecord::unpack(legacy).unwrap();
        assert_eq!(decoded.title, None);
        assert_eq!(decoded.file_path, "photos/abc.jpg");
    }

    #[test]
    fn test_invalid_status_rejected() {
        let mut buf = sample(1).pack();
        // status byte follows the fixed-width header and the three strings
        let status_at = 1 + 8 * 4 + (4 + 9) + (4 + 9) + 8 + 4 + 4 + (4 + 14);
        buf[status_at] = 9;
        assert!(matches!(
            MediaRecord::unpack(&buf),
            Err(CodecError::InvalidValue { field: "status", .. })
        ));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MediaStatus::Active).unwrap(), "\"active\"");
        assert_eq!(serde_json::to_string(&MediaStatus::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn test_finish_never_leaves_terminal_state() {
        let (_dir, store) = test_store();
        store.update(|tx| tx.put(&sample(1))).unwrap();

        let failed = store
            .update(|tx| finish(tx, 1, MediaStatus::Failed, None))
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, MediaStatus::Failed);

        let again = store
            .update(|tx| finish(tx, 1, MediaStatus::Active, Some((10, 10))))
            .unwrap()
            .unwrap();
        assert_eq!(again.status, MediaStatus::Failed);
        assert_eq!(again.width, 0);
    }

    #[test]
    fn test_create_pending_indexes_record() {
        let (_dir, store) = test_store();
        let record = store
            .update(|tx| {
                create_pending(
                    tx,
                    NewMedia {
                        family_id: 7,
                        person_id: 3,
                        user_id: 10,
                        filename: "a.jpg".into(),
                        mime_type: "image/jpeg".into(),
                        size: 10,
                        file_path: "photos/x.jpg".into(),
                        title: None,
                        description: None,
                        photo_date: None,
                    },
                )
            })
            .unwrap();

        assert_eq!(record.status, MediaStatus::Pending);
        let by_person = store
            .view(|tx| tx.targets(tables::IMAGE_BY_PERSON, 3, crate::store::Window::all()))
            .unwrap();
        assert_eq!(by_person, vec![record.id]);
    }
}
