use crate::record::MediaRecord;
use crate::source::error::{Error, ErrorKind};
use exn::ResultExt;
use time::OffsetDateTime;

/// Row of the primary `media` table.
#[derive(sqlx::FromRow)]
pub(crate) struct MediaRow {
    pub(crate) id: i64,
    pub(crate) path: String,
    pub(crate) file_name: String,
    pub(crate) file_type: String,
    pub(crate) file_size: i64,
    pub(crate) created_at: i64,
    pub(crate) modified_at: i64,
    #[sqlx(default)]
    pub(crate) score: Option<i64>,
    pub(crate) nsfw: bool,
}
impl From<&MediaRecord> for MediaRow {
    fn from(record: &MediaRecord) -> Self {
        Self {
            id: record.id,
            path: record.path.clone(),
            file_name: record.file_name.clone(),
            file_type: record.file_type.clone(),
            file_size: record.file_size,
            created_at: record.created_at.unix_timestamp(),
            modified_at: record.modified_at.unix_timestamp(),
            score: record.score,
            nsfw: record.nsfw,
        }
    }
}
impl TryFrom<MediaRow> for MediaRecord {
    type Error = Error;
    fn try_from(row: MediaRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            path: row.path,
            file_name: row.file_name,
            file_type: row.file_type,
            file_size: row.file_size,
            created_at: OffsetDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("created at"))?,
            modified_at: OffsetDateTime::from_unix_timestamp(row.modified_at)
                .or_raise(|| ErrorKind::InvalidData("modified at"))?,
            score: row.score,
            nsfw: row.nsfw,
        })
    }
}
