//! Records served out of buffers.

use crate::criteria::SortField;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A reviewable media item, as returned by the primary record source.
///
/// Buffers store a frozen JSON snapshot of each record alongside its sort key,
/// so pages are served without going back to the source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Unique within the record source. Doubles as the ordering tie-break.
    pub id: i64,
    pub path: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub modified_at: OffsetDateTime,
    pub score: Option<i64>,
    pub nsfw: bool,
}

/// Value a record sorts on for a given [`SortField`].
///
/// Ordering across variants is meaningless; only keys of the same field are
/// ever compared.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey {
    Null,
    Integer(i64),
    Text(String),
}
impl SortKey {
    /// Rough on-disk footprint, used for buffer size accounting.
    pub(crate) fn estimated_size(&self) -> usize {
        match self {
            Self::Null => 1,
            Self::Integer(_) => 8,
            Self::Text(text) => text.len(),
        }
    }
}

impl MediaRecord {
    pub fn sort_key(&self, field: SortField) -> SortKey {
        match field {
            SortField::CreatedAt => SortKey::Integer(self.created_at.unix_timestamp()),
            SortField::ModifiedAt => SortKey::Integer(self.modified_at.unix_timestamp()),
            SortField::Score => self.score.map(SortKey::Integer).unwrap_or(SortKey::Null),
            SortField::FileName => SortKey::Text(self.file_name.clone()),
            SortField::FileSize => SortKey::Integer(self.file_size),
        }
    }

    /// Deterministic record for tests: `id` seconds after the start of 2024,
    /// alternating between `jpg` and `png`, unscored, SFW.
    #[cfg(any(test, feature = "mock"))]
    pub fn sample(id: i64) -> Self {
        let created_at = time::macros::datetime!(2024-01-01 00:00 UTC) + time::Duration::seconds(id);
        let file_type = if id % 2 == 0 { "png" } else { "jpg" };
        Self {
            id,
            path: format!("library/{id:05}.{file_type}"),
            file_name: format!("{id:05}.{file_type}"),
            file_type: file_type.to_string(),
            file_size: 1024,
            created_at,
            modified_at: created_at,
            score: None,
            nsfw: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_key_per_field() {
        let mut record = MediaRecord::sample(7);
        assert_eq!(record.sort_key(SortField::Score), SortKey::Null);
        record.score = Some(4);
        assert_eq!(record.sort_key(SortField::Score), SortKey::Integer(4));
        assert_eq!(record.sort_key(SortField::FileName), SortKey::Text("00007.jpg".to_string()));
        assert_eq!(
            record.sort_key(SortField::CreatedAt),
            SortKey::Integer(record.created_at.unix_timestamp())
        );
    }

    #[test]
    fn test_payload_round_trip_keeps_timestamps() {
        let record = MediaRecord::sample(3);
        let json = serde_json::to_string(&record).unwrap();
        let back: MediaRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
