use crate::criteria::{FilterCriteria, FilterHash, RawCriteria, SortField};
use crate::error::{Error, ErrorKind};
use crate::models::{from_nanos, to_nanos};
use crate::registry::RegistryEntry;
use exn::ResultExt;

#[derive(sqlx::FromRow)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) struct RegistryRow {
    pub(crate) hash: String,
    pub(crate) table_name: String,
    pub(crate) criteria: String,
    pub(crate) sort_field: String,
    pub(crate) row_count: i64,
    pub(crate) byte_size: i64,
    pub(crate) created_at: i64,
    pub(crate) last_accessed_at: i64,
}
impl TryFrom<&RegistryEntry> for RegistryRow {
    type Error = Error;
    fn try_from(entry: &RegistryEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            hash: entry.hash.to_string(),
            table_name: entry.table_name.clone(),
            criteria: serde_json::to_string(&entry.criteria.to_raw()).or_raise(|| ErrorKind::InvalidData("criteria"))?,
            sort_field: entry.criteria.sort().to_string(),
            row_count: i64::try_from(entry.row_count).or_raise(|| ErrorKind::InvalidData("row count"))?,
            byte_size: i64::try_from(entry.byte_size).or_raise(|| ErrorKind::InvalidData("byte size"))?,
            created_at: to_nanos(entry.created_at)?,
            last_accessed_at: to_nanos(entry.last_accessed_at)?,
        })
    }
}
impl TryFrom<RegistryRow> for RegistryEntry {
    type Error = Error;
    fn try_from(row: RegistryRow) -> Result<Self, Self::Error> {
        let raw: RawCriteria = serde_json::from_str(&row.criteria).or_raise(|| ErrorKind::InvalidData("criteria"))?;
        let criteria = FilterCriteria::try_from(raw).or_raise(|| ErrorKind::InvalidData("criteria"))?;
        // The column is denormalized for the page path; it must agree with
        // the criteria it was derived from.
        let sort_field = row.sort_field.parse::<SortField>().or_raise(|| ErrorKind::InvalidData("sort field"))?;
        if sort_field != criteria.sort() {
            exn::bail!(ErrorKind::InvalidData("sort field"));
        }
        Ok(Self {
            hash: row.hash.parse::<FilterHash>().or_raise(|| ErrorKind::InvalidData("hash"))?,
            table_name: row.table_name,
            criteria,
            row_count: u64::try_from(row.row_count).or_raise(|| ErrorKind::InvalidData("row count"))?,
            byte_size: u64::try_from(row.byte_size).or_raise(|| ErrorKind::InvalidData("byte size"))?,
            created_at: from_nanos(row.created_at)?,
            last_accessed_at: from_nanos(row.last_accessed_at)?,
        })
    }
}
