use crate::active::ActiveFilter;
use crate::criteria::{FilterCriteria, FilterHash, RawCriteria};
use crate::error::{Error, ErrorKind};
use crate::models::{from_nanos, to_nanos};
use exn::ResultExt;

#[derive(sqlx::FromRow)]
pub(crate) struct ActiveRow {
    pub(crate) session: String,
    pub(crate) hash: String,
    pub(crate) criteria: String,
    pub(crate) updated_at: i64,
}
impl TryFrom<&ActiveFilter> for ActiveRow {
    type Error = Error;
    fn try_from(active: &ActiveFilter) -> Result<Self, Self::Error> {
        Ok(Self {
            session: active.session.clone(),
            hash: active.hash.to_string(),
            criteria: serde_json::to_string(&active.criteria.to_raw()).or_raise(|| ErrorKind::InvalidData("criteria"))?,
            updated_at: to_nanos(active.updated_at)?,
        })
    }
}
impl TryFrom<ActiveRow> for ActiveFilter {
    type Error = Error;
    fn try_from(row: ActiveRow) -> Result<Self, Self::Error> {
        let raw: RawCriteria = serde_json::from_str(&row.criteria).or_raise(|| ErrorKind::InvalidData("criteria"))?;
        Ok(Self {
            session: row.session,
            hash: row.hash.parse::<FilterHash>().or_raise(|| ErrorKind::InvalidData("hash"))?,
            criteria: FilterCriteria::try_from(raw).or_raise(|| ErrorKind::InvalidData("criteria"))?,
            updated_at: from_nanos(row.updated_at)?,
        })
    }
}
