//! Filter criteria, their canonical form, and the filter hash.
//!
//! A [`FilterCriteria`] is a value type: constructing one normalizes it (file
//! types are lowercased, deduplicated and sorted; timestamps are truncated to
//! whole seconds) so two criteria compare equal exactly when their canonical
//! forms do. The [`FilterHash`] is a BLAKE3 digest of that canonical form and
//! is the identity of the buffer materialized for it.
//!
//! [`RawCriteria`] is the loosely typed shape criteria arrive in (query
//! strings, JSON bodies, CLI flags). Converting it into [`FilterCriteria`] is
//! where [`ErrorKind::InvalidCriteria`] comes from.

use crate::error::{Error, ErrorKind, Result};
use crate::record::{MediaRecord, SortKey};
use derive_more::Display;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, UtcOffset};

/// Length, in hex characters, of a [`FilterHash`].
pub const FILTER_HASH_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
pub enum SortField {
    #[default]
    #[display("created_at")]
    CreatedAt,
    #[display("modified_at")]
    ModifiedAt,
    #[display("score")]
    Score,
    #[display("file_name")]
    FileName,
    #[display("file_size")]
    FileSize,
}
impl SortField {
    pub const ALL: [SortField; 5] = [
        SortField::CreatedAt,
        SortField::ModifiedAt,
        SortField::Score,
        SortField::FileName,
        SortField::FileSize,
    ];

    /// Column of the primary `media` table this field sorts on.
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::ModifiedAt => "modified_at",
            Self::Score => "score",
            Self::FileName => "file_name",
            Self::FileSize => "file_size",
        }
    }
}
impl FromStr for SortField {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.column() == s)
            .ok_or_else(|| Error::from(ErrorKind::InvalidCriteria(format!("unknown sort field: {s}"))))
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
pub enum SortDirection {
    #[display("asc")]
    Asc,
    #[default]
    #[display("desc")]
    Desc,
}
impl SortDirection {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Orient an ascending comparison in this direction.
    pub(crate) fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            Self::Asc => ordering,
            Self::Desc => ordering.reverse(),
        }
    }
}
impl FromStr for SortDirection {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => exn::bail!(ErrorKind::InvalidCriteria(format!("unknown sort direction: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
pub enum NsfwMode {
    #[default]
    #[display("all")]
    All,
    #[display("sfw_only")]
    SfwOnly,
    #[display("nsfw_only")]
    NsfwOnly,
}
impl NsfwMode {
    fn allows(&self, nsfw: bool) -> bool {
        match self {
            Self::All => true,
            Self::SfwOnly => !nsfw,
            Self::NsfwOnly => nsfw,
        }
    }
}
impl FromStr for NsfwMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "sfw_only" => Ok(Self::SfwOnly),
            "nsfw_only" => Ok(Self::NsfwOnly),
            other => exn::bail!(ErrorKind::InvalidCriteria(format!("unknown nsfw mode: {other}"))),
        }
    }
}

/// Deterministic digest of normalized [`FilterCriteria`].
///
/// Always [`FILTER_HASH_LEN`] lowercase hex characters, which also makes it
/// safe to splice into buffer table names.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FilterHash(String);
impl FilterHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 16 hex characters; enough to tell buffers apart in table
    /// names and log lines.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}
impl FromStr for FilterHash {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let valid = s.len() == FILTER_HASH_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            exn::bail!(ErrorKind::InvalidCriteria(format!("malformed filter hash: {s}")));
        }
        Ok(Self(s.to_string()))
    }
}
impl AsRef<str> for FilterHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Filter criteria as they arrive from the outside world: everything
/// optional, everything stringly typed.
///
/// Absent and `null` fields deserialize identically, so `{}` and
/// `{"min_score": null}` describe the same criteria.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawCriteria {
    pub sort: Option<String>,
    pub direction: Option<String>,
    pub file_types: Option<Vec<String>>,
    /// RFC 3339 timestamp or plain `YYYY-MM-DD` date.
    pub date_start: Option<String>,
    /// RFC 3339 timestamp or plain `YYYY-MM-DD` date (inclusive of the whole day).
    pub date_end: Option<String>,
    pub nsfw: Option<String>,
    pub min_score: Option<i64>,
    pub max_score: Option<i64>,
}

/// Normalized, validated filter criteria.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    sort: SortField,
    direction: SortDirection,
    file_types: BTreeSet<String>,
    date_start: Option<OffsetDateTime>,
    date_end: Option<OffsetDateTime>,
    nsfw: NsfwMode,
    min_score: Option<i64>,
    max_score: Option<i64>,
}

/// Fixed-order projection of [`FilterCriteria`] that gets hashed. Field order
/// here *is* the canonical key order; don't reorder without accepting that
/// every existing buffer hash changes.
#[derive(Serialize)]
struct Canonical<'a> {
    sort: &'static str,
    direction: &'static str,
    file_types: &'a BTreeSet<String>,
    date_start: Option<i64>,
    date_end: Option<i64>,
    nsfw: &'static str,
    min_score: Option<i64>,
    max_score: Option<i64>,
}

fn normalize_file_type(file_type: &str) -> Option<String> {
    let normalized = file_type.trim().trim_start_matches('.').to_ascii_lowercase();
    (!normalized.is_empty()).then_some(normalized)
}

fn truncate_to_seconds(at: OffsetDateTime) -> OffsetDateTime {
    // Timestamps are stored and compared as whole Unix seconds.
    at.to_offset(UtcOffset::UTC).replace_nanosecond(0).unwrap_or(at)
}

/// Parse either a full RFC 3339 timestamp or a plain `YYYY-MM-DD` date.
///
/// Plain dates resolve to the first second of the day, or the last second of
/// the day when `end_of_day` is set.
fn parse_datetime(field: &'static str, value: &str, end_of_day: bool) -> Result<OffsetDateTime> {
    if let Ok(at) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(truncate_to_seconds(at));
    }
    let invalid = || ErrorKind::InvalidCriteria(format!("unparseable {field}: {value}"));
    let mut parts = value.splitn(3, '-');
    let (Some(year), Some(month), Some(day)) = (parts.next(), parts.next(), parts.next()) else {
        exn::bail!(invalid());
    };
    let year = year.parse::<i32>().or_raise(invalid)?;
    let month = month.parse::<u8>().or_raise(invalid)?;
    let month = Month::try_from(month).or_raise(invalid)?;
    let day = day.parse::<u8>().or_raise(invalid)?;
    let date = Date::from_calendar_date(year, month, day).or_raise(invalid)?;
    let datetime = match end_of_day {
        true => date.with_hms(23, 59, 59).or_raise(invalid)?,
        false => date.midnight(),
    };
    Ok(datetime.assume_utc())
}

impl FilterCriteria {
    pub fn new(sort: SortField, direction: SortDirection) -> Self {
        Self { sort, direction, ..Self::default() }
    }

    pub fn with_file_types(mut self, file_types: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.file_types = file_types.into_iter().filter_map(|t| normalize_file_type(t.as_ref())).collect();
        self
    }

    pub fn with_date_range(mut self, start: Option<OffsetDateTime>, end: Option<OffsetDateTime>) -> Self {
        self.date_start = start.map(truncate_to_seconds);
        self.date_end = end.map(truncate_to_seconds);
        self
    }

    pub fn with_nsfw(mut self, nsfw: NsfwMode) -> Self {
        self.nsfw = nsfw;
        self
    }

    pub fn with_score_range(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min_score = min;
        self.max_score = max;
        self
    }

    pub fn sort(&self) -> SortField {
        self.sort
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    pub fn file_types(&self) -> &BTreeSet<String> {
        &self.file_types
    }

    pub fn date_range(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        (self.date_start, self.date_end)
    }

    pub fn nsfw(&self) -> NsfwMode {
        self.nsfw
    }

    pub fn score_range(&self) -> (Option<i64>, Option<i64>) {
        (self.min_score, self.max_score)
    }

    /// Reject ranges that can never match anything.
    ///
    /// Criteria built from [`RawCriteria`] are already validated; this is for
    /// criteria assembled with the builder methods.
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.date_start, self.date_end)
            && start > end
        {
            exn::bail!(ErrorKind::InvalidCriteria("date_start is after date_end".to_string()));
        }
        if let (Some(min), Some(max)) = (self.min_score, self.max_score)
            && min > max
        {
            exn::bail!(ErrorKind::InvalidCriteria("min_score is greater than max_score".to_string()));
        }
        Ok(())
    }

    fn canonical(&self) -> Canonical<'_> {
        Canonical {
            sort: self.sort.column(),
            direction: match self.direction {
                SortDirection::Asc => "asc",
                SortDirection::Desc => "desc",
            },
            file_types: &self.file_types,
            date_start: self.date_start.map(OffsetDateTime::unix_timestamp),
            date_end: self.date_end.map(OffsetDateTime::unix_timestamp),
            nsfw: match self.nsfw {
                NsfwMode::All => "all",
                NsfwMode::SfwOnly => "sfw_only",
                NsfwMode::NsfwOnly => "nsfw_only",
            },
            min_score: self.min_score,
            max_score: self.max_score,
        }
    }

    /// Canonical JSON encoding: fixed key order, sorted arrays, `null` for
    /// anything absent.
    pub fn canonical_json(&self) -> String {
        // Infallible: the canonical struct only holds strings, integers and
        // a set of strings, none of which can fail to serialize.
        serde_json::to_string(&self.canonical()).unwrap_or_default()
    }

    /// Compute the [`FilterHash`] identifying these criteria. Pure and total.
    pub fn hash(&self) -> FilterHash {
        FilterHash(blake3::hash(self.canonical_json().as_bytes()).to_hex().to_string())
    }

    /// Whether a record satisfies every predicate. Creation times count in
    /// whole seconds, as they are stored.
    pub fn matches(&self, record: &MediaRecord) -> bool {
        let file_type = normalize_file_type(&record.file_type).unwrap_or_default();
        (self.file_types.is_empty() || self.file_types.contains(&file_type))
            && self.date_start.is_none_or(|start| record.created_at.unix_timestamp() >= start.unix_timestamp())
            && self.date_end.is_none_or(|end| record.created_at.unix_timestamp() <= end.unix_timestamp())
            && self.nsfw.allows(record.nsfw)
            && self.min_score.is_none_or(|min| record.score.is_some_and(|score| score >= min))
            && self.max_score.is_none_or(|max| record.score.is_some_and(|score| score <= max))
    }

    /// Total order of records under these criteria: the sort key in the
    /// requested direction (missing keys always last), then the record id
    /// in the same direction as the tie-break.
    pub fn compare(&self, a: &MediaRecord, b: &MediaRecord) -> Ordering {
        let by_key = match (a.sort_key(self.sort), b.sort_key(self.sort)) {
            (SortKey::Null, SortKey::Null) => Ordering::Equal,
            (SortKey::Null, _) => Ordering::Greater,
            (_, SortKey::Null) => Ordering::Less,
            (a, b) => self.direction.apply(a.cmp(&b)),
        };
        by_key.then_with(|| self.direction.apply(a.id.cmp(&b.id)))
    }

    /// Convert back into the wire shape, such that converting the result
    /// again yields criteria equal to `self`.
    pub fn to_raw(&self) -> RawCriteria {
        let format = |at: OffsetDateTime| at.format(&Rfc3339).ok();
        RawCriteria {
            sort: Some(self.sort.to_string()),
            direction: Some(self.direction.to_string()),
            file_types: (!self.file_types.is_empty()).then(|| self.file_types.iter().cloned().collect()),
            date_start: self.date_start.and_then(format),
            date_end: self.date_end.and_then(format),
            nsfw: Some(self.nsfw.to_string()),
            min_score: self.min_score,
            max_score: self.max_score,
        }
    }
}

impl TryFrom<RawCriteria> for FilterCriteria {
    type Error = Error;
    fn try_from(raw: RawCriteria) -> Result<Self> {
        let sort = raw.sort.as_deref().map(SortField::from_str).transpose()?.unwrap_or_default();
        let direction = raw.direction.as_deref().map(SortDirection::from_str).transpose()?.unwrap_or_default();
        let nsfw = raw.nsfw.as_deref().map(NsfwMode::from_str).transpose()?.unwrap_or_default();
        let date_start = raw.date_start.as_deref().map(|s| parse_datetime("date_start", s, false)).transpose()?;
        let date_end = raw.date_end.as_deref().map(|s| parse_datetime("date_end", s, true)).transpose()?;
        let criteria = FilterCriteria::new(sort, direction)
            .with_file_types(raw.file_types.unwrap_or_default())
            .with_date_range(date_start, date_end)
            .with_nsfw(nsfw)
            .with_score_range(raw.min_score, raw.max_score);
        criteria.validate()?;
        Ok(criteria)
    }
}

impl FromStr for FilterCriteria {
    type Err = Error;
    /// Parse criteria from a JSON object in the [`RawCriteria`] shape.
    fn from_str(s: &str) -> Result<Self> {
        let raw: RawCriteria = serde_json::from_str(s)
            .or_raise(|| ErrorKind::InvalidCriteria("criteria are not a valid JSON object".to_string()))?;
        raw.try_into()
    }
}
