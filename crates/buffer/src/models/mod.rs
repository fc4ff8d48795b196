mod active;
mod media;
mod registry;

pub(crate) use self::active::ActiveRow;
pub(crate) use self::media::MediaRow;
pub(crate) use self::registry::RegistryRow;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use time::OffsetDateTime;

/// Registry and active-filter timestamps are stored as Unix nanoseconds so
/// that LRU ordering doesn't collapse accesses within the same second.
pub(crate) fn to_nanos(at: OffsetDateTime) -> Result<i64> {
    i64::try_from(at.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn from_nanos(nanos: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).or_raise(|| ErrorKind::InvalidData("timestamp"))
}
