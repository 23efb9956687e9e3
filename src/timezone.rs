//! Provider-local time handling.
//!
//! The provider stamps callbacks and expects request timestamps in its local
//! time (East Africa Time) using the compact `YYYYMMDDHHMMSS` form.

use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};
use time_tz::{Offset, TimeZone};

use crate::Error;

/// The canonical timezone name the provider uses.
pub const PROVIDER_TIMEZONE: &str = "Africa/Nairobi";

const COMPACT_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]");

/// Get the current UTC offset of a canonical timezone, e.g. "Africa/Nairobi".
pub fn get_local_offset(canonical_timezone: &str) -> Option<UtcOffset> {
    time_tz::timezones::get_by_name(canonical_timezone)
        .map(|tz| tz.get_offset_utc(&OffsetDateTime::now_utc()).to_utc())
}

/// Format `datetime` as `YYYYMMDDHHMMSS` in the timezone given by `offset`.
pub fn format_compact_timestamp(datetime: OffsetDateTime, offset: UtcOffset) -> String {
    let local = datetime.to_offset(offset);

    // Formatting with a static, all-numeric description cannot fail.
    local
        .format(COMPACT_FORMAT)
        .unwrap_or_else(|_| local.unix_timestamp().to_string())
}

/// Parse a compact `YYYYMMDDHHMMSS` timestamp given in the timezone `offset`.
///
/// The provider sends this value as a JSON number, so callers may pass the
/// number's decimal string.
///
/// # Errors
/// Returns [Error::InvalidTimestamp] if `text` is not a valid compact timestamp.
pub fn parse_compact_timestamp(text: &str, offset: UtcOffset) -> Result<OffsetDateTime, Error> {
    let text = text.trim();

    if text.len() != 14 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidTimestamp(text.to_owned()));
    }

    PrimitiveDateTime::parse(text, COMPACT_FORMAT)
        .map(|datetime| datetime.assume_offset(offset))
        .map_err(|_| Error::InvalidTimestamp(text.to_owned()))
}
