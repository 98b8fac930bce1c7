#![forbid(unsafe_code)]

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn ts_ms_to_rfc3339(ts_ms: i64) -> String {
    let nanos = (ts_ms as i128) * 1_000_000i128;
    let dt = OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    dt.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// RFC 3339 stamp with the characters file systems dislike replaced.
pub(crate) fn file_stamp(ts_ms: i64) -> String {
    ts_ms_to_rfc3339(ts_ms)
        .chars()
        .map(|ch| if ch == ':' { '-' } else { ch })
        .collect()
}
