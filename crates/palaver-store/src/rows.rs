//! Column decoding shared by the row mappers.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use uuid::Uuid;

use palaver_shared::{MessageId, RequestId, UserId};

pub(crate) fn uuid_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn user_id_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<UserId> {
    uuid_at(row, idx).map(UserId)
}

pub(crate) fn message_id_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<MessageId> {
    uuid_at(row, idx).map(MessageId)
}

pub(crate) fn request_id_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<RequestId> {
    uuid_at(row, idx).map(RequestId)
}

pub(crate) fn timestamp_at(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug)]
struct BadEnum(String);

impl std::fmt::Display for BadEnum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unexpected value {:?}", self.0)
    }
}

impl std::error::Error for BadEnum {}

/// Decode a text column through `parse`, failing the row on unknown values.
pub(crate) fn enum_at<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(BadEnum(raw)))
    })
}
