//! Column encodings shared by the SQL repositories.
//!
//! Timestamps are stored as fixed-width RFC 3339 text in UTC so that SQL string comparison
//! orders them chronologically.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::RepositoryError;

pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn encode_optional_timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(encode_timestamp)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_optional_date(
    column: &str,
    value: Option<String>,
) -> Result<Option<NaiveDate>, RepositoryError> {
    value
        .map(|date| {
            NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|error| {
                RepositoryError::Decode(format!("invalid date in `{column}`: `{date}` ({error})"))
            })
        })
        .transpose()
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_u8(column: &str, value: i64) -> Result<u8, RepositoryError> {
    u8::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("invalid value for `{column}` (expected 0-255): {value}"))
    })
}

pub(crate) fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(&value).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_optional_decimal(
    column: &str,
    value: Option<String>,
) -> Result<Option<Decimal>, RepositoryError> {
    value.map(|decimal| parse_decimal(column, decimal)).transpose()
}

pub(crate) fn encode_json<T: Serialize + ?Sized>(
    column: &str,
    value: &T,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode `{column}`: {error}")))
}

pub(crate) fn decode_json<T: DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn parse_enum<T>(
    column: &str,
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    parse(value)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown value in `{column}`: `{value}`")))
}
