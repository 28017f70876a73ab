use chrono::{DateTime, SecondsFormat, Utc};

use crate::{NimbusError, NimbusResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Formats a time the way the catalog stores it.
pub fn db_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp written by [`db_timestamp`].
pub fn parse_db_timestamp(value: &str) -> NimbusResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(NimbusError::custom)
}
