//! Row normalization
//!
//! Turns a raw CSV row (every value is text) into a typed [`NormalizedRecord`].
//! Pure and deterministic; no I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// One source row: column name -> cell text
pub type RawRecord = HashMap<String, String>;

/// Source column names
pub mod columns {
    pub const DATETIME: &str = "datetime";
    pub const VEHICLE: &str = "vehicle";
    pub const LNG: &str = "lng";
    pub const LAT: &str = "lat";
    pub const SPEED: &str = "speed";
    pub const DRIVER: &str = "driver";
    pub const DOOR_UP: &str = "door_up";
    pub const DOOR_DOWN: &str = "door_down";

    /// Every column the normalizer reads
    pub const ALL: [&str; 8] = [DATETIME, VEHICLE, LNG, LAT, SPEED, DRIVER, DOOR_UP, DOOR_DOWN];
}

/// Text that a boolean column must equal (ignoring case) to be `true`
pub const TRUE_TOKEN: &str = "true";

/// A typed vehicle position report.
///
/// Serialized with the source column names so the published payload keeps the
/// shape downstream consumers already read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Source timestamp, format preserved
    #[serde(rename = "datetime")]
    pub timestamp: String,

    /// Vehicle identifier; also the partition key
    #[serde(rename = "vehicle")]
    pub entity_id: String,

    #[serde(rename = "lng")]
    pub longitude: Option<f64>,

    #[serde(rename = "lat")]
    pub latitude: Option<f64>,

    pub speed: Option<f64>,

    /// Parsed as a number, like the source feed does
    #[serde(rename = "driver")]
    pub driver_code: Option<f64>,

    #[serde(rename = "door_up")]
    pub flag_a: bool,

    #[serde(rename = "door_down")]
    pub flag_b: bool,
}

/// Why a row could not be normalized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is not a number: '{value}'")]
    BadNumber { field: &'static str, value: String },
}

/// Normalize one raw row.
pub fn normalize(raw: &RawRecord) -> Result<NormalizedRecord, NormalizationError> {
    Ok(NormalizedRecord {
        timestamp: required(raw, columns::DATETIME)?,
        entity_id: required(raw, columns::VEHICLE)?,
        longitude: number(raw, columns::LNG)?,
        latitude: number(raw, columns::LAT)?,
        speed: number(raw, columns::SPEED)?,
        driver_code: number(raw, columns::DRIVER)?,
        flag_a: flag(raw, columns::DOOR_UP),
        flag_b: flag(raw, columns::DOOR_DOWN),
    })
}

fn required(raw: &RawRecord, field: &'static str) -> Result<String, NormalizationError> {
    raw.get(field)
        .cloned()
        .ok_or(NormalizationError::MissingField(field))
}

fn number(raw: &RawRecord, field: &'static str) -> Result<Option<f64>, NormalizationError> {
    match raw.get(field).map(|v| v.trim()) {
        None | Some("") => Ok(None),
        // NaN and infinities parse but have no JSON form
        Some(text) => text
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(Some)
            .ok_or_else(|| NormalizationError::BadNumber {
                field,
                value: text.to_string(),
            }),
    }
}

// Anything other than the true token is false, including typos like "yes" or "1".
fn flag(raw: &RawRecord, field: &str) -> bool {
    raw.get(field)
        .is_some_and(|v| v.eq_ignore_ascii_case(TRUE_TOKEN))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_row() -> RawRecord {
        row(&[
            ("datetime", "2024-03-01 07:15:02"),
            ("vehicle", "51B-123.45"),
            ("lng", "106.7009"),
            ("lat", "10.7769"),
            ("speed", "32.5"),
            ("driver", "1042"),
            ("door_up", "False"),
            ("door_down", "TRUE"),
        ])
    }

    #[test]
    fn test_normalize_full_row() {
        let record = normalize(&full_row()).unwrap();

        assert_eq!(record.timestamp, "2024-03-01 07:15:02");
        assert_eq!(record.entity_id, "51B-123.45");
        assert_eq!(record.longitude, Some(106.7009));
        assert_eq!(record.latitude, Some(10.7769));
        assert_eq!(record.speed, Some(32.5));
        assert_eq!(record.driver_code, Some(1042.0));
        assert!(!record.flag_a);
        assert!(record.flag_b);
    }

    #[test]
    fn test_empty_latitude_is_null() {
        let mut raw = full_row();
        raw.insert("lat".into(), String::new());
        raw.insert("lng".into(), "10.5".into());

        let record = normalize(&raw).unwrap();
        assert_eq!(record.latitude, None);
        assert_eq!(record.longitude, Some(10.5));
    }

    #[test]
    fn test_missing_numeric_columns_are_null() {
        let raw = row(&[("datetime", "t"), ("vehicle", "v1")]);
        let record = normalize(&raw).unwrap();

        assert_eq!(record.longitude, None);
        assert_eq!(record.latitude, None);
        assert_eq!(record.speed, None);
        assert_eq!(record.driver_code, None);
        assert!(!record.flag_a);
        assert!(!record.flag_b);
    }

    #[test]
    fn test_missing_vehicle_is_error() {
        let mut raw = full_row();
        raw.remove("vehicle");
        assert_eq!(
            normalize(&raw),
            Err(NormalizationError::MissingField("vehicle"))
        );
    }

    #[test]
    fn test_missing_datetime_is_error() {
        let mut raw = full_row();
        raw.remove("datetime");
        assert_eq!(
            normalize(&raw),
            Err(NormalizationError::MissingField("datetime"))
        );
    }

    #[test]
    fn test_bad_number_names_field() {
        let mut raw = full_row();
        raw.insert("speed".into(), "fast".into());

        match normalize(&raw) {
            Err(NormalizationError::BadNumber { field, value }) => {
                assert_eq!(field, "speed");
                assert_eq!(value, "fast");
            }
            other => panic!("expected BadNumber, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_numbers_rejected() {
        for (field, text) in [("speed", "NaN"), ("lat", "inf"), ("lng", "-infinity")] {
            let mut raw = full_row();
            raw.insert(field.into(), text.into());
            assert_eq!(
                normalize(&raw),
                Err(NormalizationError::BadNumber {
                    field,
                    value: text.to_string(),
                }),
                "input {:?}",
                text
            );
        }
    }

    #[test]
    fn test_flag_parsing() {
        for (text, expected) in [
            ("TRUE", true),
            ("True", true),
            ("true", true),
            ("1", false),
            ("", false),
            ("yes", false),
        ] {
            let mut raw = full_row();
            raw.insert("door_up".into(), text.into());
            assert_eq!(normalize(&raw).unwrap().flag_a, expected, "input {:?}", text);
        }

        let mut raw = full_row();
        raw.remove("door_up");
        assert!(!normalize(&raw).unwrap().flag_a);
    }

    #[test]
    fn test_serializes_with_source_column_names() {
        let record = normalize(&full_row()).unwrap();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["vehicle"], "51B-123.45");
        assert_eq!(json["lat"], 10.7769);
        assert_eq!(json["door_down"], true);
        assert!(json.get("entity_id").is_none());
    }

    proptest! {
        #[test]
        fn prop_empty_numerics_never_fail(ts in ".*", vehicle in ".*") {
            let raw = row(&[
                ("datetime", &ts),
                ("vehicle", &vehicle),
                ("lng", ""),
                ("lat", ""),
                ("speed", ""),
                ("driver", ""),
            ]);
            let record = normalize(&raw).unwrap();
            prop_assert_eq!(record.longitude, None);
            prop_assert_eq!(record.latitude, None);
            prop_assert_eq!(record.speed, None);
            prop_assert_eq!(record.driver_code, None);
            prop_assert_eq!(record.timestamp, ts);
            prop_assert_eq!(record.entity_id, vehicle);
        }

        #[test]
        fn prop_missing_vehicle_always_errors(ts in ".*", lat in "[0-9]{1,3}\\.[0-9]{1,6}") {
            let raw = row(&[("datetime", &ts), ("lat", &lat)]);
            prop_assert_eq!(normalize(&raw), Err(NormalizationError::MissingField("vehicle")));
        }

        #[test]
        fn prop_flag_is_case_insensitive(mask in proptest::collection::vec(any::<bool>(), 4)) {
            let token: String = TRUE_TOKEN
                .chars()
                .zip(mask)
                .map(|(c, upper)| if upper { c.to_ascii_uppercase() } else { c })
                .collect();
            let raw = row(&[("datetime", "t"), ("vehicle", "v"), ("door_down", &token)]);
            prop_assert!(normalize(&raw).unwrap().flag_b);
        }

        #[test]
        fn prop_finite_numbers_round_trip(value in -1.0e6f64..1.0e6) {
            let text = value.to_string();
            let raw = row(&[("datetime", "t"), ("vehicle", "v"), ("speed", &text)]);
            prop_assert_eq!(normalize(&raw).unwrap().speed, Some(value));
        }
    }
}
