//! Payload encoding

use crate::record::NormalizedRecord;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to encode record: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Serializes a record into the bytes published to the log.
pub trait PayloadEncoder {
    fn encode(&self, record: &NormalizedRecord) -> Result<Vec<u8>, EncodeError>;
}

/// Compact JSON, one object per message
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl PayloadEncoder for JsonEncoder {
    fn encode(&self, record: &NormalizedRecord) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(record)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_json_payload_shape() {
        let record = NormalizedRecord {
            timestamp: "2024-03-01 07:15:02".into(),
            entity_id: "51B-001".into(),
            longitude: Some(106.7),
            latitude: None,
            speed: Some(0.0),
            driver_code: None,
            flag_a: true,
            flag_b: false,
        };

        let payload = JsonEncoder.encode(&record).unwrap();
        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"datetime":"2024-03-01 07:15:02","vehicle":"51B-001","lng":106.7,"lat":null,"speed":0.0,"driver":null,"door_up":true,"door_down":false}"#
        );
    }
}
