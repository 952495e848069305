//! Payload encoding for job descriptors.

use super::JobDescriptor;
use crate::error::EncodeError;

/// Serializes job descriptors to and from queue message bodies.
pub trait Encoder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn encode(&self, job: &JobDescriptor) -> Result<Vec<u8>, EncodeError>;

    fn decode(&self, body: &[u8]) -> Result<JobDescriptor, EncodeError>;
}

/// Default encoder: a JSON object `{"class": ..., "args": [...], "options": {...}}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, job: &JobDescriptor) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(job).map_err(|e| EncodeError::Encode(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<JobDescriptor, EncodeError> {
        let job: JobDescriptor =
            serde_json::from_slice(body).map_err(|e| EncodeError::Malformed(e.to_string()))?;
        if job.class_name.trim().is_empty() {
            return Err(EncodeError::Malformed("empty job class".to_string()));
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_encode_shape() {
        let job = JobDescriptor::new("SendEmail", vec![json!("a@example.com"), json!(3)])
            .with_timeout(Duration::from_millis(1500));

        let body = JsonEncoder.encode(&job).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["class"], "SendEmail");
        assert_eq!(value["args"], json!(["a@example.com", 3]));
        assert_eq!(value["options"]["timeout"], json!(1.5));
    }

    #[test]
    fn test_decode_without_options() {
        let job = JsonEncoder
            .decode(br#"{"class":"Echo","args":[1,"two"]}"#)
            .unwrap();

        assert_eq!(job.class_name, "Echo");
        assert_eq!(job.args, vec![json!(1), json!("two")]);
        assert!(job.timeout().is_none());
        assert!(job.options.queue_name.is_none());
    }

    #[test]
    fn test_decode_malformed() {
        let bodies: [&[u8]; 4] = [
            b"not json",
            br#"{"args":[]}"#,
            br#"{"class":"  ","args":[]}"#,
            b"",
        ];
        for body in bodies {
            let err = JsonEncoder.decode(body).unwrap_err();
            assert!(matches!(err, EncodeError::Malformed(_)), "body {:?}", body);
        }
    }
}
