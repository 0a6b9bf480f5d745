//! The payloads handed stage to stage. One type per queue hop, camelCase on
//! the wire; each carries only what the next stage needs to resume work,
//! never the full job record.

use common::error::AppError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Client submission consumed by the intake stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub repo_url: String,
    pub user_id: String,
}

/// Intake -> clone handoff. Every post-intake payload carries the job id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    pub job_id: String,
    pub repo_url: String,
}

/// Clone -> security handoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloneComplete {
    pub job_id: String,
    pub clone_dir: String,
}

/// Security -> complexity handoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityScanComplete {
    pub job_id: String,
}

pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(payload).map_err(|e| AppError::InvalidPayload(e.to_string()))
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, AppError> {
    Ok(serde_json::to_vec(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_keys_are_camel_case() {
        let message = CloneComplete {
            job_id: "j1".to_string(),
            clone_dir: "./data/repos/j1".to_string(),
        };
        let encoded = encode_message(&message).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&encoded).expect("json");

        assert_eq!(value["jobId"], "j1");
        assert_eq!(value["cloneDir"], "./data/repos/j1");
    }

    #[test]
    fn decode_round_trips_each_hop() {
        let request = AnalysisRequest {
            repo_url: "https://example.com/r.git".to_string(),
            user_id: "u1".to_string(),
        };
        let decoded: AnalysisRequest =
            decode_message(&encode_message(&request).expect("encode")).expect("decode");
        assert_eq!(decoded, request);

        let decoded: SecurityScanComplete =
            decode_message(br#"{"jobId":"j9"}"#).expect("decode");
        assert_eq!(decoded.job_id, "j9");
    }

    #[test]
    fn missing_fields_are_an_invalid_payload() {
        let err = decode_message::<CloneRequest>(br#"{"jobId":"j1"}"#)
            .expect_err("missing repoUrl should fail");
        assert!(matches!(err, AppError::InvalidPayload(_)));

        let err = decode_message::<AnalysisRequest>(b"not json at all")
            .expect_err("garbage should fail");
        assert!(matches!(err, AppError::InvalidPayload(_)));
    }
}
