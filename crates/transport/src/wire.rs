//! JSON bodies exchanged with the sync endpoint.

use mcpsync_core::ResourceData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub upserts: Vec<ResourceData>,
    pub deletes: Vec<String>,
    pub is_resync: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCounts {
    #[serde(default)]
    pub upserted: u64,
    #[serde(default)]
    pub deleted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetails {
    #[serde(default)]
    pub upserted: u64,
    #[serde(default)]
    pub deleted: u64,
    #[serde(default)]
    pub failures: Vec<SyncFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FailureDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SyncCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncErrorBody>,
}

impl SyncResponse {
    fn details(&self) -> Option<&FailureDetails> { self.error.as_ref().and_then(|e| e.details.as_ref()) }

    /// Items the receiver accepted as upserts, whether or not the batch fully succeeded.
    pub fn upserted(&self) -> u64 {
        self.data.as_ref().map(|d| d.upserted).or_else(|| self.details().map(|d| d.upserted)).unwrap_or(0)
    }

    pub fn deleted(&self) -> u64 {
        self.data.as_ref().map(|d| d.deleted).or_else(|| self.details().map(|d| d.deleted)).unwrap_or(0)
    }

    pub fn get_failures(&self) -> &[SyncFailure] {
        self.details().map(|d| d.failures.as_slice()).unwrap_or(&[])
    }

    pub fn has_partial_failures(&self) -> bool { !self.get_failures().is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_and_partial_shapes() {
        let ok: SyncResponse = serde_json::from_str(r#"{"success":true,"data":{"upserted":3,"deleted":1}}"#).unwrap();
        assert!(ok.success);
        assert_eq!((ok.upserted(), ok.deleted()), (3, 1));
        assert!(ok.get_failures().is_empty());

        let partial: SyncResponse = serde_json::from_str(
            r#"{"success":false,"error":{"code":"PARTIAL","message":"some failed",
                "details":{"upserted":2,"deleted":0,"failures":[{"id":"ns:v1:Pod:a","error":"too large"}]}}}"#,
        )
        .unwrap();
        assert!(partial.has_partial_failures());
        assert_eq!(partial.upserted(), 2);
        assert_eq!(partial.get_failures()[0].id, "ns:v1:Pod:a");

        let failed: SyncResponse = serde_json::from_str(r#"{"success":false,"error":{"code":"INTERNAL","message":"db down"}}"#).unwrap();
        assert!(!failed.has_partial_failures());
        assert_eq!(failed.upserted(), 0);
    }

    #[test]
    fn request_uses_camel_case_flag() {
        let body = serde_json::to_value(SyncRequest { is_resync: true, ..Default::default() }).unwrap();
        assert_eq!(body["isResync"], serde_json::Value::Bool(true));
        assert!(body["deletes"].as_array().unwrap().is_empty());
    }
}
