use serde::{Deserialize, Serialize};

use dirpack_core::{DownloadHandleId, JobId, OwnerId};
use dirpack_quota::OwnerKey;

/// Queue payload: everything a worker needs to run a job without reading
/// the submission request again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub source_folder_relative_path: String,
    pub source_folder_absolute_path: String,
    pub owner_id: OwnerId,
    pub job_record_id: JobId,
    pub download_handle_id: DownloadHandleId,
    pub source_size_bytes: u64,
    pub quota_account_key: OwnerKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_key: Option<String>,
}

/// One delivery of a queued message to a consumer.
///
/// The same `queue_job_id` can be delivered more than once (lease expiry);
/// `attempt` counts deliveries starting at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue_job_id: String,
    pub message: JobMessage,
    pub attempt: u32,
    pub lease_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_camel_case_keys() {
        let msg = JobMessage {
            source_folder_relative_path: "/music/album".into(),
            source_folder_absolute_path: "/srv/catalog/music/album".into(),
            owner_id: OwnerId::new(),
            job_record_id: JobId::new(),
            download_handle_id: DownloadHandleId::new(),
            source_size_bytes: 42,
            quota_account_key: OwnerKey::new("acct:regular").unwrap(),
            version_key: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        for key in [
            "sourceFolderRelativePath",
            "sourceFolderAbsolutePath",
            "ownerId",
            "jobRecordId",
            "downloadHandleId",
            "sourceSizeBytes",
            "quotaAccountKey",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json.get("versionKey").is_none());
        assert_eq!(serde_json::from_value::<JobMessage>(json).unwrap(), msg);
    }
}
