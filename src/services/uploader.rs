//! Object-storage upload of backup artifacts.
//!
//! Keys are date-partitioned under `backups/`, objects are uploaded with a
//! public-read ACL, and object expiry is left to the bucket's lifecycle
//! rules. Transport failures never escape the component; `upload` reports
//! them inside its `UploadResult` and `remove` is best-effort.

use crate::config::AppConfig;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, NaiveDate, Utc};
use std::path::Path;

/// Outcome of one upload attempt.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub success: bool,
    pub url: Option<String>,
    pub key: Option<String>,
    pub error: Option<String>,
}

impl UploadResult {
    fn ok(url: String, key: String) -> Self {
        Self {
            success: true,
            url: Some(url),
            key: Some(key),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            url: None,
            key: None,
            error: Some(error),
        }
    }
}

/// One stored artifact as returned by `list_artifacts`.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub file_name: String,
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub url: String,
    pub checksum: Option<String>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, local_path: &Path) -> UploadResult;

    /// Best-effort delete; failures are logged, never propagated.
    async fn remove(&self, key: &str);

    /// Everything under the `backups/` prefix, newest first. An empty
    /// bucket yields an empty list, not an error.
    async fn list_artifacts(&self) -> anyhow::Result<Vec<ArtifactInfo>>;
}

/// Object key for an artifact uploaded today: `backups/<date>/<file name>`.
pub fn object_key(file_name: &str, date: NaiveDate) -> String {
    format!("backups/{}/{}", date.format("%Y-%m-%d"), file_name)
}

/// Content type from the file extension. Total: unknown extensions map to
/// the generic binary type.
pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("gz") => "application/gzip",
        Some("br") => "application/brotli",
        _ => "application/octet-stream",
    }
}

/// Flatten one listed object into an `ArtifactInfo`. Negative sizes from
/// the wire clamp to zero; the ETag's surrounding quotes are stripped.
fn artifact_info(
    key: &str,
    size: i64,
    last_modified: Option<DateTime<Utc>>,
    e_tag: Option<&str>,
    url: String,
) -> ArtifactInfo {
    ArtifactInfo {
        file_name: key.rsplit('/').next().unwrap_or(key).to_string(),
        key: key.to_string(),
        size: size.max(0) as u64,
        last_modified,
        url,
        checksum: e_tag.map(|t| t.trim_matches('"').to_string()),
    }
}

/// Newest first; artifacts without a timestamp sort last.
fn sort_newest_first(artifacts: &mut [ArtifactInfo]) {
    artifacts.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
}

/// Continuation token for the next listing page. A truncated page without
/// a token ends the walk rather than refetching the first page.
fn next_page_token(is_truncated: bool, token: Option<&str>) -> Option<String> {
    if is_truncated {
        token.map(String::from)
    } else {
        None
    }
}

pub struct S3Store {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3Store {
    pub async fn new(config: &AppConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.aws_region.clone()));

        // Custom endpoint for S3-compatible services like MinIO
        if let Some(endpoint) = &config.s3_endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        Self {
            client: S3Client::new(&sdk_config),
            bucket: config.s3_bucket.clone(),
            region: config.aws_region.clone(),
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("https://{}.s3.{}.amazonaws.com/{key}", self.bucket, self.region)
    }

    /// Cheap reachability probe used at startup.
    pub async fn test_connection(&self) -> bool {
        match self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
        {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, "S3 connection test successful");
                true
            }
            Err(e) => {
                tracing::error!(bucket = %self.bucket, error = %e, "S3 connection test failed");
                false
            }
        }
    }

    async fn upload_inner(&self, local_path: &Path) -> anyhow::Result<(String, String)> {
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("invalid artifact path: {}", local_path.display()))?;
        let key = object_key(file_name, Utc::now().date_naive());

        tracing::info!(file = %local_path.display(), bucket = %self.bucket, key = %key, "Uploading to S3");

        let body = ByteStream::from_path(local_path).await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .acl(ObjectCannedAcl::PublicRead)
            .content_type(content_type_for(local_path))
            .send()
            .await?;

        let url = self.public_url(&key);
        tracing::info!(url = %url, "S3 upload complete");
        Ok((url, key))
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn upload(&self, local_path: &Path) -> UploadResult {
        match self.upload_inner(local_path).await {
            Ok((url, key)) => UploadResult::ok(url, key),
            Err(e) => {
                tracing::error!(file = %local_path.display(), error = %e, "S3 upload failed");
                UploadResult::failed(e.to_string())
            }
        }
    }

    async fn remove(&self, key: &str) {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => tracing::info!(key = %key, "Deleted S3 object"),
            Err(e) => tracing::warn!(key = %key, error = %e, "S3 delete failed"),
        }
    }

    async fn list_artifacts(&self) -> anyhow::Result<Vec<ArtifactInfo>> {
        let mut artifacts = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix("backups/");
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let output = request.send().await?;
            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()));
                artifacts.push(artifact_info(
                    key,
                    object.size().unwrap_or(0),
                    last_modified,
                    object.e_tag(),
                    self.public_url(key),
                ));
            }

            continuation_token = next_page_token(
                output.is_truncated().unwrap_or(false),
                output.next_continuation_token(),
            );
            if continuation_token.is_none() {
                break;
            }
        }

        sort_newest_first(&mut artifacts);
        tracing::debug!(count = artifacts.len(), "Listed S3 backups");
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_object_key_is_date_partitioned() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(
            object_key("dump.tar.gz", date),
            "backups/2024-05-01/dump.tar.gz"
        );
    }

    #[test]
    fn test_content_type_mapping_is_total() {
        assert_eq!(content_type_for(Path::new("a.json")), "application/json");
        assert_eq!(content_type_for(Path::new("a.tar.gz")), "application/gzip");
        assert_eq!(content_type_for(Path::new("a.tar.br")), "application/brotli");
        assert_eq!(
            content_type_for(Path::new("a.zip")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for(Path::new("no_extension")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_content_type_uses_final_extension() {
        let path = PathBuf::from("nightscout-backup-2024-05-01.json.br");
        assert_eq!(content_type_for(&path), "application/brotli");
    }

    fn listed(key: &str, day: Option<u32>) -> ArtifactInfo {
        let last_modified = day.map(|d| {
            NaiveDate::from_ymd_opt(2024, 5, d)
                .unwrap()
                .and_hms_opt(2, 0, 0)
                .unwrap()
                .and_utc()
        });
        artifact_info(
            key,
            128,
            last_modified,
            Some("\"abc123\""),
            format!("https://bucket.s3.us-east-1.amazonaws.com/{key}"),
        )
    }

    #[test]
    fn test_artifact_info_splits_file_name_and_trims_etag() {
        let info = listed("backups/2024-05-01/dump.tar.gz", Some(1));
        assert_eq!(info.file_name, "dump.tar.gz");
        assert_eq!(info.key, "backups/2024-05-01/dump.tar.gz");
        assert_eq!(info.checksum.as_deref(), Some("abc123"));

        // Keys without a separator are their own file name
        assert_eq!(listed("loose-object", Some(1)).file_name, "loose-object");
    }

    #[test]
    fn test_artifact_info_clamps_negative_size() {
        let info = artifact_info("backups/x", -1, None, None, String::new());
        assert_eq!(info.size, 0);
        assert!(info.checksum.is_none());
    }

    #[test]
    fn test_sort_newest_first() {
        let mut artifacts = vec![
            listed("backups/2024-05-01/a.tar.gz", Some(1)),
            listed("backups/2024-05-03/c.tar.gz", Some(3)),
            listed("backups/unknown/d.tar.gz", None),
            listed("backups/2024-05-02/b.tar.gz", Some(2)),
        ];
        sort_newest_first(&mut artifacts);

        let keys: Vec<&str> = artifacts.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "backups/2024-05-03/c.tar.gz",
                "backups/2024-05-02/b.tar.gz",
                "backups/2024-05-01/a.tar.gz",
                "backups/unknown/d.tar.gz",
            ]
        );
    }

    #[test]
    fn test_sort_newest_first_empty() {
        let mut artifacts: Vec<ArtifactInfo> = Vec::new();
        sort_newest_first(&mut artifacts);
        assert!(artifacts.is_empty());
    }

    #[test]
    fn test_next_page_token_stops_without_token() {
        assert_eq!(next_page_token(true, Some("t1")), Some("t1".to_string()));
        // Truncated but token missing: stop instead of refetching page one
        assert_eq!(next_page_token(true, None), None);
        assert_eq!(next_page_token(false, Some("t1")), None);
    }
}
