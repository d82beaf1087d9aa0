//! Filesystem-backed object storage.
//!
//! Objects live at `<root>/<bucket>/<key>`; metadata sidecars at
//! `<root>/.meta/<bucket>/<key>.json`. All filesystem work goes through
//! `tokio::fs` or a blocking task so the event loop never stalls on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use nimbus_core::EmulatorError;

/// Sidecar metadata for one stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_type: String,
    /// MD5 of the body, unquoted.
    pub etag: String,
    pub size: u64,
    /// RFC 3339 timestamp.
    pub last_modified: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A retrieved object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub meta: ObjectMetadata,
}

/// One entry of a listing page.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: String,
}

/// One page of a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectListing {
    pub contents: Vec<ObjectSummary>,
    pub is_truncated: bool,
    pub next_token: Option<String>,
}

/// Low-level file-tree storage shared by every bucket provider instance.
#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn metadata_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root
            .join(".meta")
            .join(bucket)
            .join(format!("{key}.json"))
    }

    fn validate(bucket: &str, key: &str) -> Result<(), EmulatorError> {
        if bucket.is_empty() || bucket.starts_with('.') || bucket.contains('/') {
            return Err(EmulatorError::Validation(format!(
                "invalid bucket name: {bucket}"
            )));
        }
        if key.is_empty() || key.split('/').any(|segment| segment == "..") {
            return Err(EmulatorError::Validation(format!("invalid object key: {key}")));
        }
        Ok(())
    }

    /// Store an object and its metadata sidecar. Returns the new metadata.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectMetadata, EmulatorError> {
        Self::validate(bucket, key)?;
        let meta = ObjectMetadata {
            content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            etag: format!("{:x}", md5::compute(&body)),
            size: body.len() as u64,
            last_modified: chrono::Utc::now().to_rfc3339(),
            metadata,
        };

        let object_path = self.object_path(bucket, key);
        let metadata_path = self.metadata_path(bucket, key);
        write_file(&object_path, body).await?;
        write_file(&metadata_path, serde_json::to_vec(&meta)?).await?;
        Ok(meta)
    }

    /// Retrieve an object with its metadata, or `None` if absent.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<StoredObject>, EmulatorError> {
        Self::validate(bucket, key)?;
        let object_path = self.object_path(bucket, key);
        let body = match tokio::fs::read(&object_path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta = self.read_metadata(bucket, key, body.len() as u64).await;
        Ok(Some(StoredObject { body, meta }))
    }

    /// Metadata only, without reading the body.
    pub async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMetadata>, EmulatorError> {
        Self::validate(bucket, key)?;
        let object_path = self.object_path(bucket, key);
        let len = match tokio::fs::metadata(&object_path).await {
            Ok(stat) => stat.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(self.read_metadata(bucket, key, len).await))
    }

    /// Delete an object and its sidecar. Returns whether it existed.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, EmulatorError> {
        Self::validate(bucket, key)?;
        let object_path = self.object_path(bucket, key);
        let existed = match tokio::fs::remove_file(&object_path).await {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        let _ = tokio::fs::remove_file(self.metadata_path(bucket, key)).await;
        Ok(existed)
    }

    /// List keys under a prefix, lexicographic, paginated. The continuation
    /// token is the last key of the previous (truncated) page.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
        continuation_token: Option<&str>,
    ) -> Result<ObjectListing, EmulatorError> {
        if bucket.is_empty() || bucket.starts_with('.') {
            return Err(EmulatorError::Validation(format!(
                "invalid bucket name: {bucket}"
            )));
        }
        let bucket_dir = self.root.join(bucket);
        let prefix = prefix.to_string();
        let mut keys = tokio::task::spawn_blocking(move || collect_keys(&bucket_dir, &prefix))
            .await
            .map_err(|err| EmulatorError::Internal(format!("listing task failed: {err}")))??;
        keys.sort();

        if let Some(token) = continuation_token {
            keys.retain(|k| k.as_str() > token);
        }

        let is_truncated = keys.len() > max_keys;
        keys.truncate(max_keys);
        let next_token = if is_truncated {
            keys.last().cloned()
        } else {
            None
        };

        let mut contents = Vec::with_capacity(keys.len());
        for key in keys {
            let meta = self.read_metadata(bucket, &key, 0).await;
            contents.push(ObjectSummary {
                key,
                size: meta.size,
                etag: meta.etag,
                last_modified: meta.last_modified,
            });
        }

        Ok(ObjectListing {
            contents,
            is_truncated,
            next_token,
        })
    }

    /// Remove everything stored for a bucket.
    pub async fn reset_bucket(&self, bucket: &str) -> Result<(), EmulatorError> {
        let _ = tokio::fs::remove_dir_all(self.root.join(bucket)).await;
        let _ = tokio::fs::remove_dir_all(self.root.join(".meta").join(bucket)).await;
        Ok(())
    }

    async fn read_metadata(&self, bucket: &str, key: &str, fallback_size: u64) -> ObjectMetadata {
        let path = self.metadata_path(bucket, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(bucket, key, %err, "corrupt metadata sidecar");
                default_metadata(fallback_size)
            }),
            Err(_) => default_metadata(fallback_size),
        }
    }
}

fn default_metadata(size: u64) -> ObjectMetadata {
    ObjectMetadata {
        content_type: "application/octet-stream".to_string(),
        etag: String::new(),
        size,
        last_modified: String::new(),
        metadata: HashMap::new(),
    }
}

async fn write_file(path: &Path, data: Vec<u8>) -> Result<(), EmulatorError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// Walk the bucket directory collecting keys that match the prefix.
fn collect_keys(bucket_dir: &Path, prefix: &str) -> Result<Vec<String>, EmulatorError> {
    let mut keys = Vec::new();
    if !bucket_dir.exists() {
        return Ok(keys);
    }
    let mut pending = vec![bucket_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(bucket_dir) {
                let key = relative.to_string_lossy().replace('\\', "/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path().join("obj"));
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_round_trip_with_etag() {
        let (_dir, store) = store();
        let meta = store
            .put_object(
                "photos",
                "cats/a.jpg",
                b"jpeg-bytes".to_vec(),
                Some("image/jpeg".to_string()),
                HashMap::from([("owner".to_string(), "me".to_string())]),
            )
            .await
            .unwrap();
        assert_eq!(meta.etag, format!("{:x}", md5::compute(b"jpeg-bytes")));

        let object = store.get_object("photos", "cats/a.jpg").await.unwrap().unwrap();
        assert_eq!(object.body, b"jpeg-bytes");
        assert_eq!(object.meta.content_type, "image/jpeg");
        assert_eq!(object.meta.metadata["owner"], "me");
        assert_eq!(object.meta.size, 10);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.get_object("photos", "nope").await.unwrap().is_none());
        assert!(store.head_object("photos", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_object_and_sidecar() {
        let (_dir, store) = store();
        store
            .put_object("b", "k", b"x".to_vec(), None, HashMap::new())
            .await
            .unwrap();
        assert!(store.delete_object("b", "k").await.unwrap());
        assert!(!store.delete_object("b", "k").await.unwrap());
        assert!(store.get_object("b", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_filters_sorts_and_paginates() {
        let (_dir, store) = store();
        for key in ["logs/2.txt", "logs/1.txt", "logs/3.txt", "other/x"] {
            store
                .put_object("b", key, b"data".to_vec(), None, HashMap::new())
                .await
                .unwrap();
        }

        let page1 = store.list_objects("b", "logs/", 2, None).await.unwrap();
        assert!(page1.is_truncated);
        let keys: Vec<_> = page1.contents.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["logs/1.txt", "logs/2.txt"]);

        let token = page1.next_token.unwrap();
        let page2 = store.list_objects("b", "logs/", 2, Some(&token)).await.unwrap();
        assert!(!page2.is_truncated);
        let keys: Vec<_> = page2.contents.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["logs/3.txt"]);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_dir, store) = store();
        let err = store
            .put_object("b", "../escape", b"x".to_vec(), None, HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(store.get_object(".meta", "k").await.is_err());
    }

    #[tokio::test]
    async fn reset_bucket_clears_everything() {
        let (_dir, store) = store();
        store
            .put_object("b", "k", b"x".to_vec(), None, HashMap::new())
            .await
            .unwrap();
        store.reset_bucket("b").await.unwrap();
        assert!(store.get_object("b", "k").await.unwrap().is_none());
        let listing = store.list_objects("b", "", 10, None).await.unwrap();
        assert!(listing.contents.is_empty());
    }
}
