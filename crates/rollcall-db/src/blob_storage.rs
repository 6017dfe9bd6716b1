//! Content-addressed image storage.
//!
//! Register photos are stored once per distinct content. The reference handed
//! back to callers is the BLAKE3 content hash (`blake3:<hex>`); the on-disk path
//! is derived from it: `{base_path}/blobs/{hex[0..2]}/{hex[2..4]}/{hex}.bin`.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rollcall_core::{BlobStore, Error, Result};

const HASH_PREFIX: &str = "blake3:";

/// Compute the content reference for a byte slice.
pub fn compute_content_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}{}", HASH_PREFIX, hash.to_hex())
}

/// Validate a reference and return its hex digest.
fn digest_of(reference: &str) -> Result<&str> {
    let hex_part = reference
        .strip_prefix(HASH_PREFIX)
        .ok_or_else(|| Error::InvalidInput(format!("unsupported image reference: {}", reference)))?;
    if hex_part.len() != 64 || hex::decode(hex_part).is_err() {
        return Err(Error::InvalidInput(format!(
            "malformed image reference: {}",
            reference
        )));
    }
    Ok(hex_part)
}

/// Relative storage path for a reference.
pub fn storage_path(reference: &str) -> Result<String> {
    let digest = digest_of(reference)?;
    Ok(format!("blobs/{}/{}/{}.bin", &digest[0..2], &digest[2..4], digest))
}

/// Filesystem-backed blob store.
pub struct FilesystemBlobStore {
    base_path: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Write, read back, and remove a check file so misconfigured volumes
    /// fail at startup instead of on the first upload.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        let check_dir = self.base_path.join("blobs/.health-check");
        let check_file = check_dir.join("check.bin");
        let data = b"rollcall-storage-check";

        fs::create_dir_all(&check_dir)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", check_dir, e))?;
        fs::write(&check_file, data)
            .await
            .map_err(|e| format!("write({:?}): {}", check_file, e))?;
        let read_back = fs::read(&check_file)
            .await
            .map_err(|e| format!("read({:?}): {}", check_file, e))?;
        if read_back != data {
            return Err("read-back mismatch".to_string());
        }
        fs::remove_file(&check_file)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", check_file, e))?;
        let _ = fs::remove_dir(&check_dir).await;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, data: &[u8], content_type: &str) -> Result<String> {
        let reference = compute_content_hash(data);
        let full_path = self.base_path.join(storage_path(&reference)?);

        if fs::try_exists(&full_path).await? {
            debug!(reference = %reference, "blob_storage: content already stored");
            return Ok(reference);
        }

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "blob_storage: create_dir_all failed");
                e
            })?;
        }

        // Temp file + rename keeps readers from ever seeing a partial image.
        let temp_path = full_path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "blob_storage: rename failed");
            e
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        debug!(
            reference = %reference,
            content_type,
            size = data.len(),
            "blob_storage: stored"
        );
        Ok(reference)
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        let full_path = self.base_path.join(storage_path(reference)?);
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("image {}", reference)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process blob store for tests and the in-memory database.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8], _content_type: &str) -> Result<String> {
        let reference = compute_content_hash(data);
        self.blobs
            .lock()
            .await
            .entry(reference.clone())
            .or_insert_with(|| data.to_vec());
        Ok(reference)
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        digest_of(reference)?;
        self.blobs
            .lock()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("image {}", reference)))
    }
}
