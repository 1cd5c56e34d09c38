use async_trait::async_trait;
use bytes::Bytes;
use larder_core::Result;

/// Flat object store addressed by `/`-separated relative paths.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Fails with an `Io` error of kind `NotFound` when absent.
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Replaces the object as a whole; readers never see a partial write.
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Every object below `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn stat(&self, path: &str) -> Result<Option<ObjectInfo>>;

    /// Refreshes the modification time; false if the object is missing.
    async fn touch(&self, path: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub modified: chrono::DateTime<chrono::Utc>,
}
