use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Presigned URLs for one object key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUpload {
    pub upload_url: String,
    pub get_url: String,
}

/// Leading bytes of an object plus its full size.
///
/// `e_tag` identifies the version that was read; copying under that tag
/// guarantees the promoted object is the one whose bytes were checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectProbe {
    pub bytes: Vec<u8>,
    pub total_size: u64,
    pub e_tag: String,
}

/// Object storage operations used by avatar uploads.
///
/// Errors are infrastructure failures; none of them are retried here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Presign a time-boxed PUT for `key` plus a GET for the same key
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<PresignedUpload>;

    /// Read at most `max_bytes` from the start of `key`. `None` if absent.
    async fn get_range(&self, key: &str, max_bytes: u64) -> Result<Option<ObjectProbe>>;

    /// Server-side copy of `src` as long as its ETag still equals `if_match`,
    /// replacing `dst` atomically. Returns the destination key, or `None` when
    /// `src` changed since it was read.
    async fn copy(&self, src: &str, dst: &str, if_match: &str) -> Result<Option<String>>;

    /// Delete `key`; succeeds when it is already absent
    async fn delete(&self, key: &str) -> Result<()>;
}
