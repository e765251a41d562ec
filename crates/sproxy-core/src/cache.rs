use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::{Digest, Md5};
use tracing::{debug, warn};

use sproxy_common::{UpstreamError, UpstreamResult};
use sproxy_upstream::SoraClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    fn extension(self) -> &'static str {
        match self {
            MediaType::Image => ".png",
            MediaType::Video => ".mp4",
        }
    }
}

/// Hash-keyed local artifact store under one cache directory.
///
/// Filenames are `md5(url)` plus a media-type extension; freshness is the
/// file's mtime age against the configured TTL. TTL -1 disables eviction.
#[derive(Debug)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_filename(url: &str, media: MediaType) -> String {
        let digest = Md5::digest(url.as_bytes());
        let mut name = String::with_capacity(36);
        for byte in digest {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push_str(media.extension());
        name
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    fn age_of(path: &Path) -> Option<Duration> {
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        modified.elapsed().ok()
    }

    /// Returns the cached filename, downloading through the given proxy on a
    /// miss. Two calls within the TTL perform exactly one remote fetch.
    pub async fn download_and_cache(
        &self,
        client: &SoraClient,
        url: &str,
        media: MediaType,
        proxy: Option<&str>,
        ttl_secs: i64,
    ) -> UpstreamResult<String> {
        let filename = Self::cache_filename(url, media);
        let path = self.path_for(&filename);

        if path.exists() {
            let fresh = ttl_secs < 0
                || Self::age_of(&path)
                    .is_some_and(|age| (age.as_secs() as i64) < ttl_secs);
            if fresh {
                debug!(event = "cache_hit", %filename);
                return Ok(filename);
            }
            let _ = std::fs::remove_file(&path);
        }

        debug!(event = "cache_miss", %url);
        let data = client.download(url, proxy).await?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|err| UpstreamError::Transport(format!("cache write failed: {err}")))?;
        debug!(event = "cache_store", %filename, bytes = data.len());
        Ok(filename)
    }

    /// Deletes entries older than the TTL; TTL -1 disables eviction.
    pub async fn evict_expired(&self, ttl_secs: i64) -> usize {
        if ttl_secs < 0 {
            return 0;
        }
        let mut removed = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let expired =
                Self::age_of(&path).is_some_and(|age| (age.as_secs() as i64) > ttl_secs);
            if expired {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        warn!(event = "cache_evict_failed", path = %path.display(), %err);
                    }
                }
            }
        }
        removed
    }

    pub async fn clear_all(&self) -> usize {
        let mut removed = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_file() && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn temp_cache() -> FileCache {
        let dir = std::env::temp_dir().join(format!("sproxy-cache-{}", uuid::Uuid::new_v4()));
        FileCache::new(dir).unwrap()
    }

    fn offline_client() -> SoraClient {
        SoraClient::new(None, StdDuration::from_secs(5))
    }

    #[test]
    fn filename_is_md5_plus_extension() {
        let name = FileCache::cache_filename("https://example.com/a.mp4", MediaType::Video);
        assert_eq!(name.len(), 32 + 4);
        assert!(name.ends_with(".mp4"));
        assert!(name[..32].bytes().all(|b| b.is_ascii_hexdigit()));

        // Same url, same name; different media type, different extension.
        let again = FileCache::cache_filename("https://example.com/a.mp4", MediaType::Video);
        assert_eq!(name, again);
        let image = FileCache::cache_filename("https://example.com/a.mp4", MediaType::Image);
        assert!(image.ends_with(".png"));
        assert_eq!(image[..32], name[..32]);
    }

    #[tokio::test]
    async fn fresh_file_is_a_hit_without_fetching() {
        let cache = temp_cache();
        let url = "https://example.invalid/artifact.png";
        let filename = FileCache::cache_filename(url, MediaType::Image);
        std::fs::write(cache.path_for(&filename), b"cached").unwrap();

        // The client points nowhere routable; a miss would error out.
        let got = cache
            .download_and_cache(&offline_client(), url, MediaType::Image, None, 7200)
            .await
            .unwrap();
        assert_eq!(got, filename);
        let _ = cache.clear_all().await;
    }

    #[tokio::test]
    async fn eviction_respects_ttl_and_sentinel() {
        let cache = temp_cache();
        std::fs::write(cache.path_for("stale.mp4"), b"x").unwrap();
        tokio::time::sleep(StdDuration::from_millis(1100)).await;

        // Sentinel -1 never deletes.
        assert_eq!(cache.evict_expired(-1).await, 0);
        assert!(cache.path_for("stale.mp4").exists());

        assert_eq!(cache.evict_expired(0).await, 1);
        assert!(!cache.path_for("stale.mp4").exists());
    }

    #[tokio::test]
    async fn clear_all_removes_everything() {
        let cache = temp_cache();
        std::fs::write(cache.path_for("a.png"), b"x").unwrap();
        std::fs::write(cache.path_for("b.mp4"), b"y").unwrap();
        assert_eq!(cache.clear_all().await, 2);
    }
}
