//! System prompt loading with an mtime-keyed cache.

use std::path::PathBuf;
use std::time::SystemTime;

use tokio::sync::Mutex;

/// Cached system prompt file.
///
/// The mutex serialises reads and covers the re-verification step: if
/// the file's mtime moved between the stat and the read, the read is
/// repeated so a torn write is never cached.
pub struct SystemPromptCache {
    path: PathBuf,
    default_text: String,
    cached: Mutex<Option<(SystemTime, String)>>,
}

impl SystemPromptCache {
    /// Cache over `path`, using `default_text` when the file is absent
    /// or unreadable.
    pub fn new(path: impl Into<PathBuf>, default_text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            default_text: default_text.into(),
            cached: Mutex::new(None),
        }
    }

    /// Current prompt text.
    pub async fn resolve(&self) -> String {
        let mut cached = self.cached.lock().await;

        let Some(mtime) = self.mtime().await else {
            log::debug!("System prompt file unavailable at {:?}; using default", self.path);
            return self.default_text.clone();
        };

        if let Some((cached_mtime, text)) = &*cached
            && *cached_mtime == mtime
        {
            return text.clone();
        }

        let (mtime, text) = match self.read_verified(mtime).await {
            Some(read) => read,
            None => return self.default_text.clone(),
        };

        *cached = Some((mtime, text.clone()));
        text
    }

    async fn read_verified(&self, mut mtime: SystemTime) -> Option<(SystemTime, String)> {
        // One retry covers an mtime that moved mid-read.
        for _ in 0..2 {
            let text = tokio::fs::read_to_string(&self.path).await.ok()?;
            let after = self.mtime().await?;

            if after == mtime {
                return Some((mtime, text));
            }

            mtime = after;
        }

        let text = tokio::fs::read_to_string(&self.path).await.ok()?;
        Some((mtime, text))
    }

    async fn mtime(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path).await.ok()?.modified().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_uses_default() {
        let cache = SystemPromptCache::new("/definitely/not/here.txt", "fallback");
        assert_eq!(cache.resolve().await, "fallback");
    }

    #[tokio::test]
    async fn reads_and_caches_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "from file").unwrap();

        let cache = SystemPromptCache::new(&path, "fallback");

        assert_eq!(cache.resolve().await, "from file");
        assert_eq!(cache.resolve().await, "from file");
    }

    #[tokio::test]
    async fn picks_up_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "first").unwrap();

        let cache = SystemPromptCache::new(&path, "fallback");
        assert_eq!(cache.resolve().await, "first");

        // Backdate-proof: force a distinct mtime.
        std::fs::write(&path, "second").unwrap();
        let past = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(past).unwrap();

        assert_eq!(cache.resolve().await, "second");
    }
}
