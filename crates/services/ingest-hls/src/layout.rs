//! On-disk layout of a capture session
//!
//! ```text
//! {streams_dir}/{key}/
//!     recording.webm          raw ingest container
//!     live.m3u8               live playlist (encoder output)
//!     live_00000.ts ...       live segments (rolling window)
//!     timelapse.m3u8          accelerated playlist (published on success)
//!     timelapse.m3u8.tmp      accelerated playlist while the job runs
//!     timelapse_00000.ts ...  accelerated segments
//! ```

use std::path::{Path, PathBuf};

use crate::key::SessionKey;

pub const INGEST_FILE: &str = "recording.webm";
pub const LIVE_PLAYLIST: &str = "live.m3u8";
pub const LIVE_SEGMENT_PATTERN: &str = "live_%05d.ts";
pub const TIMELAPSE_PLAYLIST: &str = "timelapse.m3u8";
pub const TIMELAPSE_STAGING_PLAYLIST: &str = "timelapse.m3u8.tmp";
pub const TIMELAPSE_SEGMENT_PATTERN: &str = "timelapse_%05d.ts";

/// Paths belonging to one session key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    key: SessionKey,
    dir: PathBuf,
}

impl SessionLayout {
    pub fn new(streams_dir: impl AsRef<Path>, key: SessionKey) -> Self {
        let dir = streams_dir.as_ref().join(key.as_str());
        Self { key, dir }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Session directory; its name is also the URL path component
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ingest_path(&self) -> PathBuf {
        self.dir.join(INGEST_FILE)
    }

    pub fn live_playlist(&self) -> PathBuf {
        self.dir.join(LIVE_PLAYLIST)
    }

    pub fn live_segment_pattern(&self) -> PathBuf {
        self.dir.join(LIVE_SEGMENT_PATTERN)
    }

    pub fn timelapse_playlist(&self) -> PathBuf {
        self.dir.join(TIMELAPSE_PLAYLIST)
    }

    pub fn timelapse_staging_playlist(&self) -> PathBuf {
        self.dir.join(TIMELAPSE_STAGING_PLAYLIST)
    }

    pub fn timelapse_segment_pattern(&self) -> PathBuf {
        self.dir.join(TIMELAPSE_SEGMENT_PATTERN)
    }

    /// Create the session directory if it does not exist yet
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Remove a live playlist left behind by a previous recording under the same key
    pub async fn clear_live_playlist(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.live_playlist()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let key = SessionKey::new("u1", "5").unwrap();
        let layout = SessionLayout::new("/data/streams", key);

        assert_eq!(layout.dir(), Path::new("/data/streams/u1_5"));
        assert_eq!(
            layout.ingest_path(),
            PathBuf::from("/data/streams/u1_5/recording.webm")
        );
        assert_eq!(
            layout.live_playlist(),
            PathBuf::from("/data/streams/u1_5/live.m3u8")
        );
        assert_eq!(
            layout.timelapse_staging_playlist(),
            PathBuf::from("/data/streams/u1_5/timelapse.m3u8.tmp")
        );
    }

    #[tokio::test]
    async fn test_clear_live_playlist_tolerates_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(temp.path(), SessionKey::new("u1", "5").unwrap());
        layout.ensure_dir().await.unwrap();

        layout.clear_live_playlist().await.unwrap();

        tokio::fs::write(layout.live_playlist(), "#EXTM3U\n").await.unwrap();
        layout.clear_live_playlist().await.unwrap();
        assert!(!layout.live_playlist().exists());
    }
}
