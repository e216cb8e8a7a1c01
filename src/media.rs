use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Kind of media carried by a track or producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

impl FromStr for MediaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            other => bail!("unknown media kind '{}'", other),
        }
    }
}

/// One opaque unit of media (an encoded image, or a chunk of a container file)
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Vec<u8>,
    /// Milliseconds since the track started
    pub timestamp_ms: u64,
    pub sequence: u64,
}

/// A local media track. The track ends when its frame stream is exhausted.
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    frames: mpsc::Receiver<MediaFrame>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, frames: mpsc::Receiver<MediaFrame>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            frames,
        }
    }

    /// Build an already-buffered track. No pacing; the track ends right after the last frame.
    pub fn from_frames(kind: MediaKind, frames: Vec<Vec<u8>>) -> Self {
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for (i, data) in frames.into_iter().enumerate() {
            let frame = MediaFrame {
                data,
                timestamp_ms: i as u64,
                sequence: i as u64,
            };
            // Capacity equals the frame count, so this never fails
            let _ = tx.try_send(frame);
        }
        Self::new(kind, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Next frame, or `None` once the track has ended
    pub async fn next_frame(&mut self) -> Option<MediaFrame> {
        self.frames.recv().await
    }

    pub(crate) fn into_frames(self) -> mpsc::Receiver<MediaFrame> {
        self.frames
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Where a prerecorded track comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSourceConfig {
    /// A file (split into `chunk_size` pieces) or a directory (one file per frame)
    pub path: PathBuf,
    pub kind: MediaKind,
    /// Delay between frames when playing the source
    pub frame_interval_ms: u64,
    /// Chunk size in bytes when `path` is a single file
    pub chunk_size: usize,
}

impl Default for MediaSourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("media/frames"),
            kind: MediaKind::Video,
            frame_interval_ms: 40, // 25 fps
            chunk_size: 64 * 1024,
        }
    }
}

/// Plays a prerecorded source into tracks
pub struct MediaPlayer {
    config: MediaSourceConfig,
    frames: Vec<Vec<u8>>,
}

impl MediaPlayer {
    pub fn open(config: MediaSourceConfig) -> Result<Self> {
        let path = config.path.clone();
        info!("Opening media source: {}", path.display());

        let frames = if path.is_dir() {
            Self::read_directory(&path)?
        } else {
            Self::read_chunked(&path, config.chunk_size)?
        };

        if frames.is_empty() {
            bail!("Media source {} contains no frames", path.display());
        }

        info!(
            "Media source loaded: {} frames, {} bytes, kind={}",
            frames.len(),
            frames.iter().map(Vec::len).sum::<usize>(),
            config.kind
        );

        Ok(Self { config, frames })
    }

    fn read_directory(dir: &Path) -> Result<Vec<Vec<u8>>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        paths
            .iter()
            .map(|p| fs::read(p).with_context(|| format!("Failed to read frame {}", p.display())))
            .filter(|r| r.as_ref().map_or(true, |data| !data.is_empty()))
            .collect()
    }

    fn read_chunked(path: &Path, chunk_size: usize) -> Result<Vec<Vec<u8>>> {
        if chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        let data = fs::read(path)
            .with_context(|| format!("Failed to read media file {}", path.display()))?;
        Ok(data.chunks(chunk_size).map(<[u8]>::to_vec).collect())
    }

    pub fn kind(&self) -> MediaKind {
        self.config.kind
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Start playing the source into a new track.
    ///
    /// Must be called from within a Tokio runtime; frames are paced by a
    /// background task that ends the track after the last frame. Playback
    /// holds at the first frame until the track is read, then keeps the
    /// configured interval between frames.
    pub fn track(&self) -> MediaTrack {
        let (tx, rx) = mpsc::channel(1);
        let frames = self.frames.clone();
        let interval = Duration::from_millis(self.config.frame_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            for (i, data) in frames.into_iter().enumerate() {
                ticker.tick().await;
                let frame = MediaFrame {
                    data,
                    timestamp_ms: i as u64 * interval.as_millis() as u64,
                    sequence: i as u64,
                };
                if tx.send(frame).await.is_err() {
                    debug!("Track receiver dropped, stopping playback");
                    return;
                }
            }
            debug!("Media source exhausted");
        });

        MediaTrack::new(self.config.kind, rx)
    }
}

/// Best-effort file extension for an encoded image
pub fn image_extension(data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WEBP"[..]) {
        "webp"
    } else {
        "bin"
    }
}
