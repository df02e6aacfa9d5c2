//! Chunk model: part identity, records, on-disk naming, video assembly readiness.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Extension of every stored part file.
pub const PART_EXTENSION: &str = "mp4";

/// Composite key of a video part. Stable across acquisition paths: a part downloaded
/// and the same part received from a peer are the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkIdentity {
    pub video_title: String,
    pub part_index: u32,
}

impl ChunkIdentity {
    pub fn new(video_title: impl Into<String>, part_index: u32) -> Self {
        Self {
            video_title: video_title.into(),
            part_index,
        }
    }

    /// `part_<index>.mp4`
    pub fn file_name(&self) -> String {
        part_file_name(self.part_index)
    }

    /// Directory name for this identity's video.
    pub fn video_dir_name(&self) -> String {
        video_dir_name(&self.video_title)
    }
}

impl fmt::Display for ChunkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.video_title, self.part_index)
    }
}

/// Directory name for a video title: spaces become `_`, path separators and
/// leading dots are dropped so a title can never escape the store root.
pub fn video_dir_name(video_title: &str) -> String {
    let name: String = video_title
        .trim()
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    let name = name.trim_start_matches('.');
    if name.is_empty() {
        "_".to_string()
    } else {
        name.to_string()
    }
}

pub fn part_file_name(part_index: u32) -> String {
    format!("part_{}.{}", part_index, PART_EXTENSION)
}

/// Inverse of [`part_file_name`]. Returns None for anything that is not a part file.
pub fn parse_part_file_name(file_name: &str) -> Option<u32> {
    let stem = file_name
        .strip_prefix("part_")?
        .strip_suffix(PART_EXTENSION)?
        .strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// How a chunk reached this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcquisitionSource {
    Downloaded,
    Received,
}

/// A chunk present on disk. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub identity: ChunkIdentity,
    pub path: PathBuf,
    pub size: u64,
    pub source: AcquisitionSource,
}

/// One video of a study section, as supplied by the course-details collaborator.
/// `video_urls[i]` is the HTTP source of part `i`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SectionVideo {
    pub title: String,
    #[serde(default)]
    pub video_urls: Vec<String>,
}

impl SectionVideo {
    pub fn new(title: impl Into<String>, video_urls: Vec<String>) -> Self {
        Self {
            title: title.into(),
            video_urls,
        }
    }

    pub fn part_count(&self) -> u32 {
        self.video_urls.len() as u32
    }

    /// Expected identities in part order.
    pub fn expected_parts(&self) -> Vec<ChunkIdentity> {
        (0..self.part_count())
            .map(|i| ChunkIdentity::new(self.title.clone(), i))
            .collect()
    }

    /// Source URL for a part, if the section lists one.
    pub fn url_for(&self, part_index: u32) -> Option<&str> {
        self.video_urls.get(part_index as usize).map(String::as_str)
    }
}

/// Derived readiness of a video: which expected parts are present.
/// Recomputed from the current records; never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyState {
    pub video_title: String,
    pub total: u32,
    present: BTreeMap<u32, bool>,
}

impl AssemblyState {
    /// Compute from the expected part count and the records listed for the video.
    pub fn compute(video: &SectionVideo, records: &[ChunkRecord]) -> Self {
        let mut present: BTreeMap<u32, bool> = (0..video.part_count()).map(|i| (i, false)).collect();
        for r in records {
            if r.identity.video_title != video.title {
                continue;
            }
            if let Some(slot) = present.get_mut(&r.identity.part_index) {
                *slot = true;
            }
        }
        Self {
            video_title: video.title.clone(),
            total: video.part_count(),
            present,
        }
    }

    pub fn acquired(&self) -> u32 {
        self.present.values().filter(|p| **p).count() as u32
    }

    /// Every expected index has a record. A video with no parts is never ready.
    pub fn is_ready(&self) -> bool {
        self.total > 0 && self.acquired() == self.total
    }

    pub fn missing(&self) -> Vec<u32> {
        self.present
            .iter()
            .filter(|(_, p)| !**p)
            .map(|(i, _)| *i)
            .collect()
    }
}
