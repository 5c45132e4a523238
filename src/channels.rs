// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Channel roster — the list of bsread channels the broker acquires for
//! interactive sessions.
//!
//! Loaded from a text file, one channel per line; `#` comments and blank
//! lines are ignored, entries are trimmed, deduplicated and sorted. The
//! roster remembers the file mtime so callers can refresh on demand.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::info;

use crate::config::IMAGE_CHANNEL_SUFFIX;
use crate::error::{DaqError, Result};

/// True for channels delivered by the image backend.
pub fn is_image_channel(name: &str) -> bool {
    name.ends_with(IMAGE_CHANNEL_SUFFIX)
}

#[derive(Debug, Clone)]
pub struct ChannelRoster {
    path: PathBuf,
    channels: Vec<String>,
    mtime: Option<SystemTime>,
}

impl ChannelRoster {
    /// Load the roster from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let (channels, mtime) = read_channels_file(path)?;
        info!(file = ?path, channels = channels.len(), "Channel roster loaded");

        Ok(Self {
            path: path.to_path_buf(),
            channels,
            mtime,
        })
    }

    /// Re-read the file if its mtime changed. Returns whether a reload happened.
    pub fn refresh(&mut self) -> Result<bool> {
        let current = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        if current == self.mtime {
            return Ok(false);
        }

        let (channels, mtime) = read_channels_file(&self.path)?;
        info!(file = ?self.path, channels = channels.len(), "Channel roster reloaded");
        self.channels = channels;
        self.mtime = mtime;
        Ok(true)
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_channels_file(path: &Path) -> Result<(Vec<String>, Option<SystemTime>)> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DaqError::Config(format!("Cannot read channels file {path:?}: {e}")))?;
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();

    Ok((normalize_channels(content.lines()), mtime))
}

/// Trim, drop comments and blanks, dedupe and sort.
pub fn normalize_channels<'a, I>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut channels: Vec<String> = lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    channels.sort();
    channels.dedup();
    channels
}

/// Enforce the roster size limits.
pub fn verify_channels(
    input_channels: &[String],
    channels_limit: usize,
    picture_channels_limit: usize,
) -> Result<()> {
    info!(limit = channels_limit, "Verifying bsread channel limit");

    let channels: Vec<&String> = input_channels.iter().filter(|c| !c.is_empty()).collect();
    if channels.len() > channels_limit {
        return Err(DaqError::ChannelLimitExceeded {
            kind: "bsread",
            count: channels.len(),
            limit: channels_limit,
        });
    }

    info!(limit = picture_channels_limit, "Verifying picture channel limit");

    let n_picture = channels.iter().filter(|c| is_image_channel(c)).count();
    if n_picture > picture_channels_limit {
        return Err(DaqError::ChannelLimitExceeded {
            kind: "picture",
            count: n_picture,
            limit: picture_channels_limit,
        });
    }

    Ok(())
}
