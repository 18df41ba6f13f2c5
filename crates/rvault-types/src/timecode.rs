//! Frame counts and timecode rendering.
//!
//! Everything in the pipeline runs at the PAL broadcast rate; timecodes are
//! plain frame counts rendered as `hh:mm:ss:ff` for sidecar files.

use std::fmt;

use serde::{Deserialize, Serialize};

/// PAL frame rate.
pub const FRAMES_PER_SECOND: i64 = 25;

/// A non-drop timecode, stored as a frame count from midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timecode {
    frames: i64,
}

impl Timecode {
    pub fn from_frames(frames: i64) -> Self {
        Timecode { frames }
    }

    pub fn from_components(hours: i64, minutes: i64, seconds: i64, frames: i64) -> Self {
        Timecode {
            frames: ((hours * 60 + minutes) * 60 + seconds) * FRAMES_PER_SECOND + frames,
        }
    }

    pub fn total_frames(&self) -> i64 {
        self.frames
    }

    pub fn hours(&self) -> i64 {
        self.frames / (3600 * FRAMES_PER_SECOND)
    }

    pub fn minutes(&self) -> i64 {
        (self.frames / (60 * FRAMES_PER_SECOND)) % 60
    }

    pub fn seconds(&self) -> i64 {
        (self.frames / FRAMES_PER_SECOND) % 60
    }

    pub fn frames(&self) -> i64 {
        self.frames % FRAMES_PER_SECOND
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours(),
            self.minutes(),
            self.seconds(),
            self.frames()
        )
    }
}
