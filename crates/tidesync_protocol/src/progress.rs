//! Upload and download progress.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressDirection {
    /// Local changes sent to the server.
    Upload,
    /// Server changes received by the client.
    Download,
}

impl ProgressDirection {
    /// Both directions, upload first.
    pub const ALL: [ProgressDirection; 2] = [ProgressDirection::Upload, ProgressDirection::Download];
}

impl fmt::Display for ProgressDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressDirection::Upload => f.write_str("upload"),
            ProgressDirection::Download => f.write_str("download"),
        }
    }
}

/// Bytes transferred so far against bytes known to need transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEstimate {
    /// Bytes transferred so far.
    pub transferred: u64,
    /// Total bytes known to need transfer.
    pub transferable: u64,
}

impl ProgressEstimate {
    /// Creates a new estimate.
    pub fn new(transferred: u64, transferable: u64) -> Self {
        Self {
            transferred,
            transferable,
        }
    }

    /// Returns the completed fraction in `0.0..=1.0`.
    ///
    /// An estimate with nothing to transfer counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.transferable == 0 {
            return 1.0;
        }
        (self.transferred as f64 / self.transferable as f64).min(1.0)
    }

    /// Returns true once everything known has been transferred.
    pub fn is_complete(&self) -> bool {
        self.transferred >= self.transferable
    }
}

/// Progress in both directions for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Bytes uploaded.
    pub uploaded: u64,
    /// Bytes known to need uploading.
    pub uploadable: u64,
    /// Bytes downloaded.
    pub downloaded: u64,
    /// Bytes known to need downloading.
    pub downloadable: u64,
}

impl SyncProgress {
    /// Returns the estimate for one direction.
    pub fn estimate(&self, direction: ProgressDirection) -> ProgressEstimate {
        match direction {
            ProgressDirection::Upload => ProgressEstimate::new(self.uploaded, self.uploadable),
            ProgressDirection::Download => {
                ProgressEstimate::new(self.downloaded, self.downloadable)
            }
        }
    }

    /// Replaces the estimate for one direction.
    pub fn set(&mut self, direction: ProgressDirection, estimate: ProgressEstimate) {
        match direction {
            ProgressDirection::Upload => {
                self.uploaded = estimate.transferred;
                self.uploadable = estimate.transferable;
            }
            ProgressDirection::Download => {
                self.downloaded = estimate.transferred;
                self.downloadable = estimate.transferable;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_fraction() {
        assert_eq!(ProgressEstimate::new(0, 0).fraction(), 1.0);
        assert_eq!(ProgressEstimate::new(50, 200).fraction(), 0.25);
        assert!(ProgressEstimate::new(200, 200).is_complete());
        assert!(!ProgressEstimate::new(10, 200).is_complete());
    }

    #[test]
    fn per_direction_access() {
        let mut progress = SyncProgress::default();
        progress.set(ProgressDirection::Download, ProgressEstimate::new(50, 100));
        progress.set(ProgressDirection::Upload, ProgressEstimate::new(7, 9));

        assert_eq!(progress.downloaded, 50);
        assert_eq!(progress.downloadable, 100);
        assert_eq!(
            progress.estimate(ProgressDirection::Upload),
            ProgressEstimate::new(7, 9)
        );
    }
}
