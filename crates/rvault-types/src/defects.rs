//! Frame-indexed defect records gathered during capture.
//!
//! Three independent streams share the same shape: a frame position within
//! the captured stream plus a payload. The chunker rebases positions from
//! "frame within the whole capture" to "frame within one output item".

use serde::{Deserialize, Serialize};

/// One frame flagged by the photosensitive-epilepsy analyser.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PseFailure {
    pub position: i64,
    pub red: f32,
    pub flash: f32,
    pub spatial: f32,
}

/// A replay error reported by the source VTR during capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VtrError {
    pub position: i64,
    pub code: u8,
}

/// A dropout event detected in the backup-tape signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropOut {
    pub position: i64,
    pub strength: i32,
}

/// The three defect streams for one capture or one chunked item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefectLists {
    pub pse_failures: Vec<PseFailure>,
    pub vtr_errors: Vec<VtrError>,
    pub dropouts: Vec<DropOut>,
}

impl DefectLists {
    pub fn is_empty(&self) -> bool {
        self.pse_failures.is_empty() && self.vtr_errors.is_empty() && self.dropouts.is_empty()
    }

    /// Total records across the three streams.
    pub fn len(&self) -> usize {
        self.pse_failures.len() + self.vtr_errors.len() + self.dropouts.len()
    }

    /// Order every stream by position; the chunker's cursors assume this.
    pub fn sort_by_position(&mut self) {
        self.pse_failures.sort_by_key(|f| f.position);
        self.vtr_errors.sort_by_key(|e| e.position);
        self.dropouts.sort_by_key(|d| d.position);
    }

    pub fn merge(&mut self, other: DefectLists) {
        self.pse_failures.extend(other.pse_failures);
        self.vtr_errors.extend(other.vtr_errors);
        self.dropouts.extend(other.dropouts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let lists = DefectLists::default();
        assert!(lists.is_empty());
        assert_eq!(lists.len(), 0);
    }

    #[test]
    fn test_sort_by_position() {
        let mut lists = DefectLists {
            vtr_errors: vec![
                VtrError { position: 90, code: 2 },
                VtrError { position: 10, code: 1 },
            ],
            ..DefectLists::default()
        };
        lists.sort_by_position();
        assert_eq!(lists.vtr_errors[0].position, 10);
        assert_eq!(lists.vtr_errors[1].position, 90);
    }

    #[test]
    fn test_merge_counts() {
        let mut a = DefectLists {
            dropouts: vec![DropOut { position: 5, strength: 12 }],
            ..DefectLists::default()
        };
        let b = DefectLists {
            dropouts: vec![DropOut { position: 9, strength: 3 }],
            vtr_errors: vec![VtrError { position: 2, code: 4 }],
            ..DefectLists::default()
        };
        a.merge(b);
        assert_eq!(a.dropouts.len(), 2);
        assert_eq!(a.len(), 3);
    }
}
