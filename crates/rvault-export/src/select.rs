//! Batch selection policy.
//!
//! Automatic selection drains the oldest backlog first: candidates are
//! scanned ascending by session-creation time (the reverse of the cache's
//! own newest-first listing), greedily accumulating entries under the size
//! and count caps. A candidate that would burst the size cap is skipped,
//! but the scan keeps going — a smaller, later candidate may still fit.
//! The batch only stands once it clears the configured minimum size.

use rvault_persist::CacheItemRow;
use rvault_types::SourceItem;

/// One exportable cache entry.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub dest_id: i64,
    pub filename: String,
    pub size: i64,
    pub duration: i64,
    pub session_created_at: i64,
    pub source: SourceItem,
}

impl From<&CacheItemRow> for Candidate {
    fn from(row: &CacheItemRow) -> Self {
        Candidate {
            dest_id: row.dest_id,
            filename: row.filename.clone(),
            size: row.size.max(0),
            duration: row.duration,
            session_created_at: row.session_created_at,
            source: row.source.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionLimits {
    /// A batch below this is not worth a tape yet.
    pub min_bytes: u64,
    /// Total batch size must stay strictly under this.
    pub max_bytes: u64,
    pub max_files: usize,
}

/// Sort candidates into export order: oldest session first, then item
/// number.
pub fn sort_for_export(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.session_created_at
            .cmp(&b.session_created_at)
            .then(a.source.item_number.cmp(&b.source.item_number))
    });
}

/// Automatic policy. Returns `None` while the backlog is too small.
pub fn select_automatic(
    mut candidates: Vec<Candidate>,
    limits: &SelectionLimits,
) -> Option<Vec<Candidate>> {
    sort_for_export(&mut candidates);

    let mut batch = Vec::new();
    let mut total: u64 = 0;
    for candidate in candidates {
        if batch.len() >= limits.max_files {
            break;
        }
        let size = candidate.size as u64;
        if total + size >= limits.max_bytes {
            // Too big for what's left, but keep scanning smaller ones.
            continue;
        }
        total += size;
        batch.push(candidate);
    }

    if !batch.is_empty() && total >= limits.min_bytes {
        Some(batch)
    } else {
        None
    }
}

/// Manual policy: the operator's explicit list is validated strictly and
/// never silently substituted.
pub fn validate_manual(
    requested: &[i64],
    available: &[Candidate],
    limits: &SelectionLimits,
) -> Result<Vec<Candidate>, String> {
    if requested.is_empty() {
        return Err("no items requested".to_string());
    }
    let mut batch = Vec::new();
    for id in requested {
        match available.iter().find(|c| c.dest_id == *id) {
            Some(candidate) => batch.push(candidate.clone()),
            None => return Err(format!("item {} is not a completed cache entry", id)),
        }
    }
    let total: u64 = batch.iter().map(|c| c.size as u64).sum();
    if total == 0 {
        return Err("selected items have no content".to_string());
    }
    if total >= limits.max_bytes {
        return Err(format!("batch of {} bytes exceeds the tape capacity", total));
    }
    sort_for_export(&mut batch);
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(dest_id: i64, size: i64, created_at: i64, item_number: u32) -> Candidate {
        Candidate {
            dest_id,
            filename: format!("file{}.mxf", dest_id),
            size,
            duration: 100,
            session_created_at: created_at,
            source: SourceItem::new("LTA000001", item_number),
        }
    }

    fn limits(min: u64, max: u64, files: usize) -> SelectionLimits {
        SelectionLimits { min_bytes: min, max_bytes: max, max_files: files }
    }

    #[test]
    fn test_skip_over_cap_keeps_scanning_smaller() {
        // Oldest-first sizes [600, 600, 50], cap 1000: the second 600
        // bursts the cap and is skipped, the trailing 50 still fits.
        let candidates = vec![
            candidate(1, 600, 100, 1),
            candidate(2, 600, 200, 1),
            candidate(3, 50, 300, 1),
        ];
        let batch = select_automatic(candidates, &limits(100, 1000, 10)).unwrap();
        let ids: Vec<i64> = batch.iter().map(|c| c.dest_id).collect();
        assert_eq!(ids, [1, 3]);
        let total: i64 = batch.iter().map(|c| c.size).sum();
        assert_eq!(total, 650);
    }

    #[test]
    fn test_below_minimum_yields_nothing() {
        let candidates = vec![candidate(1, 40, 100, 1), candidate(2, 30, 200, 1)];
        assert!(select_automatic(candidates, &limits(100, 1000, 10)).is_none());
    }

    #[test]
    fn test_file_count_cap_stops_scan() {
        let candidates =
            vec![candidate(1, 10, 100, 1), candidate(2, 10, 200, 1), candidate(3, 10, 300, 1)];
        let batch = select_automatic(candidates, &limits(15, 1000, 2)).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].dest_id, 1);
        assert_eq!(batch[1].dest_id, 2);
    }

    #[test]
    fn test_oldest_first_ordering() {
        let candidates = vec![
            candidate(1, 10, 300, 1),
            candidate(2, 10, 100, 2),
            candidate(3, 10, 100, 1),
        ];
        let batch = select_automatic(candidates, &limits(1, 1000, 10)).unwrap();
        let ids: Vec<i64> = batch.iter().map(|c| c.dest_id).collect();
        // Created-at ascending, item number breaking the tie.
        assert_eq!(ids, [3, 2, 1]);
    }

    #[test]
    fn test_exact_cap_is_excluded() {
        // Totals must stay strictly under the cap.
        let candidates = vec![candidate(1, 600, 100, 1), candidate(2, 400, 200, 1)];
        let batch = select_automatic(candidates, &limits(100, 1000, 10)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].dest_id, 1);
    }

    #[test]
    fn test_manual_unknown_id_fails() {
        let available = vec![candidate(1, 100, 100, 1)];
        let err = validate_manual(&[1, 99], &available, &limits(0, 1000, 10)).unwrap_err();
        assert!(err.contains("99"));
    }

    #[test]
    fn test_manual_empty_and_oversize_fail() {
        let available = vec![candidate(1, 2000, 100, 1)];
        assert!(validate_manual(&[], &available, &limits(0, 1000, 10)).is_err());
        assert!(validate_manual(&[1], &available, &limits(0, 1000, 10)).is_err());
    }

    #[test]
    fn test_manual_accepts_valid_list() {
        let available = vec![candidate(1, 100, 200, 1), candidate(2, 100, 100, 1)];
        let batch = validate_manual(&[1, 2], &available, &limits(0, 1000, 10)).unwrap();
        // Re-sorted into export order regardless of request order.
        assert_eq!(batch[0].dest_id, 2);
        assert_eq!(batch[1].dest_id, 1);
    }
}
