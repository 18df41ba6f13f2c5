//! Persisted row shapes.
//!
//! These are the wire format between the core and whatever store backs it;
//! ids are store-assigned and 0 until saved.

use rvault_types::{
    AbortInitiator, CatalogueData, Destination, IngestFormat, PseVerdict, SessionStatus,
    SourceItem, TransferStatus,
};
use serde::{Deserialize, Serialize};

/// One cache instance, keyed by owning recorder name + directory path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRow {
    pub id: i64,
    pub recorder: String,
    pub path: String,
}

/// A hard-disk destination linked to a cache, joined with its owning
/// session's projection. This is what the cache loads at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItemRow {
    /// Hard-disk destination id; unique per item.
    pub dest_id: i64,
    pub cache_id: i64,
    pub filename: String,
    pub browse_filename: Option<String>,
    pub pse_filename: Option<String>,
    pub format: IngestFormat,
    pub size: i64,
    pub duration: i64,
    pub pse_verdict: PseVerdict,
    pub session_id: i64,
    pub session_created_at: i64,
    pub session_comments: String,
    pub session_status: SessionStatus,
    pub source: SourceItem,
}

/// One recording session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: i64,
    pub recorder: String,
    /// Unix seconds at session creation.
    pub created_at: i64,
    pub comments: String,
    pub status: SessionStatus,
    pub abort_initiator: Option<AbortInitiator>,
    pub total_vtr_errors: i64,
    pub total_dropouts: i64,
}

/// One output destination of a recording session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRow {
    pub id: i64,
    pub session_id: i64,
    pub destination: Destination,
    /// Set once the destination's file is registered with a cache.
    pub cache_id: Option<i64>,
}

/// One tape-export session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LtoSessionRow {
    pub id: i64,
    pub recorder: String,
    pub barcode: String,
    pub created_at: i64,
    pub status: SessionStatus,
    pub abort_initiator: Option<AbortInitiator>,
    pub comments: String,
}

/// One file within a tape-export batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LtoFileRow {
    pub id: i64,
    pub lto_session_id: i64,
    /// 1-based position on the tape; also the two-digit suffix of `filename`.
    pub position: u32,
    /// Name the file carries on tape: barcode + zero-padded position + ".mxf".
    pub filename: String,
    /// Cache filename the content came from.
    pub source_filename: String,
    pub size: i64,
    pub duration: i64,
    pub status: TransferStatus,
    /// Catalogue record to export once the transfer completes.
    pub catalogue: CatalogueData,
}

/// A catalogue export persisted after a file reached tape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogueExportRow {
    pub id: i64,
    pub lto_file_id: i64,
    pub data: CatalogueData,
}
