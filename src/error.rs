//! Error kinds surfaced by the quantification pipeline.
//!
//! Workers propagate these to the dispatcher; only `main` turns them into a
//! process exit. Malformed input files map to exit code 84, internal
//! integrity and numerical-state errors to 74, option conflicts to 1.

use thiserror::Error;

/// Everything that can go wrong between input loading and shutdown.
#[derive(Debug, Error)]
pub enum QuantError {
    /// An ordered equivalence-class key vanished from the index mid-dispatch.
    #[error("equivalence-class key missing from the index")]
    MissingEcKey,

    /// Per-cell UMI counts do not add up to the expected mapped total.
    #[error("cell {barcode}: observed {observed} fragments, expected {expected}")]
    FragmentCountMismatch {
        /// Barcode of the offending cell.
        barcode: String,
        /// Sum of UMI counts seen while walking the index.
        observed: u64,
        /// Expected per-cell mapped-UMI total.
        expected: u64,
    },

    /// A transcript id outside the transcript-to-gene map.
    #[error("transcript id {tx} out of range ({num_transcripts} transcripts)")]
    TranscriptOutOfRange {
        /// Offending transcript id.
        tx: u32,
        /// Number of transcripts in the map.
        num_transcripts: u32,
    },

    /// A gene id at or beyond the number of genes.
    #[error("gene id {gid} out of range ({num_genes} genes)")]
    GeneOutOfRange {
        /// Offending gene id.
        gid: u32,
        /// Number of genes in the current index.
        num_genes: u32,
    },

    /// An equivalence class collapsed to an empty gene-label set.
    #[error("equivalence class with no gene labels")]
    EmptyLabels,

    /// A quantified barcode has no entry in the raw-read frequency table.
    #[error("barcode {0} missing from the frequency table")]
    MissingFrequency(String),

    /// Bootstrap replicate bookkeeping went inconsistent.
    #[error("cell {barcode}: kept {observed} bootstrap replicates, expected {expected}")]
    ReplicateCountMismatch {
        /// Barcode of the offending cell.
        barcode: String,
        /// Number of replicate estimates retained.
        observed: usize,
        /// Requested number of bootstrap replicates.
        expected: usize,
    },

    /// Post-truncation abundance sum fell below the smallest positive weight.
    /// Non-fatal: the cell is marked failed and dispatch continues.
    #[error("total abundance weight too small after truncation")]
    AlphaCollapse,

    /// A malformed or missing input file.
    #[error("invalid input {path}: {reason}")]
    InvalidInput {
        /// Path of the offending file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Mutually exclusive or incomplete option combinations.
    #[error("conflicting options: {0}")]
    OptionConflict(String),

    /// Failure in one of the output sinks.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QuantError {
    /// Exit code the binary uses for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            QuantError::InvalidInput { .. } => 84,
            QuantError::OptionConflict(_) => 1,
            _ => 74,
        }
    }

    /// Build an [`QuantError::InvalidInput`] for `path`.
    pub fn invalid_input(path: &std::path::Path, reason: impl Into<String>) -> Self {
        QuantError::InvalidInput {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}
