// src/errors.rs
//
// =============================================================================
// RELAXRUN: ERROR KINDS
// =============================================================================
//
// Five failure classes, split by blast radius:
// - Local (one structure): StructureFailed, MaxMemory.
// - Global (stop the batch): Input, FatalExecutor.
// - Soft stop (leave everything resumable): Walltime.
//
// The driver catches the local kinds and surfaces them as its outcome; the
// rest propagate to the batch layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    /// Contradictory or unphysical calculation input. Kills the batch.
    #[error("input error: {0}")]
    Input(String),

    /// Executable missing, MPI mismatch, impossible schedule. Kills the batch.
    #[error("fatal executor error: {0}")]
    FatalExecutor(String),

    /// Per-structure failure; files go to bad_castep and the batch continues.
    #[error("structure failed: {0}")]
    StructureFailed(String),

    /// Walltime (or interrupt) reached; the structure is left resumable.
    #[error("walltime exceeded: {0}")]
    Walltime(String),

    /// Memcheck refused the structure; skipped without moving to bad_castep.
    #[error("estimated memory exceeds limit: {0}")]
    MaxMemory(String),
}

impl ComputeError {
    /// True for the kinds that must stop the whole batch, not just this seed.
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            ComputeError::Input(_) | ComputeError::FatalExecutor(_) | ComputeError::Walltime(_)
        )
    }

    /// True for the kinds the worker loop absorbs and moves past.
    pub fn is_local(&self) -> bool {
        !self.is_global()
    }
}

/// Codec-level parse failure. A partial scrape of the simulator log is an
/// expected outcome during a remedied retry, so this is kept separate from
/// `ComputeError` and mapped by the driver.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {format} file {path}: {reason}")]
    Malformed {
        format: &'static str,
        path: String,
        reason: String,
    },
}

impl CodecError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        CodecError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(
        format: &'static str,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        CodecError::Malformed {
            format,
            path: path.into(),
            reason: reason.into(),
        }
    }
}
