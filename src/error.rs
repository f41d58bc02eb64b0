//! Error taxonomy for the reassignment core.
//!
//! Every fallible operation in [`crate::annotation`], [`crate::ingest`],
//! [`crate::matrix`] and [`crate::em`] returns a [`CoreError`]. The binary
//! entry point wraps these with `anyhow::Context` for user-facing messages.

use thiserror::Error;

/// Errors surfaced by the reassignment core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A GTF record was malformed: non-integer/inverted coordinates, or two
    /// intervals belonging to different loci overlap on the same
    /// chromosome.
    #[error("malformed annotation at {chrom}:{start}-{end}: {reason}")]
    MalformedAnnotation {
        /// Chromosome the offending record was on.
        chrom: String,
        /// Record start coordinate.
        start: i64,
        /// Record end coordinate.
        end: i64,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// Segments for a fragment could not be paired into candidate
    /// alignments consistently.
    #[error("malformed alignment for fragment '{fragment}': {reason}")]
    MalformedAlignment {
        /// Name of the offending fragment.
        fragment: String,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// Setup produced an empty model: no mapped fragments, no loci, or a
    /// score matrix that is entirely zero.
    #[error("empty model: {reason}")]
    EmptyModel {
        /// Human-readable description of which precondition failed.
        reason: String,
    },

    /// A non-finite value (NaN or infinity) appeared in an EM intermediate.
    #[error("numerical failure in {stage}: {reason}")]
    NumericalFailure {
        /// EM stage the failure occurred in (e.g. "E-step", "M-step").
        stage: &'static str,
        /// Human-readable description.
        reason: String,
    },

    /// The checkpoint sink rejected a write. EM continues; this is surfaced
    /// to the caller as a warning, not a fatal error.
    #[error("checkpoint write failed at iteration {iteration}: {source}")]
    CheckpointIoFailure {
        /// Iteration at which the checkpoint was attempted.
        iteration: usize,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The updated-alignment sink rejected a write for a single fragment.
    /// That fragment is skipped; EM state is unaffected.
    #[error("failed to write updated alignment for fragment '{fragment}': {source}")]
    OutputIoFailure {
        /// Name of the fragment whose output record could not be written.
        fragment: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O failure reading an input stream (annotation or
    /// alignment file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
