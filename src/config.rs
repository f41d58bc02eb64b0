//! Caller-supplied configuration for a reassignment run.
//!
//! Mirrors the option table in the specification: every field has the
//! documented default and is independent of how the CLI happens to expose
//! it (see `main.rs` for the `clap` surface).

/// Reserved locus id used when a fragment maps to the reference but not to
/// any annotated feature. Must not collide with a real locus identifier.
pub const DEFAULT_NO_FEATURE_KEY: &str = "__nofeature__";

/// Tunable parameters for annotation ingest, EM, and report/output stages.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// GTF attribute name used to derive locus identity (default `locus`).
    pub locus_attr_name: String,
    /// Reserved locus id for unannotated mapped fragments.
    pub no_feature_key: String,
    /// Minimum posterior probability for inclusion in the updated alignment
    /// stream.
    pub min_prob: f64,
    /// Threshold above which a uniquely-surviving locus is "high
    /// confidence".
    pub conf_prob: f64,
    /// Dirichlet-like pseudocount for pi, weighted by the maximum score.
    pub pi_prior: u32,
    /// Pseudocount for theta.
    pub theta_prior: u32,
    /// Convergence threshold on sum(|pi - pi_hat|).
    pub em_epsilon: f64,
    /// Hard cap on EM iterations.
    pub max_iter: usize,
    /// Iterations between checkpoints (0 disables periodic checkpointing).
    pub checkpoint_interval: usize,
    /// Emit per-iteration convergence deltas at debug level.
    pub verbose: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            locus_attr_name: "locus".to_string(),
            no_feature_key: DEFAULT_NO_FEATURE_KEY.to_string(),
            min_prob: 0.2,
            conf_prob: 0.9,
            pi_prior: 0,
            theta_prior: 0,
            em_epsilon: 1e-7,
            max_iter: 100,
            checkpoint_interval: 10,
            verbose: false,
        }
    }
}
