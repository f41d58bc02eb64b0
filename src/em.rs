//! Weighted expectation-maximization over the sparse score matrix.

use tracing::debug;

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::matrix::SparseMatrix;

/// Everything the E/M loop needs that is fixed for the whole run.
pub struct EmSetup {
    /// Rescaled, exponentiated score matrix (the EM likelihood proxy).
    pub q: SparseMatrix,
    /// Per-row maximum of `q` ("weight" of each fragment).
    pub weights: Vec<f64>,
    /// Uniqueness indicator: `1` iff the row has exactly one nonzero.
    pub y: Vec<u8>,
    u_total: f64,
    nu_total: f64,
    pisum0: Vec<f64>,
    pi_prior: f64,
    theta_prior: f64,
}

/// Compute the EM setup quantities from the raw (fragment, locus) score
/// matrix. Fails fast if the model is empty (zero rows, zero columns, or
/// every score is zero).
pub fn setup(raw: SparseMatrix) -> Result<EmSetup, CoreError> {
    let (rows, cols) = (raw.rows(), raw.cols());
    let max_s = raw.max();
    if rows == 0 || cols == 0 || max_s == 0.0 {
        return Err(CoreError::EmptyModel {
            reason: format!("R={rows} T={cols} max(S)={max_s}"),
        });
    }

    let q = raw.scale(100.0 / max_s).exp();
    let weights = q.max_per_row();
    let counts = q.count_nonzero_per_row();
    let y: Vec<u8> = counts.iter().map(|&c| if c == 1 { 1 } else { 0 }).collect();

    let y_f: Vec<f64> = y.iter().map(|&v| v as f64).collect();
    let not_y_f: Vec<f64> = y.iter().map(|&v| 1.0 - v as f64).collect();

    let u_total: f64 = weights.iter().zip(&y_f).map(|(w, yv)| w * yv).sum();
    let nu_total: f64 = weights.iter().zip(&not_y_f).map(|(w, nyv)| w * nyv).sum();

    let pisum0 = q.mul_row_broadcast(&y_f).sum_per_col();

    Ok(EmSetup {
        q,
        weights,
        y,
        u_total,
        nu_total,
        pisum0,
        pi_prior: 0.0,
        theta_prior: 0.0,
    })
}

impl EmSetup {
    fn with_priors(mut self, config: &CoreConfig) -> Self {
        let max_weight = self.weights.iter().copied().fold(0.0_f64, f64::max);
        self.pi_prior = config.pi_prior as f64 * max_weight;
        self.theta_prior = config.theta_prior as f64 * max_weight;
        self
    }
}

/// Result of running EM to convergence (or `max_iter`).
pub struct EmResult {
    /// Mixture proportions after iteration 0 (the report's "init" column).
    pub pi0: Vec<f64>,
    /// Final mixture proportions.
    pub pi: Vec<f64>,
    /// Final reassignment parameter.
    pub theta: Vec<f64>,
    /// Final per-fragment posterior distribution over loci.
    pub x_hat: SparseMatrix,
    /// Number of iterations actually performed.
    pub iterations: usize,
    /// The rescaled, exponentiated score matrix EM ran over; retained so
    /// the report can recompute `X_init` and the unique/weighted/fractional
    /// count columns without redoing setup.
    pub q: SparseMatrix,
    /// Uniqueness indicator used by EM and by the report's `unique_counts`
    /// column.
    pub y: Vec<u8>,
}

/// Run the weighted EM loop to convergence or `max_iter`, whichever comes
/// first.
///
/// `on_checkpoint`, if provided, is called every `checkpoint_interval`
/// iterations with the current state. A checkpoint I/O failure is logged
/// and does not abort the run.
pub fn run(
    raw: SparseMatrix,
    config: &CoreConfig,
    mut on_checkpoint: Option<&mut dyn FnMut(usize, &EmResult, &SparseMatrix) -> std::io::Result<()>>,
) -> Result<EmResult, CoreError> {
    let setup = setup(raw)?.with_priors(config);
    let t = setup.q.cols();

    let mut pi = vec![1.0 / t as f64; t];
    let mut theta = vec![1.0 / t as f64; t];
    let mut pi0 = pi.clone();
    let mut x_hat = setup.q.normalize_rows();
    let mut iterations = 0usize;

    for iter_num in 0..config.max_iter {
        // numerator[i,j] = Q[i,j] * pi[j] * theta[j]^(1-Y[i]); build the two
        // column-broadcast variants and pick per row by uniqueness below.
        let col_pi: Vec<f64> = pi.clone();
        let col_pi_theta: Vec<f64> = pi.iter().zip(&theta).map(|(p, th)| p * th).collect();

        let scaled_unique = setup.q.mul_col_broadcast(&col_pi);
        let scaled_nonunique = setup.q.mul_col_broadcast(&col_pi_theta);

        let y_f: Vec<f64> = setup.y.iter().map(|&v| v as f64).collect();
        let numerator = combine_by_row(&scaled_unique, &scaled_nonunique, &y_f);

        x_hat = numerator.normalize_rows();
        if x_hat.triplets().any(|(_, _, v)| !v.is_finite()) {
            return Err(CoreError::NumericalFailure {
                stage: "E-step",
                reason: "non-finite posterior value".to_string(),
            });
        }

        let w_hat = x_hat.mul_row_broadcast(&setup.weights);
        let theta_sum = w_hat.mul_row_broadcast(&not_y_f_vec(&setup.y)).sum_per_col();
        let pi_sum: Vec<f64> = setup.pisum0.iter().zip(&theta_sum).map(|(a, b)| a + b).collect();

        let pi_denom = setup.u_total + setup.nu_total + setup.pi_prior * t as f64;
        let theta_denom = setup.nu_total + setup.theta_prior * t as f64;

        let pi_hat: Vec<f64> = pi_sum.iter().map(|&s| (s + setup.pi_prior) / pi_denom).collect();
        let theta_hat: Vec<f64> = theta_sum.iter().map(|&s| (s + setup.theta_prior) / theta_denom).collect();

        if pi_hat.iter().chain(theta_hat.iter()).any(|v| !v.is_finite()) {
            return Err(CoreError::NumericalFailure {
                stage: "M-step",
                reason: "non-finite pi/theta estimate".to_string(),
            });
        }

        let delta: f64 = pi.iter().zip(&pi_hat).map(|(a, b)| (a - b).abs()).sum();
        debug!(iteration = iter_num, delta, "EM convergence delta");

        if iter_num == 0 {
            pi0 = pi_hat.clone();
        }
        pi = pi_hat;
        theta = theta_hat;
        iterations = iter_num + 1;

        if let Some(cb) = on_checkpoint.as_deref_mut() {
            if config.checkpoint_interval > 0 && iter_num % config.checkpoint_interval == 0 {
                let snapshot = EmResult {
                    pi0: pi0.clone(),
                    pi: pi.clone(),
                    theta: theta.clone(),
                    x_hat: x_hat.clone(),
                    iterations,
                    q: setup.q.clone(),
                    y: setup.y.clone(),
                };
                if let Err(e) = cb(iter_num, &snapshot, &setup.q) {
                    let err = CoreError::CheckpointIoFailure { iteration: iter_num, source: e };
                    tracing::warn!(iteration = iter_num, error = %err, "checkpoint write failed, continuing");
                }
            }
        }

        if delta <= config.em_epsilon {
            break;
        }
    }

    Ok(EmResult { pi0, pi, theta, x_hat, iterations, q: setup.q, y: setup.y })
}

fn not_y_f_vec(y: &[u8]) -> Vec<f64> {
    y.iter().map(|&v| 1.0 - v as f64).collect()
}

/// Combine two same-shape matrices row-wise: row `i` comes from `a` if
/// `row_select[i] == 1.0` (unique row, theta exponent is 0) else from `b`.
fn combine_by_row(a: &SparseMatrix, b: &SparseMatrix, row_select: &[f64]) -> SparseMatrix {
    let mut triplets = Vec::new();
    for (r, c, v) in a.triplets() {
        if row_select[r] == 1.0 {
            triplets.push((r, c, v));
        }
    }
    for (r, c, v) in b.triplets() {
        if row_select[r] != 1.0 {
            triplets.push((r, c, v));
        }
    }
    SparseMatrix::from_triplets(a.rows(), a.cols(), triplets)
}
