//! Report & posterior output: per-locus rankings derived from the converged
//! model.

use std::io::{self, Write};

use crate::em::EmResult;
use crate::ingest::AlternateCounts;
use crate::matrix::SparseMatrix;

/// One row of the report table, one per locus.
#[derive(Debug, Clone)]
pub struct ReportRow {
    /// Locus identifier (the report's `transcript` column, named for
    /// parity with the original tool's transposable-element terminology).
    pub transcript: String,
    /// Column sum of the row-wise argmax of the final posterior.
    pub final_best: f64,
    /// Column sum of `threshold(X̂, conf_prob)`.
    pub final_conf: f64,
    /// Final mixture proportion, `pi[j]`.
    pub final_prop: f64,
    /// Column sum of the row-wise argmax of the initial (pre-EM) posterior.
    pub init_best: f64,
    /// Column sum of `threshold(X_init, conf_prob)`.
    pub init_conf: f64,
    /// Mixture proportion after iteration 0, `pi0[j]`.
    pub init_prop: f64,
    /// Count of nonzero `Q` entries in this column restricted to unique
    /// rows (`Y[i] = 1`).
    pub unique_counts: f64,
    /// Column sum of row-normalized `Q`.
    pub weighted_counts: f64,
    /// Column sum of the row-normalized indicator of `Q > 0`.
    pub fractional_counts: f64,
    /// Diagnostic-only trailing columns, present only when the ingester
    /// tracked [`AlternateCounts`].
    pub unique_counts2: Option<usize>,
    /// See [`ReportRow::unique_counts2`].
    pub best_counts2: Option<usize>,
}

/// The full report: row/column shape plus one [`ReportRow`] per locus,
/// sorted by `final_best` descending.
#[derive(Debug, Clone)]
pub struct Report {
    /// Number of mapped fragments (rows of `Q`).
    pub r: usize,
    /// Number of loci (columns of `Q`).
    pub t: usize,
    /// Per-locus rows, sorted by `final_best` descending.
    pub rows: Vec<ReportRow>,
}

/// Build the report from a converged (or `maxIter`-capped) EM result.
///
/// `locus_ids` must be ordered by column index (as returned by
/// [`crate::annotation::AnnotationIndex::locus_ids`]). `alt_counts`, when
/// present, supplies the `unique_counts2`/`best_counts2` trailing columns.
pub fn build(em: &EmResult, locus_ids: &[String], conf_prob: f64, alt_counts: Option<&AlternateCounts>) -> Report {
    let q = &em.q;
    let r = q.rows();
    let t = q.cols();

    let x_init = q.normalize_rows();

    let final_best = em.x_hat.argmax_per_row().sum_per_col();
    let final_conf = em.x_hat.threshold(conf_prob).sum_per_col();
    let init_best = x_init.argmax_per_row().sum_per_col();
    let init_conf = x_init.threshold(conf_prob).sum_per_col();

    // unique_counts[j]: count of stored Q entries in column j restricted to
    // rows with Y=1. Computed by direct triplet iteration rather than a
    // row-broadcast-multiply-by-zero, since a broadcast by zero leaves the
    // entry stored (with value 0) and would be miscounted as nonzero.
    let mut unique_counts = vec![0usize; t];
    for (row, col, _) in q.triplets() {
        if em.y[row] == 1 {
            unique_counts[col] += 1;
        }
    }

    let weighted_counts = q.normalize_rows().sum_per_col();

    // fractional_counts[j]: column sum of the row-normalized indicator of
    // Q > 0. Every stored Q entry is positive, so the indicator is 1 at
    // every stored position; row-normalizing divides by that row's nonzero
    // count.
    let nnz_per_row = q.count_nonzero_per_row();
    let mut fractional_counts = vec![0.0f64; t];
    for (row, col, _) in q.triplets() {
        fractional_counts[col] += 1.0 / nnz_per_row[row] as f64;
    }

    let mut rows: Vec<ReportRow> = (0..t)
        .map(|j| ReportRow {
            transcript: locus_ids[j].clone(),
            final_best: final_best[j],
            final_conf: final_conf[j],
            final_prop: em.pi[j],
            init_best: init_best[j],
            init_conf: init_conf[j],
            init_prop: em.pi0[j],
            unique_counts: unique_counts[j] as f64,
            weighted_counts: weighted_counts[j],
            fractional_counts: fractional_counts[j],
            unique_counts2: alt_counts.map(|a| a.unique_counts.get(&locus_ids[j]).copied().unwrap_or(0)),
            best_counts2: alt_counts.map(|a| a.best_counts.get(&locus_ids[j]).copied().unwrap_or(0)),
        })
        .collect();

    rows.sort_by(|a, b| b.final_best.partial_cmp(&a.final_best).unwrap_or(std::cmp::Ordering::Equal));

    Report { r, t, rows }
}

impl Report {
    /// Write the TSV report: a single `#`-prefixed comment line recording
    /// `R` and `T`, a header row, then one row per locus.
    pub fn write_tsv(&self, mut w: impl Write) -> io::Result<()> {
        writeln!(w, "# Aligned reads:\t{}\tTranscripts\t{}", self.r, self.t)?;

        let has_alt = self.rows.first().map(|r| r.unique_counts2.is_some()).unwrap_or(false);
        write!(
            w,
            "transcript\tfinal_best\tfinal_conf\tfinal_prop\tinit_best\tinit_conf\tinit_prop\tunique_counts\tweighted_counts\tfractional_counts"
        )?;
        if has_alt {
            write!(w, "\tunique_counts2\tbest_counts2")?;
        }
        writeln!(w)?;

        for row in &self.rows {
            write!(
                w,
                "{}\t{}\t{}\t{:.6}\t{}\t{}\t{:.6}\t{}\t{:.6}\t{:.6}",
                row.transcript,
                row.final_best,
                row.final_conf,
                row.final_prop,
                row.init_best,
                row.init_conf,
                row.init_prop,
                row.unique_counts,
                row.weighted_counts,
                row.fractional_counts,
            )?;
            if has_alt {
                write!(w, "\t{}\t{}", row.unique_counts2.unwrap_or(0), row.best_counts2.unwrap_or(0))?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::em;

    fn locus_ids() -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    // single unique fragment on locus A.
    #[test]
    fn report_ranks_unique_locus_first() {
        let raw = SparseMatrix::from_triplets(1, 2, vec![(0, 0, 140.0)]);
        let result = em::run(raw, &CoreConfig::default(), None).unwrap();
        let report = build(&result, &locus_ids(), 0.9, None);

        assert_eq!(report.r, 1);
        assert_eq!(report.t, 2);
        assert_eq!(report.rows[0].transcript, "A");
        assert!((report.rows[0].final_best - 1.0).abs() < 1e-9);
        assert!((report.rows[1].final_best).abs() < 1e-9);
    }

    #[test]
    fn conf_prob_one_yields_zero_final_conf_without_exact_one() {
        let raw = SparseMatrix::from_triplets(1, 2, vec![(0, 0, 100.0), (0, 1, 99.0)]);
        let result = em::run(raw, &CoreConfig::default(), None).unwrap();
        let report = build(&result, &locus_ids(), 1.0, None);
        for row in &report.rows {
            assert_eq!(row.final_conf, 0.0);
        }
    }

    #[test]
    fn alt_counts_add_trailing_columns() {
        let raw = SparseMatrix::from_triplets(1, 2, vec![(0, 0, 140.0)]);
        let result = em::run(raw, &CoreConfig::default(), None).unwrap();
        let mut alt = AlternateCounts::default();
        alt.observe(&[("A".to_string(), false)]);
        let report = build(&result, &locus_ids(), 0.9, Some(&alt));

        let a_row = report.rows.iter().find(|r| r.transcript == "A").unwrap();
        assert_eq!(a_row.unique_counts2, Some(1));
        assert_eq!(a_row.best_counts2, Some(1));

        let mut buf = Vec::new();
        report.write_tsv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("unique_counts2"));
    }
}
