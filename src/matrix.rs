//! Sparse fragment-by-locus score matrix.
//!
//! Represented as three parallel arrays (row pointers, column indices,
//! values) rather than an object graph. All elementwise operations are
//! fused loops over stored nonzeros; no dense `R×T` intermediate is ever
//! materialized.

/// Row-major compressed sparse matrix of `f64` values.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    /// `row_ptr[i]..row_ptr[i+1]` indexes into `col_idx`/`values` for row `i`.
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of stored (row, col) entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Construct from `(row, col, value)` triplets. Duplicate `(row, col)`
    /// pairs are summed. Values must be strictly positive, but that
    /// invariant is the caller's responsibility (the ingester never emits
    /// non-positive scores); this constructor only enforces shape.
    pub fn from_triplets(rows: usize, cols: usize, mut triplets: Vec<(usize, usize, f64)>) -> Self {
        triplets.sort_by_key(|&(r, c, _)| (r, c));

        let mut row_ptr = vec![0usize; rows + 1];
        let mut col_idx = Vec::with_capacity(triplets.len());
        let mut values = Vec::with_capacity(triplets.len());

        let mut i = 0;
        while i < triplets.len() {
            let (r, c, _) = triplets[i];
            let mut sum = 0.0;
            let mut j = i;
            while j < triplets.len() && triplets[j].0 == r && triplets[j].1 == c {
                sum += triplets[j].2;
                j += 1;
            }
            col_idx.push(c);
            values.push(sum);
            row_ptr[r + 1] += 1;
            i = j;
        }
        for r in 0..rows {
            row_ptr[r + 1] += row_ptr[r];
        }

        Self { rows, cols, row_ptr, col_idx, values }
    }

    /// Construct directly from a pre-built CSR layout (used by the
    /// checkpoint loader, where the triplets are already grouped and
    /// summed).
    pub fn from_csr_parts(
        rows: usize,
        cols: usize,
        row_ptr: Vec<usize>,
        col_idx: Vec<usize>,
        values: Vec<f64>,
    ) -> Self {
        debug_assert_eq!(row_ptr.len(), rows + 1);
        debug_assert_eq!(col_idx.len(), values.len());
        Self { rows, cols, row_ptr, col_idx, values }
    }

    /// Row slice of `(col, value)` pairs.
    pub fn row(&self, r: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let start = self.row_ptr[r];
        let end = self.row_ptr[r + 1];
        (start..end).map(move |k| (self.col_idx[k], self.values[k]))
    }

    /// Iterate all stored `(row, col, value)` triplets in row-major order.
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.rows).flat_map(move |r| self.row(r).map(move |(c, v)| (r, c, v)))
    }

    /// Per-row maximum. Rows with no stored entries yield `0.0`.
    pub fn max_per_row(&self) -> Vec<f64> {
        (0..self.rows)
            .map(|r| self.row(r).map(|(_, v)| v).fold(0.0_f64, f64::max))
            .collect()
    }

    /// Count of nonzero (stored) entries per row.
    pub fn count_nonzero_per_row(&self) -> Vec<usize> {
        (0..self.rows).map(|r| self.row_ptr[r + 1] - self.row_ptr[r]).collect()
    }

    /// Column-wise sum.
    pub fn sum_per_col(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.cols];
        for (&c, &v) in self.col_idx.iter().zip(self.values.iter()) {
            out[c] += v;
        }
        out
    }

    /// Count of nonzero (stored) entries per column.
    pub fn count_nonzero_per_col(&self) -> Vec<usize> {
        let mut out = vec![0usize; self.cols];
        for &c in &self.col_idx {
            out[c] += 1;
        }
        out
    }

    /// Row-normalize so each row sums to 1. Rows summing to 0 remain zero.
    pub fn normalize_rows(&self) -> Self {
        let sums = self.sum_per_row();
        self.map_rows(|r, v| if sums[r] > 0.0 { v / sums[r] } else { 0.0 })
    }

    /// Per-row sum.
    pub fn sum_per_row(&self) -> Vec<f64> {
        (0..self.rows).map(|r| self.row(r).map(|(_, v)| v).sum()).collect()
    }

    /// Row-wise argmax: a same-shape matrix with `1.0` at the position of
    /// each row's maximum stored value (ties broken to the first occurrence
    /// in storage order), and no entry for rows with nothing stored.
    pub fn argmax_per_row(&self) -> Self {
        let mut triplets = Vec::with_capacity(self.rows);
        for r in 0..self.rows {
            let mut best: Option<(usize, f64)> = None;
            for (c, v) in self.row(r) {
                if best.map(|(_, bv)| v > bv).unwrap_or(true) {
                    best = Some((c, v));
                }
            }
            if let Some((c, _)) = best {
                triplets.push((r, c, 1.0));
            }
        }
        Self::from_triplets(self.rows, self.cols, triplets)
    }

    /// Apply `f(x) = 1 if x >= tau else 0` to every stored entry, preserving
    /// the sparsity pattern (entries that fall below threshold become
    /// explicit zeros rather than disappearing).
    pub fn threshold(&self, tau: f64) -> Self {
        self.map_values(|v| if v >= tau { 1.0 } else { 0.0 })
    }

    /// Elementwise multiply by a row-broadcast vector of length `rows()`.
    /// Iterates stored nonzeros only.
    pub fn mul_row_broadcast(&self, row_vec: &[f64]) -> Self {
        assert_eq!(row_vec.len(), self.rows);
        self.map_rows(|r, v| v * row_vec[r])
    }

    /// Elementwise multiply by a column-broadcast vector of length `cols()`.
    pub fn mul_col_broadcast(&self, col_vec: &[f64]) -> Self {
        assert_eq!(col_vec.len(), self.cols);
        let mut values = Vec::with_capacity(self.values.len());
        for (&c, &v) in self.col_idx.iter().zip(self.values.iter()) {
            values.push(v * col_vec[c]);
        }
        Self { rows: self.rows, cols: self.cols, row_ptr: self.row_ptr.clone(), col_idx: self.col_idx.clone(), values }
    }

    /// Elementwise exponential of every stored value.
    pub fn exp(&self) -> Self {
        self.map_values(f64::exp)
    }

    /// Multiply every stored value by a scalar.
    pub fn scale(&self, factor: f64) -> Self {
        self.map_values(|v| v * factor)
    }

    /// Greatest stored value across the whole matrix, or `0.0` if empty.
    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(0.0_f64, f64::max)
    }

    fn map_values(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            row_ptr: self.row_ptr.clone(),
            col_idx: self.col_idx.clone(),
            values: self.values.iter().map(|&v| f(v)).collect(),
        }
    }

    fn map_rows(&self, f: impl Fn(usize, f64) -> f64) -> Self {
        let mut values = Vec::with_capacity(self.values.len());
        for r in 0..self.rows {
            for k in self.row_ptr[r]..self.row_ptr[r + 1] {
                values.push(f(r, self.values[k]));
            }
        }
        Self { rows: self.rows, cols: self.cols, row_ptr: self.row_ptr.clone(), col_idx: self.col_idx.clone(), values }
    }

    /// Raw parts for checkpoint serialization: row pointer, column indices,
    /// values.
    pub fn csr_parts(&self) -> (&[usize], &[usize], &[f64]) {
        (&self.row_ptr, &self.col_idx, &self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_triplets_sum() {
        let m = SparseMatrix::from_triplets(1, 1, vec![(0, 0, 1.5), (0, 0, 2.5)]);
        assert_eq!(m.row(0).collect::<Vec<_>>(), vec![(0, 4.0)]);
    }

    #[test]
    fn normalize_rows_leaves_zero_rows_zero() {
        let m = SparseMatrix::from_triplets(2, 2, vec![(0, 0, 2.0), (0, 1, 2.0)]);
        let n = m.normalize_rows();
        assert_eq!(n.row(0).collect::<Vec<_>>(), vec![(0, 0.5), (1, 0.5)]);
        assert_eq!(n.row(1).collect::<Vec<_>>(), vec![]);
    }

    #[test]
    fn argmax_per_row_picks_max_column() {
        let m = SparseMatrix::from_triplets(1, 3, vec![(0, 0, 1.0), (0, 1, 5.0), (0, 2, 3.0)]);
        let am = m.argmax_per_row();
        assert_eq!(am.row(0).collect::<Vec<_>>(), vec![(1, 1.0)]);
    }

    #[test]
    fn threshold_preserves_pattern() {
        let m = SparseMatrix::from_triplets(1, 2, vec![(0, 0, 0.95), (0, 1, 0.5)]);
        let t = m.threshold(0.9);
        assert_eq!(t.row(0).collect::<Vec<_>>(), vec![(0, 1.0), (1, 0.0)]);
    }

    #[test]
    fn column_sum_and_count() {
        let m = SparseMatrix::from_triplets(2, 2, vec![(0, 0, 1.0), (1, 0, 2.0), (1, 1, 3.0)]);
        assert_eq!(m.sum_per_col(), vec![3.0, 3.0]);
        assert_eq!(m.count_nonzero_per_col(), vec![2, 1]);
    }

    #[test]
    fn broadcast_multiplies_stored_entries_only() {
        let m = SparseMatrix::from_triplets(2, 2, vec![(0, 0, 1.0), (1, 1, 1.0)]);
        let rb = m.mul_row_broadcast(&[2.0, 3.0]);
        assert_eq!(rb.row(0).collect::<Vec<_>>(), vec![(0, 2.0)]);
        assert_eq!(rb.row(1).collect::<Vec<_>>(), vec![(1, 3.0)]);

        let cb = m.mul_col_broadcast(&[10.0, 20.0]);
        assert_eq!(cb.row(0).collect::<Vec<_>>(), vec![(0, 10.0)]);
        assert_eq!(cb.row(1).collect::<Vec<_>>(), vec![(1, 20.0)]);
    }
}
