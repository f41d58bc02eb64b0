//! Checkpoint binary format: an explicit, documented byte layout rather
//! than the original tool's pickle-based one. Grounded on the
//! `MaelLefeuvre-grups-rs` `vcf-fst` crate, which hand-rolls a byte layout
//! with `byteorder`.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic       : 8 bytes, b"TELECKPT"
//! version     : u32
//! row_count   : u64
//! row_names   : row_count * (u32 len, len bytes UTF-8)
//! col_count   : u64
//! col_names   : col_count * (u32 len, len bytes UTF-8)
//! q           : sparse matrix (see below)
//! pi0         : u64 len, len * f64
//! pi          : u64 len, len * f64
//! theta       : u64 len, len * f64
//! x_hat       : sparse matrix (see below)
//! ```
//!
//! A sparse matrix is serialized as `rows: u64, cols: u64, nnz: u64`
//! followed by `nnz` triplets of `(row: u64, col: u64, value: f64)`.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::matrix::SparseMatrix;

const MAGIC: &[u8; 8] = b"TELECKPT";
const VERSION: u32 = 1;

/// Full EM state captured at a point in the run: row and column names, the
/// rescaled score matrix, the mixture proportions, the reassignment
/// parameter, and the current posterior.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Fragment names, in row-index order.
    pub row_names: Vec<String>,
    /// Locus identifiers, in column-index order.
    pub col_names: Vec<String>,
    /// Rescaled, exponentiated score matrix.
    pub q: SparseMatrix,
    /// Mixture proportions after iteration 0.
    pub pi0: Vec<f64>,
    /// Mixture proportions at the point of the snapshot.
    pub pi: Vec<f64>,
    /// Reassignment parameter at the point of the snapshot.
    pub theta: Vec<f64>,
    /// Per-fragment posterior distribution at the point of the snapshot.
    pub x_hat: SparseMatrix,
}

fn write_string(w: &mut impl Write, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)
}

fn read_string(r: &mut impl Read) -> io::Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_f64_vec(w: &mut impl Write, v: &[f64]) -> io::Result<()> {
    w.write_u64::<LittleEndian>(v.len() as u64)?;
    for &x in v {
        w.write_f64::<LittleEndian>(x)?;
    }
    Ok(())
}

fn read_f64_vec(r: &mut impl Read) -> io::Result<Vec<f64>> {
    let len = r.read_u64::<LittleEndian>()? as usize;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(r.read_f64::<LittleEndian>()?);
    }
    Ok(out)
}

fn write_matrix(w: &mut impl Write, m: &SparseMatrix) -> io::Result<()> {
    w.write_u64::<LittleEndian>(m.rows() as u64)?;
    w.write_u64::<LittleEndian>(m.cols() as u64)?;
    w.write_u64::<LittleEndian>(m.nnz() as u64)?;
    for (row, col, val) in m.triplets() {
        w.write_u64::<LittleEndian>(row as u64)?;
        w.write_u64::<LittleEndian>(col as u64)?;
        w.write_f64::<LittleEndian>(val)?;
    }
    Ok(())
}

fn read_matrix(r: &mut impl Read) -> io::Result<SparseMatrix> {
    let rows = r.read_u64::<LittleEndian>()? as usize;
    let cols = r.read_u64::<LittleEndian>()? as usize;
    let nnz = r.read_u64::<LittleEndian>()? as usize;
    let mut triplets = Vec::with_capacity(nnz);
    for _ in 0..nnz {
        let row = r.read_u64::<LittleEndian>()? as usize;
        let col = r.read_u64::<LittleEndian>()? as usize;
        let val = r.read_f64::<LittleEndian>()?;
        triplets.push((row, col, val));
    }
    Ok(SparseMatrix::from_triplets(rows, cols, triplets))
}

impl Checkpoint {
    /// Serialize this checkpoint to `w` in the layout documented above.
    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;

        w.write_u64::<LittleEndian>(self.row_names.len() as u64)?;
        for name in &self.row_names {
            write_string(w, name)?;
        }
        w.write_u64::<LittleEndian>(self.col_names.len() as u64)?;
        for name in &self.col_names {
            write_string(w, name)?;
        }

        write_matrix(w, &self.q)?;
        write_f64_vec(w, &self.pi0)?;
        write_f64_vec(w, &self.pi)?;
        write_f64_vec(w, &self.theta)?;
        write_matrix(w, &self.x_hat)?;
        Ok(())
    }

    /// Deserialize a checkpoint previously written by [`Checkpoint::write`].
    /// Fails with [`io::ErrorKind::InvalidData`] if the magic bytes or
    /// version don't match; the old pickle-based format from the original
    /// tool is not accepted here.
    pub fn read(r: &mut impl Read) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a telescope-rs checkpoint"));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported checkpoint version {version}"),
            ));
        }

        let nr = r.read_u64::<LittleEndian>()? as usize;
        let mut row_names = Vec::with_capacity(nr);
        for _ in 0..nr {
            row_names.push(read_string(r)?);
        }
        let nc = r.read_u64::<LittleEndian>()? as usize;
        let mut col_names = Vec::with_capacity(nc);
        for _ in 0..nc {
            col_names.push(read_string(r)?);
        }

        let q = read_matrix(r)?;
        let pi0 = read_f64_vec(r)?;
        let pi = read_f64_vec(r)?;
        let theta = read_f64_vec(r)?;
        let x_hat = read_matrix(r)?;

        Ok(Self { row_names, col_names, q, pi0, pi, theta, x_hat })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            row_names: vec!["read1".to_string(), "read2".to_string()],
            col_names: vec!["A".to_string(), "B".to_string()],
            q: SparseMatrix::from_triplets(2, 2, vec![(0, 0, 1.0), (1, 0, 0.5), (1, 1, 0.5)]),
            pi0: vec![0.5, 0.5],
            pi: vec![0.9, 0.1],
            theta: vec![0.6, 0.4],
            x_hat: SparseMatrix::from_triplets(2, 2, vec![(0, 0, 1.0), (1, 0, 0.9), (1, 1, 0.1)]),
        }
    }

    // checkpoint -> load -> checkpoint is byte-identical.
    #[test]
    fn round_trip_is_byte_identical() {
        let ckpt = sample();
        let mut buf = Vec::new();
        ckpt.write(&mut buf).unwrap();

        let loaded = Checkpoint::read(&mut &buf[..]).unwrap();
        let mut buf2 = Vec::new();
        loaded.write(&mut buf2).unwrap();

        assert_eq!(buf, buf2);
    }

    #[test]
    fn round_trip_preserves_values() {
        let ckpt = sample();
        let mut buf = Vec::new();
        ckpt.write(&mut buf).unwrap();
        let loaded = Checkpoint::read(&mut &buf[..]).unwrap();

        assert_eq!(loaded.row_names, ckpt.row_names);
        assert_eq!(loaded.col_names, ckpt.col_names);
        assert_eq!(loaded.pi, ckpt.pi);
        assert_eq!(loaded.theta, ckpt.theta);
        assert_eq!(loaded.q.triplets().collect::<Vec<_>>(), ckpt.q.triplets().collect::<Vec<_>>());
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 16];
        assert!(Checkpoint::read(&mut &buf[..]).is_err());
    }
}
