//! Updated-alignment output: re-tag every candidate alignment of a fragment
//! with its posterior probability, resolved/best locus, and a confidence
//! color, mirroring `telescope_id.py`'s `update_alignment`. Grounded on the
//! teacher's BAM writer helper (`genomics/io.rs`'s `create_bam_writer`) for
//! header/writer setup.

use std::path::Path;

use rust_htslib::bam::{self, record::Aux, Read as _};

use crate::annotation::AnnotationIndex;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::ingest::{best_per_locus, FragmentRecord, FragmentStore};
use crate::matrix::SparseMatrix;

/// Conventional SAM/BAM mapping-quality ceiling; the configured maximum the
/// Phred-scaled posterior is capped at.
pub const MAX_MAPQ: u8 = 93;

const BAM_FSECONDARY: u16 = 0x100;

/// `-10 * log10(1 - p)`, capped at `cap` and floored at 0.
pub fn phred_mapq(p: f64, cap: u8) -> u8 {
    if p >= 1.0 {
        return cap;
    }
    let q = -10.0 * (1.0 - p).log10();
    if !q.is_finite() || q < 0.0 {
        0
    } else {
        q.round().min(cap as f64) as u8
    }
}

/// `YC` tag color code: a confidence classification rendered as an RGB
/// triple, the way the original tool renders `DARK2_PALETTE` colors into
/// the `YC` SAM tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceColor {
    /// Exactly one surviving locus, probability ≥ `conf_prob`.
    HighConfidence,
    /// Exactly one surviving locus, probability < `conf_prob`.
    LowConfidence,
    /// More than one surviving locus.
    Ambiguous,
    /// Secondary alignment of the primary locus, or any alignment of a
    /// non-primary locus.
    Neutral,
}

impl ConfidenceColor {
    fn as_rgb(self) -> &'static str {
        match self {
            ConfidenceColor::HighConfidence => "213,94,0",
            ConfidenceColor::LowConfidence => "240,228,66",
            ConfidenceColor::Ambiguous => "0,158,115",
            ConfidenceColor::Neutral => "200,200,200",
        }
    }
}

/// Writes the updated-alignment BAM stream for a full ingest pass.
pub struct UpdatedAlignmentWriter {
    writer: bam::Writer,
}

impl UpdatedAlignmentWriter {
    /// Open `path` for writing, reusing the source alignment's header.
    pub fn create(path: impl AsRef<Path>, header: &bam::Header) -> Result<Self, CoreError> {
        let writer = bam::Writer::from_path(path, header, bam::Format::Bam)
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        Ok(Self { writer })
    }

    /// Re-tag and write every candidate alignment of one fragment.
    ///
    /// `row` is this fragment's row index into `x_hat`. Fragments with no
    /// locus surviving `min_prob` are skipped entirely (nothing written).
    pub fn write_fragment(
        &mut self,
        row: usize,
        fragment: &FragmentRecord,
        x_hat: &SparseMatrix,
        annotation: &impl AnnotationIndex,
        store: &FragmentStore,
        config: &CoreConfig,
    ) -> Result<(), CoreError> {
        let locus_ids = annotation.locus_ids();
        let mut survivors: Vec<(String, f64)> = x_hat
            .row(row)
            .filter(|&(_, p)| p >= config.min_prob)
            .map(|(col, p)| (locus_ids[col].clone(), p))
            .collect();
        survivors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let Some((best_locus, best_prob)) = survivors.first().cloned() else {
            return Ok(());
        };

        // When multiple surviving loci exist, each individual probability is
        // strictly less than conf_prob.
        let color = if survivors.len() == 1 {
            if best_prob >= config.conf_prob {
                ConfidenceColor::HighConfidence
            } else {
                ConfidenceColor::LowConfidence
            }
        } else {
            ConfidenceColor::Ambiguous
        };

        let best_candidate_idx = best_per_locus(&fragment.candidates);

        for (idx, candidate) in fragment.candidates.iter().enumerate() {
            let Some(locus) = candidate.locus.as_ref() else { continue };
            let is_locus_best = best_candidate_idx.get(locus) == Some(&idx);
            let is_primary = is_locus_best && *locus == best_locus;

            for &handle in &candidate.handles {
                let mut rec = store.get(handle).clone();

                let flags = rec.flags();
                if is_primary {
                    rec.set_mapq(phred_mapq(best_prob, MAX_MAPQ));
                    rec.set_flags(flags & !BAM_FSECONDARY);
                } else {
                    rec.set_mapq(0);
                    rec.set_flags(flags | BAM_FSECONDARY);
                }

                let xp = if is_primary { (best_prob * 100.0).round() as i32 } else { 0 };
                let yc = if is_primary { color } else { ConfidenceColor::Neutral };

                for tag in [b"XP".as_slice(), b"XT", b"ZT", b"YC"] {
                    let _ = rec.remove_aux(tag);
                }
                rec.push_aux(b"XP", Aux::I32(xp)).map_err(push_err(&fragment.name))?;
                rec.push_aux(b"XT", Aux::String(locus)).map_err(push_err(&fragment.name))?;
                rec.push_aux(b"ZT", Aux::String(&best_locus)).map_err(push_err(&fragment.name))?;
                rec.push_aux(b"YC", Aux::String(yc.as_rgb())).map_err(push_err(&fragment.name))?;

                self.writer.write(&rec).map_err(|e| CoreError::OutputIoFailure {
                    fragment: fragment.name.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                })?;
            }
        }
        Ok(())
    }
}

fn push_err(fragment: &str) -> impl Fn(rust_htslib::errors::Error) -> CoreError + '_ {
    move |e| CoreError::OutputIoFailure {
        fragment: fragment.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phred_mapq_caps_and_floors() {
        assert_eq!(phred_mapq(1.0, MAX_MAPQ), MAX_MAPQ);
        assert_eq!(phred_mapq(0.0, MAX_MAPQ), 0);
        // p = 0.9 -> -10*log10(0.1) = 10
        assert_eq!(phred_mapq(0.9, MAX_MAPQ), 10);
        // extremely close to 1 should cap rather than overflow u8.
        assert_eq!(phred_mapq(1.0 - 1e-12, 60), 60);
    }
}
