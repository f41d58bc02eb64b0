//! Position/interval → locus lookup.

use std::collections::BinaryHeap;
use std::collections::HashMap;

use crate::annotation::gtf::GtfRecord;
use crate::error::CoreError;

/// A named genomic feature, possibly spanning multiple intervals on one
/// chromosome. Coordinates are half-open (`[start, end)`).
#[derive(Debug, Clone)]
pub struct Locus {
    /// Locus identifier.
    pub id: String,
    /// Chromosome this locus's intervals live on.
    pub chrom: String,
    /// Intervals in GTF-record insertion order (not necessarily sorted).
    pub intervals: Vec<(i64, i64)>,
}

impl Locus {
    fn length(&self) -> i64 {
        self.intervals.iter().map(|(s, e)| e - s).sum()
    }
}

/// Read-only lookup interface from genomic position/interval to locus.
///
/// A single trait with one canonical implementation ([`SortedArrayIndex`]);
/// an interval-tree backend is a possible future alternative but is not
/// shipped here.
pub trait AnnotationIndex {
    /// Look up the locus overlapping a single point, half-open semantics.
    ///
    /// Fails with [`CoreError::MalformedAnnotation`] if the matching window
    /// is not a singleton rather than silently picking one or panicking.
    fn lookup_point(&self, chrom: &str, pos: i64) -> Result<Option<&str>, CoreError>;

    /// Look up the locus overlapping an interval `[s, e)`, tie-breaking on
    /// overlap size when both endpoints resolve to different loci.
    fn lookup_interval(&self, chrom: &str, s: i64, e: i64) -> Result<Option<&str>, CoreError>;

    /// Sum of interval lengths for a locus.
    fn feature_length(&self, locus_id: &str) -> Option<i64>;

    /// Dense column index for a locus, assigned in first-encounter order
    /// from the annotation file.
    fn column_index(&self, locus_id: &str) -> Option<usize>;

    /// Number of distinct loci (the matrix's `T` dimension).
    fn locus_count(&self) -> usize;

    /// Locus identifiers ordered by column index.
    fn locus_ids(&self) -> &[String];
}

/// Per-chromosome sorted-array backend.
#[derive(Debug, Default)]
pub struct SortedArrayIndex {
    loci: Vec<Locus>,
    id_to_idx: HashMap<String, usize>,
    // Per-chromosome intervals sorted by start: (start, end, locus_idx).
    by_chrom: HashMap<String, Vec<(i64, i64, usize)>>,
    // Per-chromosome start/end arrays, precomputed once at build time in the
    // same order as `by_chrom`'s intervals, so `lookup_point` can bisect
    // directly instead of re-deriving them on every call.
    bisect_arrays: HashMap<String, (Vec<i64>, Vec<i64>)>,
    // Locus ids in column-index order; `ordered_ids[i] == loci[i].id`.
    ordered_ids: Vec<String>,
}

impl SortedArrayIndex {
    /// Build the index from a stream of GTF records.
    ///
    /// `attr_name` selects which attribute carries locus identity; records
    /// lacking it get a synthetic id `TELE%04d` keyed by their position in
    /// the input stream. Coordinates are converted from the GTF file's
    /// 1-based inclusive convention to the core's half-open convention here.
    pub fn build(records: &[GtfRecord], attr_name: &str) -> Result<Self, CoreError> {
        let mut loci: Vec<Locus> = Vec::new();
        let mut id_to_idx: HashMap<String, usize> = HashMap::new();
        let mut by_chrom: HashMap<String, Vec<(i64, i64, usize)>> = HashMap::new();

        for (i, rec) in records.iter().enumerate() {
            let locus_id = rec
                .attributes
                .get(attr_name)
                .cloned()
                .unwrap_or_else(|| format!("TELE{:04}", i));

            // Half-open conversion: 1-based inclusive [start, end] -> [start-1, end).
            let hstart = rec.start - 1;
            let hend = rec.end;

            let idx = *id_to_idx.entry(locus_id.clone()).or_insert_with(|| {
                loci.push(Locus {
                    id: locus_id.clone(),
                    chrom: rec.chrom.clone(),
                    intervals: Vec::new(),
                });
                loci.len() - 1
            });
            loci[idx].intervals.push((hstart, hend));

            by_chrom
                .entry(rec.chrom.clone())
                .or_default()
                .push((hstart, hend, idx));
        }

        for intervals in by_chrom.values_mut() {
            intervals.sort_by_key(|(s, _, _)| *s);
        }

        check_no_cross_locus_overlap(&by_chrom)?;

        let bisect_arrays = by_chrom
            .iter()
            .map(|(chrom, intervals)| {
                let starts = intervals.iter().map(|(s, _, _)| *s).collect();
                let ends = intervals.iter().map(|(_, e, _)| *e).collect();
                (chrom.clone(), (starts, ends))
            })
            .collect();

        let ordered_ids = loci.iter().map(|l| l.id.clone()).collect();
        Ok(Self { loci, id_to_idx, by_chrom, bisect_arrays, ordered_ids })
    }
}

/// Sweep intervals sorted by start within each chromosome and verify that no
/// two intervals belonging to *different* loci overlap.
fn check_no_cross_locus_overlap(
    by_chrom: &HashMap<String, Vec<(i64, i64, usize)>>,
) -> Result<(), CoreError> {
    for (chrom, intervals) in by_chrom {
        // Min-heap on end, ordered ascending via Reverse.
        let mut active: BinaryHeap<std::cmp::Reverse<(i64, usize)>> = BinaryHeap::new();
        for &(start, end, locus_idx) in intervals {
            while let Some(&std::cmp::Reverse((top_end, _))) = active.peek() {
                if top_end <= start {
                    active.pop();
                } else {
                    break;
                }
            }
            for &std::cmp::Reverse((_, other_locus)) in active.iter() {
                if other_locus != locus_idx {
                    return Err(CoreError::MalformedAnnotation {
                        chrom: chrom.clone(),
                        start,
                        end,
                        reason: "interval overlaps a different locus on the same chromosome"
                            .to_string(),
                    });
                }
            }
            active.push(std::cmp::Reverse((end, locus_idx)));
        }
    }
    Ok(())
}

impl AnnotationIndex for SortedArrayIndex {
    fn lookup_point(&self, chrom: &str, pos: i64) -> Result<Option<&str>, CoreError> {
        let Some(intervals) = self.by_chrom.get(chrom) else { return Ok(None) };
        let (starts, ends) = &self.bisect_arrays[chrom];

        // sidx: first index with start > pos.
        let sidx = starts.partition_point(|&s| s <= pos);
        // eidx: first index with end >= pos.
        let eidx = ends.partition_point(|&e| e < pos);

        if eidx >= sidx {
            return Ok(None);
        }
        let window = &intervals[eidx..sidx];
        match window.len() {
            0 => Ok(None),
            1 => Ok(Some(self.loci[window[0].2].id.as_str())),
            _ => Err(CoreError::MalformedAnnotation {
                chrom: chrom.to_string(),
                start: pos,
                end: pos,
                reason: "point lookup matched more than one interval".to_string(),
            }),
        }
    }

    fn lookup_interval(&self, chrom: &str, s: i64, e: i64) -> Result<Option<&str>, CoreError> {
        let feat_l = self.lookup_point(chrom, s)?;
        let feat_r = self.lookup_point(chrom, e)?;

        match (feat_l, feat_r) {
            (None, None) => Ok(None),
            (Some(l), None) => Ok(Some(l)),
            (None, Some(r)) => Ok(Some(r)),
            (Some(l), Some(r)) if l == r => Ok(Some(l)),
            (Some(l), Some(r)) => {
                let locus_l = &self.loci[self.id_to_idx[l]];
                let locus_r = &self.loci[self.id_to_idx[r]];
                // Tie-break heuristic from the original: last interval of the
                // left locus, first interval of the right locus.
                let (_, end_l) = *locus_l.intervals.last().unwrap();
                let (start_r, _) = locus_r.intervals[0];
                let overlap_l = end_l - s;
                let overlap_r = e - start_r;
                if overlap_l >= overlap_r {
                    Ok(Some(l))
                } else {
                    Ok(Some(r))
                }
            }
        }
    }

    fn feature_length(&self, locus_id: &str) -> Option<i64> {
        let idx = *self.id_to_idx.get(locus_id)?;
        Some(self.loci[idx].length())
    }

    fn column_index(&self, locus_id: &str) -> Option<usize> {
        self.id_to_idx.get(locus_id).copied()
    }

    fn locus_count(&self) -> usize {
        self.loci.len()
    }

    fn locus_ids(&self) -> &[String] {
        &self.ordered_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::gtf::parse_line;

    fn build(lines: &[&str]) -> SortedArrayIndex {
        let records: Vec<_> = lines
            .iter()
            .enumerate()
            .map(|(i, l)| parse_line(l, i + 1).unwrap())
            .collect();
        SortedArrayIndex::build(&records, "locus").unwrap()
    }

    #[test]
    fn point_lookup_resolves_unique_locus() {
        let idx = build(&[
            "chr1\tsrc\texon\t101\t200\t.\t+\t.\tlocus \"A\";",
            "chr1\tsrc\texon\t301\t400\t.\t+\t.\tlocus \"B\";",
        ]);
        assert_eq!(idx.lookup_point("chr1", 150).unwrap(), Some("A"));
        assert_eq!(idx.lookup_point("chr1", 350).unwrap(), Some("B"));
        assert_eq!(idx.lookup_point("chr1", 250).unwrap(), None);
    }

    #[test]
    fn interval_lookup_ties_break_to_larger_overlap() {
        let idx = build(&[
            "chr1\tsrc\texon\t101\t200\t.\t+\t.\tlocus \"A\";",
            "chr1\tsrc\texon\t301\t400\t.\t+\t.\tlocus \"B\";",
        ]);
        // half-open A=[100,200) B=[300,400); query [180,320)
        assert_eq!(idx.lookup_interval("chr1", 180, 320).unwrap(), Some("A"));
    }

    #[test]
    fn feature_length_sums_intervals() {
        let idx = build(&[
            "chr1\tsrc\texon\t101\t200\t.\t+\t.\tlocus \"L1\";",
            "chr1\tsrc\texon\t501\t600\t.\t+\t.\tlocus \"L1\";",
        ]);
        assert_eq!(idx.feature_length("L1"), Some(200));
    }

    #[test]
    fn synthetic_id_assigned_when_attribute_missing() {
        let idx = build(&["chr1\tsrc\texon\t1\t10\t.\t+\t.\tgene_id \"G\";"]);
        assert_eq!(idx.lookup_point("chr1", 5).unwrap(), Some("TELE0000"));
    }

    #[test]
    fn cross_locus_overlap_is_rejected() {
        let records: Vec<_> = [
            "chr1\tsrc\texon\t1\t100\t.\t+\t.\tlocus \"A\";",
            "chr1\tsrc\texon\t50\t150\t.\t+\t.\tlocus \"B\";",
        ]
        .iter()
        .enumerate()
        .map(|(i, l)| parse_line(l, i + 1).unwrap())
        .collect();
        assert!(SortedArrayIndex::build(&records, "locus").is_err());
    }

    #[test]
    fn same_locus_overlap_is_permitted() {
        let idx = build(&[
            "chr1\tsrc\texon\t1\t100\t.\t+\t.\tlocus \"A\";",
            "chr1\tsrc\texon\t50\t150\t.\t+\t.\tlocus \"A\";",
        ]);
        // pos 10 falls in [0,100) only, so the windowing trick sees a
        // singleton window even though the locus has two stored intervals.
        assert_eq!(idx.lookup_point("chr1", 10).unwrap(), Some("A"));
    }

    // The bisect windowing trick can't distinguish "ambiguous" from
    // "multiple intervals of one locus both cover this point"; it errors
    // either way rather than silently guessing.
    #[test]
    fn ambiguous_window_surfaces_as_malformed_annotation() {
        let idx = build(&[
            "chr1\tsrc\texon\t1\t100\t.\t+\t.\tlocus \"A\";",
            "chr1\tsrc\texon\t50\t150\t.\t+\t.\tlocus \"A\";",
        ]);
        assert!(idx.lookup_point("chr1", 75).is_err());
    }
}
