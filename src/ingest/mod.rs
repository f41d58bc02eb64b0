//! Alignment ingester: group segments by fragment, assign to loci, retain
//! the best alignment per (fragment, locus) pair.

mod reader;

pub use reader::{BamIngester, FragmentRecord, FragmentStore, IngestOutput};

use std::collections::HashMap;

use crate::annotation::AnnotationIndex;
use crate::error::CoreError;

/// How often (in fragments processed) the ingester reports progress.
pub const PROGRESS_INTERVAL: usize = 500_000;

/// A single aligned segment, abstracted away from any particular alignment
/// file format. `rust_htslib::bam::Record` is the only implementor shipped
/// ([`reader::BamSegment`]), but the ingest algorithm itself is generic so
/// it can be exercised with synthetic segments in tests.
pub trait SegmentView {
    /// Reference sequence this segment aligns to (tid-space, resolved to a
    /// name via the caller's reference table).
    fn ref_id(&self) -> i32;
    /// 0-based reference start coordinate.
    fn ref_start(&self) -> i64;
    /// 0-based, half-open reference end coordinate.
    fn ref_end(&self) -> i64;
    /// Alignment score (e.g. the `AS` tag).
    fn score(&self) -> i32;
    /// Aligned query length.
    fn query_len(&self) -> i32;
    /// Unmapped flag.
    fn is_unmapped(&self) -> bool;
    /// Secondary-alignment flag.
    fn is_secondary(&self) -> bool;
    /// Paired-end flag.
    fn is_paired(&self) -> bool;
    /// First-in-template ("mate 1") flag; irrelevant for single-end data.
    fn is_first_in_template(&self) -> bool;
}

/// A candidate alignment: one segment for single-end data, two mates for
/// paired-end data, with an opaque handle back to the underlying record(s).
#[derive(Debug, Clone)]
pub struct Candidate<H> {
    /// Reference id shared by the candidate's segment(s).
    pub ref_id: i32,
    /// Outer (leftmost) reference coordinate spanning all segments.
    pub outer_start: i64,
    /// Outer (rightmost) reference coordinate spanning all segments.
    pub outer_end: i64,
    /// Summed alignment score across segment(s).
    pub score: i32,
    /// Summed aligned query length across segment(s).
    pub query_len: i32,
    /// Whether any component segment is flagged secondary.
    pub is_secondary: bool,
    /// Opaque handles to the underlying record(s) (one or two).
    pub handles: Vec<H>,
    /// Locus this candidate resolved to, if any. Populated by
    /// [`attach_loci`] after construction.
    pub locus: Option<String>,
}

impl<H> Candidate<H> {
    /// Combined EM score contribution: alignment score + query length.
    pub fn score_plus_len(&self) -> i64 {
        self.score as i64 + self.query_len as i64
    }
}

/// Partition a fragment's segments into candidate alignments.
///
/// For single-end data every segment is its own candidate. For paired-end
/// data, segments are split by [`SegmentView::is_first_in_template`] into a
/// mate-1 and mate-2 list and paired up positionally (aligners that emit
/// multiple candidates, e.g. `bwa -a`, emit matched mate pairs in the same
/// relative order). A length mismatch between the two lists is a malformed
/// fragment.
pub fn build_candidates<S: SegmentView, H: Clone>(
    fragment: &str,
    segments: &[S],
    handle_for: impl Fn(usize) -> H,
) -> Result<Vec<Candidate<H>>, CoreError> {
    if segments.is_empty() {
        return Ok(Vec::new());
    }

    if !segments[0].is_paired() {
        return Ok(segments
            .iter()
            .enumerate()
            .map(|(i, s)| Candidate {
                ref_id: s.ref_id(),
                outer_start: s.ref_start(),
                outer_end: s.ref_end(),
                score: s.score(),
                query_len: s.query_len(),
                is_secondary: s.is_secondary(),
                handles: vec![handle_for(i)],
                locus: None,
            })
            .collect());
    }

    let mate1: Vec<usize> = (0..segments.len()).filter(|&i| segments[i].is_first_in_template()).collect();
    let mate2: Vec<usize> = (0..segments.len()).filter(|&i| !segments[i].is_first_in_template()).collect();

    if mate1.len() != mate2.len() {
        return Err(CoreError::MalformedAlignment {
            fragment: fragment.to_string(),
            reason: format!(
                "paired fragment has {} mate-1 and {} mate-2 segments",
                mate1.len(),
                mate2.len()
            ),
        });
    }

    let mut candidates = Vec::with_capacity(mate1.len());
    for (&i1, &i2) in mate1.iter().zip(mate2.iter()) {
        let (s1, s2) = (&segments[i1], &segments[i2]);
        if s1.ref_id() != s2.ref_id() {
            return Err(CoreError::MalformedAlignment {
                fragment: fragment.to_string(),
                reason: "mate pair aligns to different reference sequences".to_string(),
            });
        }
        candidates.push(Candidate {
            ref_id: s1.ref_id(),
            outer_start: s1.ref_start().min(s2.ref_start()),
            outer_end: s1.ref_end().max(s2.ref_end()),
            score: s1.score() + s2.score(),
            query_len: s1.query_len() + s2.query_len(),
            is_secondary: s1.is_secondary() || s2.is_secondary(),
            handles: vec![handle_for(i1), handle_for(i2)],
            locus: None,
        });
    }
    Ok(candidates)
}

/// Attach a locus (or none) to each candidate via the annotation index.
pub fn attach_loci<H>(
    fragment: &str,
    candidates: &mut [Candidate<H>],
    ref_names: &[String],
    annotation: &impl AnnotationIndex,
) -> Result<(), CoreError> {
    for c in candidates.iter_mut() {
        let chrom = ref_names.get(c.ref_id as usize).ok_or_else(|| CoreError::MalformedAlignment {
            fragment: fragment.to_string(),
            reason: format!("reference id {} out of range", c.ref_id),
        })?;
        c.locus = annotation.lookup_interval(chrom, c.outer_start, c.outer_end)?.map(str::to_string);
    }
    Ok(())
}

/// Outcome of classifying a single fragment.
pub enum FragmentOutcome<H> {
    /// Any candidate had its unmapped bit set.
    Unmapped,
    /// All candidates resolved to no locus.
    NoFeature,
    /// At least one candidate resolved; carries the full, locus-tagged
    /// candidate list for downstream best-per-locus selection.
    Mapped(Vec<Candidate<H>>),
}

/// Classify a fragment from its (locus-tagged) candidates and unmapped
/// status.
pub fn classify<H>(any_unmapped: bool, candidates: Vec<Candidate<H>>) -> FragmentOutcome<H> {
    if any_unmapped {
        return FragmentOutcome::Unmapped;
    }
    if candidates.iter().all(|c| c.locus.is_none()) {
        return FragmentOutcome::NoFeature;
    }
    FragmentOutcome::Mapped(candidates)
}

/// Running per-stage fragment counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestStats {
    /// Fragments with the unmapped bit set.
    pub unmapped: usize,
    /// Fragments mapped to the reference but not to any annotated feature.
    pub nofeat: usize,
    /// Fragments with at least one alignment resolving to a locus.
    pub mapped: usize,
}

impl IngestStats {
    /// Total fragments processed so far.
    pub fn total(&self) -> usize {
        self.unmapped + self.nofeat + self.mapped
    }
}

/// Diagnostic-only per-locus tallies supplementing the core model, grounded
/// on `telescope_id.py`'s `alternate_methods`. Not consumed by the EM
/// engine; folded into the report as trailing columns when present.
#[derive(Debug, Clone, Default)]
pub struct AlternateCounts {
    /// Count of fragments whose single resolved locus is this one.
    pub unique_counts: HashMap<String, usize>,
    /// Count of fragments whose first non-secondary candidate resolves to
    /// this locus.
    pub best_counts: HashMap<String, usize>,
}

impl AlternateCounts {
    /// Record one fragment's contribution: `resolved` are the distinct loci
    /// this fragment's candidates reached, in candidate enumeration order,
    /// paired with whether that candidate was secondary.
    pub fn observe(&mut self, resolved_in_order: &[(String, bool)]) {
        let distinct: std::collections::HashSet<&str> =
            resolved_in_order.iter().map(|(l, _)| l.as_str()).collect();
        if distinct.len() == 1 {
            let locus = resolved_in_order[0].0.clone();
            *self.unique_counts.entry(locus).or_insert(0) += 1;
        }
        if let Some((locus, _)) = resolved_in_order.iter().find(|(_, secondary)| !secondary) {
            *self.best_counts.entry(locus.clone()).or_insert(0) += 1;
        }
    }
}

/// Pick, for each locus reachable from this fragment, the best candidate by
/// `(score + query_len)`, ties broken by insertion (enumeration) order.
pub fn best_per_locus<H>(candidates: &[Candidate<H>]) -> HashMap<String, usize> {
    let mut best: HashMap<String, usize> = HashMap::new();
    for (idx, c) in candidates.iter().enumerate() {
        let Some(locus) = c.locus.as_ref() else { continue };
        match best.get(locus) {
            None => {
                best.insert(locus.clone(), idx);
            }
            Some(&cur) if c.score_plus_len() > candidates[cur].score_plus_len() => {
                best.insert(locus.clone(), idx);
            }
            _ => {}
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct FakeSegment {
        ref_id: i32,
        start: i64,
        end: i64,
        score: i32,
        qlen: i32,
        unmapped: bool,
        secondary: bool,
        paired: bool,
        first_in_template: bool,
    }

    impl SegmentView for FakeSegment {
        fn ref_id(&self) -> i32 { self.ref_id }
        fn ref_start(&self) -> i64 { self.start }
        fn ref_end(&self) -> i64 { self.end }
        fn score(&self) -> i32 { self.score }
        fn query_len(&self) -> i32 { self.qlen }
        fn is_unmapped(&self) -> bool { self.unmapped }
        fn is_secondary(&self) -> bool { self.secondary }
        fn is_paired(&self) -> bool { self.paired }
        fn is_first_in_template(&self) -> bool { self.first_in_template }
    }

    fn single(ref_id: i32, start: i64, end: i64, score: i32, qlen: i32) -> FakeSegment {
        FakeSegment { ref_id, start, end, score, qlen, unmapped: false, secondary: false, paired: false, first_in_template: false }
    }

    #[test]
    fn single_end_candidates_are_one_per_segment() {
        let segs = vec![single(0, 100, 150, 90, 50), single(0, 300, 350, 80, 50)];
        let cands = build_candidates::<_, usize>("r1", &segs, |i| i).unwrap();
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].score_plus_len(), 140);
    }

    #[test]
    fn paired_end_mismatched_mate_counts_is_malformed() {
        let mut s1 = single(0, 100, 150, 90, 50);
        s1.paired = true;
        s1.first_in_template = true;
        let segs = vec![s1];
        let err = build_candidates::<_, usize>("r1", &segs, |i| i);
        assert!(err.is_err());
    }

    #[test]
    fn best_per_locus_prefers_higher_combined_score() {
        let mut cands = build_candidates::<_, usize>(
            "r1",
            &[single(0, 100, 150, 10, 10), single(0, 100, 150, 90, 50)],
            |i| i,
        )
        .unwrap();
        cands[0].locus = Some("A".to_string());
        cands[1].locus = Some("A".to_string());
        let best = best_per_locus(&cands);
        assert_eq!(best.get("A"), Some(&1));
    }

    #[test]
    fn unmapped_fragment_short_circuits_classification() {
        let outcome = classify::<usize>(true, Vec::new());
        assert!(matches!(outcome, FragmentOutcome::Unmapped));
    }

    #[test]
    fn fragment_with_no_resolving_candidate_is_nofeat() {
        let mut cands = build_candidates::<_, usize>("r1", &[single(0, 100, 150, 10, 10)], |i| i).unwrap();
        cands[0].locus = None;
        let outcome = classify(false, cands);
        assert!(matches!(outcome, FragmentOutcome::NoFeature));
    }
}
