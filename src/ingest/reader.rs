//! BAM-backed alignment ingest: an abstract reader that yields groups of
//! segments sharing a fragment name.

use std::collections::HashMap;
use std::path::Path;

use rust_htslib::bam::{self, Read as _};

use crate::annotation::AnnotationIndex;
use crate::error::CoreError;
use crate::ingest::{
    attach_loci, best_per_locus, build_candidates, classify, AlternateCounts, Candidate,
    FragmentOutcome, IngestStats, SegmentView, PROGRESS_INTERVAL,
};

/// Append-only store of the BAM records backing every candidate alignment,
/// so fragments can be re-tagged for the updated-alignment output without
/// building a pointer graph. Dropped entirely when
/// the updated-alignment stream is not requested.
#[derive(Debug, Default)]
pub struct FragmentStore {
    records: Vec<bam::Record>,
}

impl FragmentStore {
    fn push(&mut self, record: bam::Record) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    /// Look up a previously stored record by its handle.
    pub fn get(&self, handle: usize) -> &bam::Record {
        &self.records[handle]
    }

    /// Mutable access, used when rewriting tags/mapq before re-emission.
    pub fn get_mut(&mut self, handle: usize) -> &mut bam::Record {
        &mut self.records[handle]
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct BamSegment<'a>(&'a bam::Record);

fn aux_i32(record: &bam::Record, tag: &[u8]) -> i32 {
    use rust_htslib::bam::record::Aux;
    match record.aux(tag) {
        Ok(Aux::I8(v)) => v as i32,
        Ok(Aux::U8(v)) => v as i32,
        Ok(Aux::I16(v)) => v as i32,
        Ok(Aux::U16(v)) => v as i32,
        Ok(Aux::I32(v)) => v,
        Ok(Aux::U32(v)) => v as i32,
        _ => 0,
    }
}

impl SegmentView for BamSegment<'_> {
    fn ref_id(&self) -> i32 {
        self.0.tid()
    }
    fn ref_start(&self) -> i64 {
        self.0.pos()
    }
    fn ref_end(&self) -> i64 {
        self.0.cigar().end_pos()
    }
    fn score(&self) -> i32 {
        aux_i32(self.0, b"AS")
    }
    fn query_len(&self) -> i32 {
        self.0.seq_len() as i32
    }
    fn is_unmapped(&self) -> bool {
        self.0.is_unmapped()
    }
    fn is_secondary(&self) -> bool {
        self.0.is_secondary()
    }
    fn is_paired(&self) -> bool {
        self.0.is_paired()
    }
    fn is_first_in_template(&self) -> bool {
        self.0.is_first_in_template()
    }
}

/// Group consecutive BAM records sharing a query name. Assumes the input is
/// already name-grouped (name-sorted or collated); a stream
/// that regroups out of order is not detected here and must be sorted
/// upstream by the caller, exactly as the specification assumes.
struct FragmentGroups<'a> {
    reader: &'a mut bam::Reader,
    pending: Option<bam::Record>,
    done: bool,
}

impl<'a> FragmentGroups<'a> {
    fn new(reader: &'a mut bam::Reader) -> Self {
        Self { reader, pending: None, done: false }
    }

    fn next_record(&mut self) -> Result<Option<bam::Record>, CoreError> {
        let mut record = bam::Record::new();
        match self.reader.read(&mut record) {
            Some(Ok(())) => Ok(Some(record)),
            Some(Err(e)) => Err(CoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
            None => Ok(None),
        }
    }
}

impl Iterator for FragmentGroups<'_> {
    type Item = Result<(String, Vec<bam::Record>), CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let first = match self.pending.take() {
            Some(r) => r,
            None => match self.next_record() {
                Ok(Some(r)) => r,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => return Some(Err(e)),
            },
        };
        let name = String::from_utf8_lossy(first.qname()).into_owned();
        let mut group = vec![first];
        loop {
            match self.next_record() {
                Ok(Some(r)) => {
                    let rname = String::from_utf8_lossy(r.qname()).into_owned();
                    if rname == name {
                        group.push(r);
                    } else {
                        self.pending = Some(r);
                        break;
                    }
                }
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok((name, group)))
    }
}

/// A fragment retained in memory for the updated-alignment output: its
/// name and full, locus-tagged candidate list (handles index into the
/// [`FragmentStore`] owned by the same [`BamIngester`]).
#[derive(Debug, Clone)]
pub struct FragmentRecord {
    /// Fragment (read/read-pair) name.
    pub name: String,
    /// All candidate alignments, each already tagged with its resolved
    /// locus (or `None`).
    pub candidates: Vec<Candidate<usize>>,
}

/// Result of a full ingest pass.
pub struct IngestOutput {
    /// Fragment names in first-encounter (row) order. Only mapped
    /// fragments get a row.
    pub row_names: Vec<String>,
    /// `(row, col, value)` triplets feeding [`crate::matrix::SparseMatrix`].
    pub triplets: Vec<(usize, usize, f64)>,
    /// Per-stage fragment counters.
    pub stats: IngestStats,
    /// Diagnostic-only per-locus tallies.
    pub alt_counts: AlternateCounts,
    /// Retained fragment records, present only when the updated-alignment
    /// output was requested.
    pub fragments: Option<Vec<FragmentRecord>>,
    /// Retained backing BAM records, present only alongside `fragments`.
    pub store: Option<FragmentStore>,
    /// BAM header, needed to open the updated-alignment writer.
    pub header: bam::Header,
}

/// Drive a full ingest pass over a name-grouped BAM/SAM/CRAM file.
pub struct BamIngester;

impl BamIngester {
    /// Ingest `bam_path` against `annotation`, optionally retaining
    /// fragment records for the updated-alignment output.
    pub fn run(
        bam_path: impl AsRef<Path>,
        annotation: &impl AnnotationIndex,
        keep_fragments: bool,
        mut on_progress: impl FnMut(&IngestStats),
    ) -> Result<IngestOutput, CoreError> {
        let mut reader = bam::Reader::from_path(bam_path)?;
        let header = bam::Header::from_template(reader.header());
        let ref_names: Vec<String> = reader
            .header()
            .target_names()
            .iter()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .collect();

        let mut row_index: HashMap<String, usize> = HashMap::new();
        let mut row_names: Vec<String> = Vec::new();
        let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
        let mut stats = IngestStats::default();
        let mut alt_counts = AlternateCounts::default();
        let mut store = FragmentStore::default();
        let mut fragments: Vec<FragmentRecord> = Vec::new();

        for group in FragmentGroups::new(&mut reader) {
            let (name, records) = group?;
            let any_unmapped = records.iter().any(|r| r.is_unmapped());
            let views: Vec<BamSegment> = records.iter().map(BamSegment).collect();

            let handles: Vec<usize> = if keep_fragments {
                records.iter().cloned().map(|r| store.push(r)).collect()
            } else {
                (0..records.len()).collect()
            };

            let mut candidates = build_candidates(&name, &views, |i| handles[i])?;
            attach_loci(&name, &mut candidates, &ref_names, annotation)?;

            match classify(any_unmapped, candidates) {
                FragmentOutcome::Unmapped => stats.unmapped += 1,
                FragmentOutcome::NoFeature => stats.nofeat += 1,
                FragmentOutcome::Mapped(candidates) => {
                    stats.mapped += 1;
                    let row = *row_index.entry(name.clone()).or_insert_with(|| {
                        row_names.push(name.clone());
                        row_names.len() - 1
                    });

                    let resolved_in_order: Vec<(String, bool)> = candidates
                        .iter()
                        .filter_map(|c| c.locus.clone().map(|l| (l, c.is_secondary)))
                        .collect();
                    alt_counts.observe(&resolved_in_order);

                    let best = best_per_locus(&candidates);
                    for (locus, &idx) in &best {
                        let col = annotation.column_index(locus).expect("locus must be indexed");
                        triplets.push((row, col, candidates[idx].score_plus_len() as f64));
                    }

                    if keep_fragments {
                        fragments.push(FragmentRecord { name: name.clone(), candidates });
                    }
                }
            }

            if stats.total() % PROGRESS_INTERVAL == 0 {
                on_progress(&stats);
            }
        }
        on_progress(&stats);

        Ok(IngestOutput {
            row_names,
            triplets,
            stats,
            alt_counts,
            fragments: keep_fragments.then_some(fragments),
            store: keep_fragments.then_some(store),
            header,
        })
    }
}
