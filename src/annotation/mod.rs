//! Annotation index: position/interval → locus lookup.

mod gtf;
mod index;

pub use gtf::{read_records, GtfRecord};
pub use index::{AnnotationIndex, Locus, SortedArrayIndex};
