//! GTF record parsing: 9-field tab-separated annotation stream.

use std::collections::HashMap;
use std::io::BufRead;

use crate::error::CoreError;

/// A single parsed GTF record, coordinates still 1-based inclusive as read
/// from the file. Conversion to the core's half-open convention happens in
/// [`crate::annotation::SortedArrayIndex::build`].
#[derive(Debug, Clone)]
pub struct GtfRecord {
    /// Chromosome/contig name (column 1).
    pub chrom: String,
    /// Start coordinate, 1-based inclusive (column 4).
    pub start: i64,
    /// End coordinate, 1-based inclusive (column 5).
    pub end: i64,
    /// Parsed `key "value";` attribute pairs (column 9).
    pub attributes: HashMap<String, String>,
}

/// Parse the `key "value"; key2 "value2";` attribute column into a map.
///
/// Hand-rolled scanner rather than a regex dependency: walk whitespace,
/// grab the bareword key, then the quoted value up to the next `"`, then
/// skip the trailing `;`.
fn parse_attributes(field: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b';' {
            i += 1;
        }
        let key = field[key_start..i].trim();
        if key.is_empty() {
            i += 1;
            continue;
        }
        if i >= bytes.len() || bytes[i] != b'"' {
            // No quoted value followed this key; skip to next ';'.
            while i < bytes.len() && bytes[i] != b';' {
                i += 1;
            }
            i += 1;
            continue;
        }
        i += 1; // skip opening quote
        let val_start = i;
        while i < bytes.len() && bytes[i] != b'"' {
            i += 1;
        }
        let value = &field[val_start..i];
        attrs.insert(key.to_string(), value.to_string());
        i += 1; // skip closing quote
        while i < bytes.len() && bytes[i] != b';' {
            i += 1;
        }
        i += 1; // skip ';'
    }
    attrs
}

/// Parse a single non-comment GTF line into a [`GtfRecord`].
pub fn parse_line(line: &str, line_no: usize) -> Result<GtfRecord, CoreError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 9 {
        return Err(CoreError::MalformedAnnotation {
            chrom: String::new(),
            start: 0,
            end: 0,
            reason: format!("line {line_no}: expected 9 tab-separated fields, found {}", fields.len()),
        });
    }
    let chrom = fields[0].to_string();
    let start: i64 = fields[3].parse().map_err(|_| CoreError::MalformedAnnotation {
        chrom: chrom.clone(),
        start: 0,
        end: 0,
        reason: format!("line {line_no}: non-integer start '{}'", fields[3]),
    })?;
    let end: i64 = fields[4].parse().map_err(|_| CoreError::MalformedAnnotation {
        chrom: chrom.clone(),
        start,
        end: 0,
        reason: format!("line {line_no}: non-integer end '{}'", fields[4]),
    })?;
    if start > end {
        return Err(CoreError::MalformedAnnotation {
            chrom,
            start,
            end,
            reason: format!("line {line_no}: inverted interval (start > end)"),
        });
    }
    let attributes = parse_attributes(fields[8]);
    Ok(GtfRecord { chrom, start, end, attributes })
}

/// Read all non-comment, non-blank records from a GTF stream.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<GtfRecord>, CoreError> {
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        records.push(parse_line(&line, line_no + 1)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_record() {
        let line = "chr1\tRepeatMasker\texon\t101\t200\t.\t+\t.\tlocus \"L1HS_1\"; family \"L1\";";
        let rec = parse_line(line, 1).unwrap();
        assert_eq!(rec.chrom, "chr1");
        assert_eq!(rec.start, 101);
        assert_eq!(rec.end, 200);
        assert_eq!(rec.attributes.get("locus").map(String::as_str), Some("L1HS_1"));
        assert_eq!(rec.attributes.get("family").map(String::as_str), Some("L1"));
    }

    #[test]
    fn rejects_inverted_interval() {
        let line = "chr1\tsrc\texon\t200\t100\t.\t+\t.\tlocus \"X\";";
        assert!(parse_line(line, 1).is_err());
    }

    #[test]
    fn rejects_non_integer_coordinate() {
        let line = "chr1\tsrc\texon\tNaN\t100\t.\t+\t.\tlocus \"X\";";
        assert!(parse_line(line, 1).is_err());
    }

    #[test]
    fn attributes_without_key_are_ignored() {
        let attrs = parse_attributes("locus \"A\"; ; gene_id \"G1\";");
        assert_eq!(attrs.len(), 2);
    }
}
