use crate::config::InputConfig;
use crate::error::{ParseError, PipelineError, SchemaError};
use crate::types::{Mode, RawRecord};
use csv::{ReaderBuilder, StringRecord};
use std::io::Read;
use tracing::{debug, info};

const CANDIDATE_DELIMITERS: [u8; 5] = [b',', b';', b'\t', b'|', b':'];
const SNIFF_LINES: usize = 50;

/// A parsed CSV file with named columns.
#[derive(Debug, Clone)]
pub struct CsvTable {
    headers: Vec<String>,
    rows: Vec<StringRecord>,
    delimiter: u8,
    /// Rows whose every field was blank; not kept in `rows`
    blank_rows: usize,
}

impl CsvTable {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[StringRecord] {
        &self.rows
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn blank_rows(&self) -> usize {
        self.blank_rows
    }

    /// Index of the last column with this name; earlier duplicates are ignored.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().rposition(|h| h == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub records: Vec<RawRecord>,
    pub skipped_blank: usize,
}

pub fn read_table<R: Read>(mut reader: R) -> Result<CsvTable, PipelineError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let text = String::from_utf8(bytes).map_err(|_| ParseError::Encoding)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    if text.trim().is_empty() {
        return Err(ParseError::Empty.into());
    }

    let delimiter = detect_delimiter(text)?;
    debug!("Detected delimiter {:?}", delimiter as char);
    let table = parse_with(text, delimiter)?;
    info!("Read {} rows with columns {:?}", table.rows.len(), table.headers);
    Ok(table)
}

fn detect_delimiter(text: &str) -> Result<u8, ParseError> {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SNIFF_LINES)
        .collect();
    let header = lines.first().ok_or(ParseError::Empty)?;

    let present: Vec<u8> = CANDIDATE_DELIMITERS
        .iter()
        .copied()
        .filter(|d| header.as_bytes().contains(d))
        .collect();

    // No separator at all: a single-column file
    if present.is_empty() {
        return Ok(b',');
    }

    let sample = lines.join("\n");
    let mut best: Option<(u8, usize)> = None;
    for delimiter in present {
        if let Some(width) = consistent_width(&sample, delimiter) {
            if best.map_or(true, |(_, w)| width > w) {
                best = Some((delimiter, width));
            }
        }
    }

    best.map(|(d, _)| d).ok_or(ParseError::Delimiter)
}

/// Field count shared by every sampled record, if there is one and it exceeds 1.
fn consistent_width(sample: &str, delimiter: u8) -> Option<usize> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(sample.as_bytes());

    let mut width = None;
    for result in rdr.records() {
        let len = result.ok()?.len();
        match width {
            None => width = Some(len),
            Some(w) if w != len => return None,
            Some(_) => {}
        }
    }
    width.filter(|&w| w > 1)
}

fn parse_with(text: &str, delimiter: u8) -> Result<CsvTable, ParseError> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = rdr
        .headers()
        .map_err(malformed)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    let mut blank_rows = 0;
    for result in rdr.records() {
        let record = result.map_err(malformed)?;
        if record.iter().all(|f| f.trim().is_empty()) {
            blank_rows += 1;
            continue;
        }
        if record.len() != headers.len() {
            return Err(ParseError::Malformed {
                line: record.position().map(|p| p.line()).unwrap_or(0),
                reason: format!("expected {} fields, found {}", headers.len(), record.len()),
            });
        }
        rows.push(record);
    }

    Ok(CsvTable {
        headers,
        rows,
        delimiter,
        blank_rows,
    })
}

fn malformed(err: csv::Error) -> ParseError {
    ParseError::Malformed {
        line: err.position().map(|p| p.line()).unwrap_or(0),
        reason: err.to_string(),
    }
}

/// Pulls the columns the mode needs out of the table.
pub fn extract_records(
    table: &CsvTable,
    mode: Mode,
    columns: &InputConfig,
) -> Result<Extracted, PipelineError> {
    let require = |name: &str| {
        table.column(name).ok_or_else(|| SchemaError::MissingColumn {
            column: name.to_string(),
        })
    };

    let dest_idx = match mode {
        Mode::WithinRegion => None,
        Mode::CrossRegion => Some(require(&columns.destination_column)?),
    };
    let place_idx = require(&columns.place_column)?;

    let mut extracted = Extracted {
        records: Vec::new(),
        skipped_blank: table.blank_rows(),
    };
    for row in table.rows() {
        let place = row.get(place_idx).unwrap_or("").trim();
        let destination = dest_idx.map(|i| row.get(i).unwrap_or("").trim());

        if place.is_empty() || destination.map_or(false, str::is_empty) {
            extracted.skipped_blank += 1;
            continue;
        }

        extracted.records.push(RawRecord {
            place: place.to_string(),
            destination: destination.map(str::to_string),
        });
    }

    if extracted.skipped_blank > 0 {
        info!("Skipped {} rows with a blank place", extracted.skipped_blank);
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> CsvTable {
        read_table(text.as_bytes()).unwrap()
    }

    fn places(extracted: &Extracted) -> Vec<&str> {
        extracted.records.iter().map(|r| r.place.as_str()).collect()
    }

    #[test]
    fn test_detects_comma() {
        let t = table("Nom,Ville\nA,Dijon\nB,Besançon\n");
        assert_eq!(t.delimiter(), b',');
        assert_eq!(t.headers(), &["Nom".to_string(), "Ville".to_string()]);
        assert_eq!(t.rows().len(), 2);
    }

    #[test]
    fn test_detects_semicolon_over_comma_in_values() {
        let t = table("Nom;Ville;Commentaire\nA;Dijon;un, deux\nB;Dole;trois\n");
        assert_eq!(t.delimiter(), b';');
        assert_eq!(t.headers().len(), 3);
        assert_eq!(&t.rows()[0][2], "un, deux");
    }

    #[test]
    fn test_detects_tab() {
        let t = table("Nom\tVille\nA\tDijon\n");
        assert_eq!(t.delimiter(), b'\t');
        assert_eq!(t.column("Ville"), Some(1));
    }

    #[test]
    fn test_single_column() {
        let t = table("Ville\nDijon\nDijon\nBesançon\n");
        assert_eq!(t.headers(), &["Ville".to_string()]);
        assert_eq!(t.rows().len(), 3);
    }

    #[test]
    fn test_strips_bom_and_trims_headers() {
        let t = table("\u{feff} Ville ;Destination\nDijon;Lyon\n");
        assert_eq!(t.column("Ville"), Some(0));
    }

    #[test]
    fn test_undetectable_delimiter() {
        let err = read_table("a;b\n1;2;3\n4\n".as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::Parse(ParseError::Delimiter)));
    }

    #[test]
    fn test_malformed_row_after_sample() {
        let mut text = String::from("Nom,Ville\n");
        for i in 0..60 {
            text.push_str(&format!("n{i},Dijon\n"));
        }
        text.push_str("x,Dole,extra\n");
        let err = read_table(text.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Parse(ParseError::Malformed { line: 62, .. })
        ));
    }

    #[test]
    fn test_rejects_non_utf8_and_empty() {
        let err = read_table(&[0x56u8, 0xff, 0xfe][..]).unwrap_err();
        assert!(matches!(err, PipelineError::Parse(ParseError::Encoding)));
        let err = read_table("  \n".as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::Parse(ParseError::Empty)));
    }

    #[test]
    fn test_duplicate_column_last_wins() {
        let t = table("Ville,Nom,Ville\nParis,A,Dijon\nLyon,B,Dole\n");
        let extracted = extract_records(&t, Mode::WithinRegion, &InputConfig::default()).unwrap();
        assert_eq!(places(&extracted), vec!["Dijon", "Dole"]);
    }

    #[test]
    fn test_missing_place_column() {
        let t = table("Nom,Commune\nA,Dijon\n");
        let err = extract_records(&t, Mode::WithinRegion, &InputConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Schema(SchemaError::MissingColumn { ref column }) if column == "Ville"
        ));
    }

    #[test]
    fn test_cross_region_requires_both_columns() {
        let t = table("Destination,Nom\nLyon,A\n");
        let err = extract_records(&t, Mode::CrossRegion, &InputConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Schema(_)));

        let t = table("Ville,Nom\nDijon,A\n");
        let err = extract_records(&t, Mode::CrossRegion, &InputConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Schema(SchemaError::MissingColumn { ref column }) if column == "Destination"
        ));
    }

    #[test]
    fn test_cross_region_records() {
        let t = table("Ville;Destination\n Dijon ;Lyon\nDole;\n;Paris\n");
        let extracted = extract_records(&t, Mode::CrossRegion, &InputConfig::default()).unwrap();
        assert_eq!(
            extracted.records,
            vec![RawRecord {
                place: "Dijon".into(),
                destination: Some("Lyon".into()),
            }]
        );
        assert_eq!(extracted.skipped_blank, 2);
    }

    #[test]
    fn test_blank_place_rows_skipped() {
        let t = table("Nom,Ville\nA,Dijon\nB,  \n");
        let extracted = extract_records(&t, Mode::WithinRegion, &InputConfig::default()).unwrap();
        assert_eq!(places(&extracted), vec!["Dijon"]);
        assert_eq!(extracted.skipped_blank, 1);
    }

    #[test]
    fn test_all_blank_rows_counted_as_skipped() {
        let t = table("Nom;Ville\nA;Dijon\n;\nB;Dole\n");
        assert_eq!(t.rows().len(), 2);
        assert_eq!(t.blank_rows(), 1);
        let extracted = extract_records(&t, Mode::WithinRegion, &InputConfig::default()).unwrap();
        assert_eq!(places(&extracted), vec!["Dijon", "Dole"]);
        assert_eq!(extracted.skipped_blank, 1);
    }
}
