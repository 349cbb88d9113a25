//! Unicode-safe streaming CSV reader keyed by header, shared by every table
//! parser in `store::ingest`.

use std::io::Read;

use crate::error::{Error, Result};

/// A streamed GTFS table: a header row plus an iterator over records, each
/// record exposed as a header-keyed lookup. Empty fields are `None`, never
/// `Some("")` — GTFS treats an empty CSV field as null downstream.
pub struct FeedTable<R: Read> {
    headers: csv::StringRecord,
    reader: csv::Reader<R>,
}

impl<R: Read> FeedTable<R> {
    pub fn new(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|e| Error::MalformedFeed(format!("could not read header row: {e}")))?
            .clone();
        Ok(Self { headers, reader })
    }

    /// Index of a named column, if present.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Iterate rows as header-keyed lookups.
    pub fn rows(&mut self) -> impl Iterator<Item = Result<Row>> + '_ {
        let headers = self.headers.clone();
        self.reader.records().map(move |rec| {
            let record = rec.map_err(Error::from)?;
            Ok(Row {
                headers: headers.clone(),
                record,
            })
        })
    }
}

pub struct Row {
    headers: csv::StringRecord,
    record: csv::StringRecord,
}

impl Row {
    /// Value of `column`, with empty strings coerced to `None`.
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.headers.iter().position(|h| h == column)?;
        self.record.get(idx).filter(|s| !s.is_empty())
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, column: &str) -> Option<T> {
        self.get(column).and_then(|s| s.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_rows_header_keyed() {
        let data = "stop_id,stop_name,stop_lat\nS1,Stop One,48.1\nS2,,48.2\n";
        let mut table = FeedTable::new(data.as_bytes()).unwrap();
        assert_eq!(table.column("stop_id"), Some(0));
        let rows: Vec<_> = table.rows().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("stop_name"), Some("Stop One"));
        assert_eq!(rows[1].get("stop_name"), None);
        assert_eq!(rows[1].get("stop_id"), Some("S2"));
    }

    #[test]
    fn parses_typed_column() {
        let data = "stop_id,stop_lat\nS1,48.25\n";
        let mut table = FeedTable::new(data.as_bytes()).unwrap();
        let row = table.rows().next().unwrap().unwrap();
        assert_eq!(row.get_parsed::<f64>("stop_lat"), Some(48.25));
    }

    #[test]
    fn missing_column_is_none() {
        let data = "stop_id\nS1\n";
        let mut table = FeedTable::new(data.as_bytes()).unwrap();
        let row = table.rows().next().unwrap().unwrap();
        assert_eq!(row.get("stop_lat"), None);
    }

    #[test]
    fn empty_reader_fails_header_read() {
        let data = "";
        // csv crate treats an empty reader as an empty header row, which is
        // itself a usable (if useless) header — the real failure mode is an
        // IO error surfacing through `headers()`, exercised via a reader
        // that errors immediately.
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("boom"))
            }
        }
        let result = FeedTable::new(FailingReader);
        assert!(result.is_err());
        let _ = data;
    }
}
