//! The caption table the pipeline enriches. Rows are immutable here.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use csv::StringRecord;
use tracing::{info, warn};

use crate::codec;

/// One source row and its stable identity.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub original_index: i64,
    pub record: StringRecord,
}

#[derive(Debug)]
pub struct SourceTable {
    headers: StringRecord,
    text_col: usize,
    rows: Vec<SourceRow>,
    by_index: HashMap<i64, usize>,
}

impl SourceTable {
    pub fn read(path: &Path, text_column: &str, id_column: Option<&str>) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        Self::from_reader(file, text_column, id_column)
            .with_context(|| format!("Failed to read source table {:?}", path))
    }

    /// Without `id_column`, a row's identity is its zero-based position among
    /// the data rows. Rows with an empty caption are dropped but keep
    /// their position, so identities stay stable across runs.
    pub fn from_reader<R: Read>(reader: R, text_column: &str, id_column: Option<&str>) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr.headers()?.clone();

        let text_col = column(&headers, text_column)
            .with_context(|| format!("no {:?} column in source", text_column))?;
        let id_col = match id_column {
            Some(name) => {
                Some(column(&headers, name).with_context(|| format!("no {:?} column in source", name))?)
            }
            None => None,
        };

        let mut rows = Vec::new();
        let mut by_index = HashMap::new();
        let mut empty = 0usize;
        let mut bad_ids = 0usize;

        for (position, record) in rdr.records().enumerate() {
            let record = record?;
            let original_index = match id_col {
                Some(col) => match record.get(col).and_then(codec::parse_int) {
                    Some(id) => id,
                    None => {
                        bad_ids += 1;
                        continue;
                    }
                },
                None => position as i64,
            };

            if record.get(text_col).map_or(true, codec::is_missing) {
                empty += 1;
                continue;
            }
            if by_index.contains_key(&original_index) {
                warn!(original_index, "duplicate row identity in source, keeping the first");
                continue;
            }

            by_index.insert(original_index, rows.len());
            rows.push(SourceRow {
                original_index,
                record,
            });
        }

        if bad_ids > 0 {
            warn!(bad_ids, "source rows without a usable identity were skipped");
        }
        info!(rows = rows.len(), empty_captions = empty, "Loaded source table");

        Ok(Self {
            headers,
            text_col,
            rows,
            by_index,
        })
    }

    pub fn headers(&self) -> &StringRecord {
        &self.headers
    }

    pub fn rows(&self) -> &[SourceRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, original_index: i64) -> Option<&SourceRow> {
        self.by_index.get(&original_index).map(|&i| &self.rows[i])
    }

    pub fn caption<'r>(&self, row: &'r SourceRow) -> Option<&'r str> {
        row.record.get(self.text_col).filter(|t| !codec::is_missing(t))
    }
}

fn column(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}
