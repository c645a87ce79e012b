//! Wide, one-hot form of the enriched artifact for the dashboard.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use csv::StringRecord;

use crate::record::{Audience, ExtractedFields};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub rows: usize,
    /// Rows with no recognisable `post_category`.
    pub skipped: usize,
    pub categories: usize,
}

/// `Web Development` -> `web_development`.
pub fn slug(label: &str) -> String {
    label.trim().to_lowercase().replace(' ', "_")
}

pub fn fee_type(fields: &ExtractedFields) -> &'static str {
    if fields.is_unclassified() {
        "Not listed"
    } else if fields.registration_fee == 0 {
        "Free"
    } else {
        "Paid"
    }
}

/// `-1` marks a fee that is not known.
pub fn min_registration_fee(fields: &ExtractedFields) -> i64 {
    if fields.is_unclassified() {
        -1
    } else {
        fields.registration_fee as i64
    }
}

fn parse_date(cell: &str) -> Option<NaiveDate> {
    let day = cell.trim().get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn is_generated(column: &str) -> bool {
    matches!(
        column,
        "year" | "month" | "day" | "fee_type" | "min_registration_fee"
    ) || column.starts_with("cat_")
        || column.starts_with("aud_")
}

pub fn widen<R: Read, W: Write>(reader: R, writer: W) -> Result<NormalizeStats> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h.trim() == name);
    let date_col = position("date");

    let mut stats = NormalizeStats::default();
    let mut rows: Vec<(StringRecord, ExtractedFields)> = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let cell = |name: &str| position(name).and_then(|i| record.get(i));
        match ExtractedFields::from_cells(cell) {
            Some(fields) => rows.push((record, fields)),
            None => stats.skipped += 1,
        }
    }

    let slugs: BTreeSet<String> = rows
        .iter()
        .flat_map(|(_, f)| f.categories().iter().map(|c| slug(c)))
        .filter(|s| !s.is_empty())
        .collect();
    stats.categories = slugs.len();

    let kept: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !is_generated(h.trim()))
        .map(|(i, _)| i)
        .collect();

    let mut wtr = csv::Writer::from_writer(writer);
    let mut header: Vec<String> = kept.iter().map(|&i| headers[i].to_string()).collect();
    header.extend(["year", "month", "day"].map(String::from));
    header.extend(slugs.iter().map(|s| format!("cat_{}", s)));
    header.extend(Audience::ALL.iter().map(|a| format!("aud_{}", a.as_str().to_lowercase())));
    header.extend(["fee_type", "min_registration_fee"].map(String::from));
    wtr.write_record(&header)?;

    let flag = |on: bool| (if on { "1" } else { "0" }).to_string();
    for (record, fields) in &rows {
        let mut out: Vec<String> = kept
            .iter()
            .map(|&i| record.get(i).unwrap_or_default().to_string())
            .collect();

        match date_col.and_then(|i| record.get(i)).and_then(parse_date) {
            Some(d) => out.extend([d.year().to_string(), d.month().to_string(), d.day().to_string()]),
            None => out.extend([String::new(), String::new(), String::new()]),
        }

        let mine: BTreeSet<String> = fields.categories().iter().map(|c| slug(c)).collect();
        out.extend(slugs.iter().map(|s| flag(mine.contains(s))));
        out.extend(
            Audience::ALL
                .iter()
                .map(|a| flag(fields.target_audience.contains(a))),
        );
        out.push(fee_type(fields).to_string());
        out.push(min_registration_fee(fields).to_string());

        wtr.write_record(&out)?;
        stats.rows += 1;
    }
    wtr.flush()?;
    Ok(stats)
}

pub fn run(input: &Path, output: &Path) -> Result<NormalizeStats> {
    let file = File::open(input).with_context(|| format!("Failed to open {:?}", input))?;
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let out = File::create(output).with_context(|| format!("Failed to create {:?}", output))?;
    let stats = widen(file, out).with_context(|| format!("Failed to normalize {:?}", input))?;
    println!(
        "Wrote {} rows with {} category columns to {:?} ({} skipped).",
        stats.rows, stats.categories, output, stats.skipped
    );
    Ok(stats)
}
