//! Turns intercepted Instagram API responses into the caption table.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPost {
    pub date: String,
    pub url: String,
    pub caption: String,
}

/// Walk every batch depth-first. Any object carrying `taken_at` (or the
/// older `taken_at_timestamp`) is a post; the first occurrence of a code wins.
pub fn collect_posts(batches: &Value) -> Vec<CapturedPost> {
    let mut posts = Vec::new();
    let mut seen = HashSet::new();
    visit_objects(batches, &mut |obj| {
        if let Some(post) = post_from(obj, &mut seen) {
            posts.push(post);
        }
    });
    posts
}

fn visit_objects(value: &Value, f: &mut dyn FnMut(&serde_json::Map<String, Value>)) {
    match value {
        Value::Object(obj) => {
            f(obj);
            for child in obj.values() {
                visit_objects(child, f);
            }
        }
        Value::Array(items) => {
            for item in items {
                visit_objects(item, f);
            }
        }
        _ => {}
    }
}

fn post_from(obj: &serde_json::Map<String, Value>, seen: &mut HashSet<String>) -> Option<CapturedPost> {
    let timestamp = ["taken_at", "taken_at_timestamp"]
        .iter()
        .filter_map(|k| obj.get(*k))
        .find_map(as_timestamp)?;
    let code = ["code", "shortcode", "pk"]
        .iter()
        .filter_map(|k| obj.get(*k))
        .find_map(as_code)?;

    if !seen.insert(code.clone()) {
        return None;
    }
    let date = match DateTime::from_timestamp(timestamp, 0) {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => {
            debug!(timestamp, code = %code, "timestamp out of range");
            String::new()
        }
    };

    Some(CapturedPost {
        date,
        url: format!("https://instagram.com/p/{}", code),
        caption: caption_of(obj).unwrap_or_default().to_string(),
    })
}

fn as_timestamp(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|&ts| ts != 0)
}

fn as_code(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn caption_of(obj: &serde_json::Map<String, Value>) -> Option<&str> {
    if let Some(Value::Object(caption)) = obj.get("caption") {
        return caption.get("text").and_then(Value::as_str);
    }
    obj.get("edge_media_to_caption")?
        .get("edges")?
        .get(0)?
        .get("node")?
        .get("text")?
        .as_str()
}

fn is_emoji_char(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF
            | 0x2600..=0x27BF
            | 0x2B00..=0x2BFF
            | 0xFE00..=0xFE0F
            | 0x200D
            | 0x20E3
            | 0xE0020..=0xE007F
    )
}

/// Caption text as the enrichment step wants it: no emoji, one line.
pub fn clean_caption(raw: &str) -> String {
    raw.chars()
        .filter(|&c| !is_emoji_char(c))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn write_posts<W: Write>(writer: W, posts: &[CapturedPost]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["date", "url", "caption", "clean_text"])?;
    for post in posts {
        let clean = clean_caption(&post.caption);
        wtr.write_record([&post.date, &post.url, &post.caption, &clean])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Returns the number of unique posts written.
pub fn run(input: &Path, output: &Path) -> Result<usize> {
    println!("Processing {:?}...", input);
    let file = File::open(input).with_context(|| format!("Failed to open {:?}", input))?;
    let batches: Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {:?} as JSON", input))?;

    let posts = collect_posts(&batches);
    println!("Extracted {} unique posts.", posts.len());
    if posts.is_empty() {
        return Ok(0);
    }

    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let out = File::create(output).with_context(|| format!("Failed to create {:?}", output))?;
    write_posts(out, &posts)?;
    println!("Saved to {:?}", output);
    Ok(posts.len())
}
