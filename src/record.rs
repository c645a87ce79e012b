//! Extraction Result types and tolerant parsing of model replies.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::codec;

/// Extracted columns in artifact order. `original_index` closes the row.
pub const EXTRACTED_COLUMNS: [&str; 8] = [
    "post_category",
    "comp_category",
    "organizer",
    "target_audience",
    "min_team_size",
    "max_team_size",
    "registration_fee",
    "original_index",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostCategory {
    Competition,
    Webinar,
    Giveaway,
    Other,
    /// Only ever produced by the fallback record.
    Unclassified,
}

impl PostCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostCategory::Competition => "COMPETITION",
            PostCategory::Webinar => "WEBINAR",
            PostCategory::Giveaway => "GIVEAWAY",
            PostCategory::Other => "OTHER",
            PostCategory::Unclassified => "Unclassified",
        }
    }

    /// Parse a stored value, including the `Unclassified` marker.
    pub fn parse_stored(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMPETITION" => Some(PostCategory::Competition),
            "WEBINAR" => Some(PostCategory::Webinar),
            "GIVEAWAY" => Some(PostCategory::Giveaway),
            "OTHER" => Some(PostCategory::Other),
            "UNCLASSIFIED" => Some(PostCategory::Unclassified),
            _ => None,
        }
    }

    /// Parse a model-supplied value. The model may not claim `Unclassified`.
    fn from_reply(s: &str) -> Self {
        match Self::parse_stored(s) {
            Some(PostCategory::Unclassified) | None => PostCategory::Other,
            Some(c) => c,
        }
    }

    /// Giveaways and other posts carry no competition categories.
    pub fn carries_categories(&self) -> bool {
        !matches!(self, PostCategory::Giveaway | PostCategory::Other)
    }
}

impl fmt::Display for PostCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Audience {
    Sd,
    Smp,
    Sma,
    Mahasiswa,
    Umum,
}

impl Audience {
    pub const ALL: [Audience; 5] = [
        Audience::Sd,
        Audience::Smp,
        Audience::Sma,
        Audience::Mahasiswa,
        Audience::Umum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Sd => "SD",
            Audience::Smp => "SMP",
            Audience::Sma => "SMA",
            Audience::Mahasiswa => "Mahasiswa",
            Audience::Umum => "Umum",
        }
    }

    /// Map a free-form audience label onto the closed set.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "sd" | "sekolah dasar" | "mi" => Some(Audience::Sd),
            "smp" | "mts" | "sltp" => Some(Audience::Smp),
            "sma" | "smk" | "ma" | "siswa" | "pelajar" | "slta" | "sederajat" => {
                Some(Audience::Sma)
            }
            "mahasiswa" | "universitas" | "university" | "college" => Some(Audience::Mahasiswa),
            "umum" | "publik" | "public" | "general" | "professional" | "profesional" | "all"
            | "semua" => Some(Audience::Umum),
            _ => None,
        }
    }
}

/// The structured fields pulled out of one caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFields {
    pub post_category: PostCategory,
    pub comp_category: Option<Vec<String>>,
    pub organizer: Option<String>,
    pub target_audience: Vec<Audience>,
    pub min_team_size: Option<u32>,
    pub max_team_size: Option<u32>,
    pub registration_fee: u64,
}

impl ExtractedFields {
    /// The fixed record stored when extraction gives up on a row.
    /// Its `Unclassified` category is what the repair pass looks for.
    pub fn fallback() -> Self {
        ExtractedFields {
            post_category: PostCategory::Unclassified,
            comp_category: Some(Vec::new()),
            organizer: None,
            target_audience: vec![Audience::Umum],
            min_team_size: None,
            max_team_size: None,
            registration_fee: 0,
        }
    }

    pub fn is_unclassified(&self) -> bool {
        self.post_category == PostCategory::Unclassified
    }

    pub fn categories(&self) -> &[String] {
        self.comp_category.as_deref().unwrap_or(&[])
    }

    /// Re-establish the record invariants after fields were overwritten.
    fn normalize(&mut self) {
        if !self.post_category.carries_categories() {
            self.comp_category = None;
        }
        self.target_audience.sort();
        self.target_audience.dedup();
        if self.target_audience.is_empty() {
            self.target_audience.push(Audience::Umum);
        }
        if let (Some(min), Some(max)) = (self.min_team_size, self.max_team_size) {
            if min > max {
                self.min_team_size = Some(max);
                self.max_team_size = Some(min);
            }
        }
    }

    pub fn audience_labels(&self) -> Vec<String> {
        self.target_audience
            .iter()
            .map(|a| a.as_str().to_string())
            .collect()
    }

    /// Render the seven extracted cells (everything but `original_index`).
    pub fn to_cells(&self) -> [String; 7] {
        [
            self.post_category.as_str().to_string(),
            codec::encode_optional_list(self.comp_category.as_deref()),
            self.organizer.clone().unwrap_or_default(),
            codec::encode_list(&self.audience_labels()),
            self.min_team_size.map(|n| n.to_string()).unwrap_or_default(),
            self.max_team_size.map(|n| n.to_string()).unwrap_or_default(),
            self.registration_fee.to_string(),
        ]
    }

    /// Rebuild a record from stored cells, looked up by column name.
    /// Returns `None` when the row has no recognisable `post_category`.
    /// Malformed list cells decode as absent.
    pub fn from_cells<'a>(cell: impl Fn(&str) -> Option<&'a str>) -> Option<Self> {
        let post_category = PostCategory::parse_stored(cell("post_category")?)?;

        let list = |name: &str| -> Option<Vec<String>> {
            let raw = cell(name)?;
            match codec::decode_list(raw) {
                Ok(items) => items,
                Err(e) => {
                    tracing::debug!(column = name, error = %e, "skipping malformed list cell");
                    None
                }
            }
        };

        let mut fields = ExtractedFields {
            post_category,
            comp_category: list("comp_category").map(clean_labels),
            organizer: cell("organizer").and_then(clean_organizer),
            target_audience: list("target_audience")
                .unwrap_or_default()
                .iter()
                .filter_map(|a| Audience::parse(a))
                .collect(),
            min_team_size: cell("min_team_size").and_then(team_size_from_text),
            max_team_size: cell("max_team_size").and_then(team_size_from_text),
            registration_fee: cell("registration_fee").map(fee_from_cell).unwrap_or(0),
        };
        fields.normalize();
        Some(fields)
    }
}

/// A stored result bound to its source row identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResult {
    pub original_index: i64,
    pub fields: ExtractedFields,
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("reply is not a JSON object")]
    NotAnObject,
    #[error("reply has no post_category")]
    MissingCategory,
}

/// A parsed model reply. Keeps the raw object so a repair can overwrite
/// only the fields the model actually returned.
#[derive(Debug, Clone)]
pub struct ExtractionReply(Map<String, Value>);

impl ExtractionReply {
    pub fn parse(text: &str) -> Result<Self, ReplyError> {
        let trimmed = text.trim();
        // Tolerate prose or code fences around the object.
        let body = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => trimmed,
        };
        match serde_json::from_str::<Value>(body)? {
            Value::Object(map) if map.contains_key("post_category") => Ok(ExtractionReply(map)),
            Value::Object(_) => Err(ReplyError::MissingCategory),
            _ => Err(ReplyError::NotAnObject),
        }
    }

    /// Build a complete record; keys the model left out take empty values.
    pub fn to_fields(&self) -> ExtractedFields {
        let mut fields = ExtractedFields {
            post_category: PostCategory::Other,
            comp_category: None,
            organizer: None,
            target_audience: Vec::new(),
            min_team_size: None,
            max_team_size: None,
            registration_fee: 0,
        };
        self.apply_to(&mut fields);
        fields
    }

    /// Overwrite the fields present in this reply, leaving the rest alone.
    pub fn apply_to(&self, fields: &mut ExtractedFields) {
        for (key, value) in &self.0 {
            match key.as_str() {
                "post_category" => {
                    fields.post_category =
                        PostCategory::from_reply(value.as_str().unwrap_or_default());
                }
                "comp_category" => {
                    fields.comp_category = match value {
                        Value::Null => None,
                        v => Some(string_list(v)),
                    };
                }
                "organizer" => fields.organizer = value.as_str().and_then(clean_organizer),
                "target_audience" => {
                    fields.target_audience = string_list(value)
                        .iter()
                        .filter_map(|a| Audience::parse(a))
                        .collect();
                }
                "min_team_size" => fields.min_team_size = team_size(value),
                "max_team_size" => fields.max_team_size = team_size(value),
                "registration_fee" => fields.registration_fee = fee(value),
                other => tracing::debug!(key = other, "ignoring unknown reply key"),
            }
        }
        fields.normalize();
    }
}

/// Trimmed, non-empty, order-preserving de-duplicated strings.
fn string_list(value: &Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(s) => match codec::decode_list(s) {
            Ok(Some(items)) => items,
            _ => vec![s.clone()],
        },
        _ => Vec::new(),
    };

    clean_labels(raw)
}

/// Trims each label, drops blank and missing markers, and removes repeats
/// keeping the first occurrence.
pub(crate) fn clean_labels(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for item in raw {
        let item = item.trim();
        if !item.is_empty() && !codec::is_missing(item) && !out.iter().any(|o| o == item) {
            out.push(item.to_string());
        }
    }
    out
}

fn clean_organizer(s: &str) -> Option<String> {
    let t = s.trim();
    if codec::is_missing(t) || t == "-" || t == "..." {
        None
    } else {
        Some(t.to_string())
    }
}

fn team_size(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 1.0).map(|f| f.round() as u64))
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0),
        Value::String(s) => team_size_from_text(s),
        _ => None,
    }
}

fn team_size_from_text(s: &str) -> Option<u32> {
    let digits: String = s
        .trim()
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u32>().ok().filter(|n| *n > 0)
}

fn fee(value: &Value) -> u64 {
    fee_opt(value).unwrap_or(0)
}

fn fee_opt(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => parse_fee_text(s),
        Value::Array(tiers) => tiers.iter().filter_map(fee_opt).min(),
        _ => None,
    }
}

/// Read a stored fee cell: a plain number or a list of tiers.
pub fn fee_from_cell(cell: &str) -> u64 {
    let t = cell.trim();
    if let Some(inner) = t.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        return inner.split(',').filter_map(parse_fee_text).min().unwrap_or(0);
    }
    parse_fee_text(t).unwrap_or(0)
}

/// Parse amounts like `50000`, `Rp 50.000`, `50k`, `25rb`, `1,5 jt`, `gratis`.
pub fn parse_fee_text(text: &str) -> Option<u64> {
    static AMOUNT_RE: OnceLock<Regex> = OnceLock::new();
    let re = AMOUNT_RE.get_or_init(|| {
        Regex::new(r"(?i)(\d[\d.,]*)\s*(k|rb|ribu|jt|juta)?\b").unwrap()
    });

    let lower = text.trim().to_lowercase();
    if codec::is_missing(&lower) {
        return None;
    }
    if lower.contains("gratis") || lower.contains("free") {
        return Some(0);
    }

    let caps = re.captures(&lower)?;
    let number = caps.get(1)?.as_str().trim_end_matches(['.', ',']);
    let multiplier: u64 = match caps.get(2).map(|m| m.as_str()) {
        Some("k") | Some("rb") | Some("ribu") => 1_000,
        Some("jt") | Some("juta") => 1_000_000,
        _ => 1,
    };
    parse_amount(number, multiplier)
}

fn parse_amount(number: &str, multiplier: u64) -> Option<u64> {
    // "1,5" or "2.25" before a multiplier is a decimal; "50.000" is grouping.
    if let Some(pos) = number.rfind(['.', ',']) {
        let frac = &number[pos + 1..];
        let is_decimal = frac.len() < 3 || (multiplier == 1 && frac.len() != 3);
        if is_decimal {
            let whole: String = number[..pos].chars().filter(|c| c.is_ascii_digit()).collect();
            let value: f64 = format!("{}.{}", if whole.is_empty() { "0" } else { &whole }, frac)
                .parse()
                .ok()?;
            return Some((value * multiplier as f64).round() as u64);
        }
    }
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}
