//! Parsing of remote domain permission lists.
//!
//! Three formats are understood:
//!
//! - **plain**: one domain per line, `#` comments and blank lines ignored;
//! - **csv**: a header row naming the columns (Mastodon exports prefix them
//!   with `#`), `domain` required;
//! - **json**: an array of objects with a `domain` field.
//!
//! A parse either yields the complete entry list or fails as a whole. Entries
//! come back in list order with duplicates removed (first occurrence wins).
//! Values that are not domain names are skipped with a warning.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{CSV_SEVERITY_SUSPEND, PLAIN_COMMENT_MARKER};
use crate::domain::normalize_domain;
use crate::error::ParseError;
use crate::types::ContentType;

/// One normalized entry of a remote list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedEntry {
    pub domain: String,
    pub obfuscate: Option<bool>,
    pub public_comment: Option<String>,
    pub private_comment: Option<String>,
}

impl ParsedEntry {
    pub fn bare(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            obfuscate: None,
            public_comment: None,
            private_comment: None,
        }
    }
}

/// Parse `body` according to `content_type`.
pub fn parse_list(content_type: ContentType, body: &[u8]) -> Result<Vec<ParsedEntry>, ParseError> {
    let text = std::str::from_utf8(body).map_err(|_| ParseError::NotUtf8)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let entries = match content_type {
        ContentType::Plain => parse_plain(text),
        ContentType::Csv => parse_csv(text)?,
        ContentType::Json => parse_json(text)?,
    };

    debug!(
        content_type = %content_type,
        entries = entries.len(),
        "Parsed domain permission list"
    );

    Ok(entries)
}

/// Collects entries, normalizing domains and dropping duplicates.
#[derive(Default)]
struct EntrySink {
    seen: HashSet<String>,
    entries: Vec<ParsedEntry>,
}

impl EntrySink {
    fn push(
        &mut self,
        raw_domain: &str,
        obfuscate: Option<bool>,
        public_comment: Option<String>,
        private_comment: Option<String>,
    ) {
        let Some(domain) = normalize_domain(raw_domain) else {
            warn!(value = %raw_domain, "Skipping invalid domain");
            return;
        };

        if !self.seen.insert(domain.clone()) {
            return;
        }

        self.entries.push(ParsedEntry {
            domain,
            obfuscate,
            public_comment,
            private_comment,
        });
    }
}

fn parse_plain(text: &str) -> Vec<ParsedEntry> {
    let mut sink = EntrySink::default();

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(PLAIN_COMMENT_MARKER))
        .for_each(|line| sink.push(line, None, None, None));

    sink.entries
}

/// Column positions resolved from a CSV header row.
struct CsvColumns {
    domain: usize,
    severity: Option<usize>,
    obfuscate: Option<usize>,
    public_comment: Option<usize>,
    private_comment: Option<usize>,
}

impl CsvColumns {
    fn from_header(header: &csv::StringRecord) -> Result<Self, ParseError> {
        if header.iter().all(|name| name.trim().is_empty()) {
            return Err(ParseError::MissingHeader);
        }

        let positions: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let name = name.trim().trim_start_matches('#').to_ascii_lowercase();
                (name, i)
            })
            .collect();

        Ok(Self {
            domain: *positions
                .get("domain")
                .ok_or(ParseError::MissingDomainColumn)?,
            severity: positions.get("severity").copied(),
            obfuscate: positions.get("obfuscate").copied(),
            public_comment: positions.get("public_comment").copied(),
            private_comment: positions.get("private_comment").copied(),
        })
    }
}

fn parse_csv(text: &str) -> Result<Vec<ParsedEntry>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let header = reader.headers().map_err(csv_error)?.clone();
    let columns = CsvColumns::from_header(&header)?;

    let mut sink = EntrySink::default();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).filter(|v| !v.is_empty());

        let Some(domain) = field(Some(columns.domain)) else {
            continue;
        };

        if let Some(severity) = field(columns.severity) {
            if !severity.eq_ignore_ascii_case(CSV_SEVERITY_SUSPEND) {
                debug!(domain = %domain, severity = %severity, "Skipping non-suspend csv row");
                continue;
            }
        }

        sink.push(
            domain,
            field(columns.obfuscate).and_then(parse_bool),
            field(columns.public_comment).map(str::to_string),
            field(columns.private_comment).map(str::to_string),
        );
    }

    Ok(sink.entries)
}

fn csv_error(e: csv::Error) -> ParseError {
    ParseError::Csv {
        line: e.position().map(|p| p.line()).unwrap_or(0),
        reason: e.to_string(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Deserialize)]
struct JsonEntry {
    domain: Option<String>,
    obfuscate: Option<bool>,
    public_comment: Option<String>,
    private_comment: Option<String>,
}

fn parse_json(text: &str) -> Result<Vec<ParsedEntry>, ParseError> {
    let raw: Vec<JsonEntry> =
        serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;

    // Validate every element before accepting any of them.
    if let Some(index) = raw
        .iter()
        .position(|e| e.domain.as_deref().map_or(true, |d| d.trim().is_empty()))
    {
        return Err(ParseError::MissingDomain { index });
    }

    let mut sink = EntrySink::default();
    for entry in raw {
        let domain = entry.domain.unwrap_or_default();
        sink.push(
            &domain,
            entry.obfuscate,
            entry.public_comment.filter(|c| !c.is_empty()),
            entry.private_comment.filter(|c| !c.is_empty()),
        );
    }

    Ok(sink.entries)
}
