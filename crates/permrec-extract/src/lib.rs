//! Permission source contracts + the narrow `INSERT INTO permissions` extractor.
//!
//! Extraction is two-staged: [`find_statements`] locates statement bodies, then
//! [`find_tuples`] pulls the parenthesized value groups out of each body. Groups are
//! tokenized by [`split_fields`] and mapped onto the statement's column list by
//! [`map_row`]. This is a text matcher for one statement shape, not a SQL parser.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use permrec_core::{PermissionId, PermissionRecord, UUID_GENERATOR_CALLS};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, trace};

pub const CRATE_NAME: &str = "permrec-extract";

const MIN_CODE_CHARS: usize = 3;
const MIN_FIELDS: usize = 3;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-source counters surfaced in logs and the run report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub label: String,
    pub found: bool,
    pub statements: usize,
    pub tuples_seen: usize,
    pub rows_accepted: usize,
    pub rows_rejected: usize,
    pub duplicates_skipped: usize,
}

impl SourceStats {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub records: Vec<PermissionRecord>,
    pub stats: SourceStats,
}

/// One ordered producer of permission records. Earlier sources win on merge.
pub trait PermissionSource {
    fn label(&self) -> &str;

    fn load(&self) -> Result<SourceBatch, ExtractError>;
}

/// A SQL file resolved against a root directory. Missing files load as empty.
#[derive(Debug, Clone)]
pub struct SqlFileSource {
    label: String,
    path: PathBuf,
}

impl SqlFileSource {
    pub fn new(root: impl AsRef<Path>, relative: impl AsRef<Path>) -> Self {
        let relative = relative.as_ref();
        Self {
            label: relative.display().to_string(),
            path: root.as_ref().join(relative),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PermissionSource for SqlFileSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<SourceBatch, ExtractError> {
        let span = info_span!("load_source", source = %self.label);
        let _guard = span.enter();

        let mut stats = SourceStats::new(&self.label);
        if !self.path.exists() {
            debug!(path = %self.path.display(), "source file not found; skipping");
            return Ok(SourceBatch {
                records: Vec::new(),
                stats,
            });
        }

        let text = fs::read_to_string(&self.path).map_err(|source| ExtractError::Read {
            path: self.path.clone(),
            source,
        })?;
        stats.found = true;

        let extracted = extract_records(&text);
        stats.statements = extracted.statements;
        stats.tuples_seen = extracted.tuples_seen;
        stats.rows_accepted = extracted.records.len();
        stats.rows_rejected = extracted.rows_rejected;
        info!(
            statements = stats.statements,
            accepted = stats.rows_accepted,
            rejected = stats.rows_rejected,
            "extracted permission rows"
        );

        Ok(SourceBatch {
            records: extracted.records,
            stats,
        })
    }
}

/// One matched `INSERT INTO permissions` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement<'a> {
    pub columns: Vec<&'a str>,
    pub values: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedRecords {
    pub records: Vec<PermissionRecord>,
    pub statements: usize,
    pub tuples_seen: usize,
    pub rows_rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRejection {
    TooFewFields,
    MissingField(&'static str),
    ShortCode,
}

fn statement_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)INSERT INTO permissions\s+\((.*?)\)\s+VALUES\s+(.*?);")
            .expect("statement pattern compiles")
    })
}

// A group may hold quoted spans and empty-argument calls such as `uuid_generate_v4()`,
// but no other nested parentheses.
fn quoted_tuple_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^\(((?:'[^']*'|\w+\(\)|[^()'])*)\)").expect("tuple pattern compiles")
    })
}

// Used when quotes inside the group do not pair up, e.g. `'Teacher's portal'`.
fn plain_tuple_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\((.*?)\)").expect("plain tuple pattern compiles"))
}

pub fn find_statements(text: &str) -> Vec<InsertStatement<'_>> {
    statement_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let columns = caps.get(1)?.as_str();
            let values = caps.get(2)?.as_str();
            Some(InsertStatement {
                columns: columns.split(',').map(str::trim).collect(),
                values,
            })
        })
        .collect()
}

/// Parenthesized groups in a `VALUES` body, left to right.
///
/// Each `(` is first matched quote-aware; if its quotes do not pair up the group
/// ends at the first `)` instead.
pub fn find_tuples(values: &str) -> Vec<&str> {
    let mut tuples = Vec::new();
    let mut pos = 0;

    while let Some(offset) = values[pos..].find('(') {
        let start = pos + offset;
        let rest = &values[start..];
        let caps = quoted_tuple_pattern()
            .captures(rest)
            .or_else(|| plain_tuple_pattern().captures(rest));
        let Some(caps) = caps else {
            break;
        };
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        tuples.push(body.as_str());
        pos = start + whole.end();
    }

    tuples
}

/// Heuristic filter for stray groups such as an `ON CONFLICT (code)` target.
pub fn accept_tuple(body: &str) -> bool {
    let head = body.trim_start();
    let leads_like_row = head.starts_with('\'')
        || UUID_GENERATOR_CALLS
            .iter()
            .any(|call| head.starts_with(call));
    leads_like_row && body.matches(',').count() >= 2
}

/// Split a tuple body on commas outside single-quoted spans.
///
/// Every `'` toggles the quoted state; there is no escape handling, so a doubled
/// quote inside a value is read as two toggles. Each field is trimmed and loses at
/// most one leading and one trailing quote.
pub fn split_fields(body: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in body.chars() {
        if ch == '\'' {
            in_quotes = !in_quotes;
        }
        if ch == ',' && !in_quotes {
            fields.push(finish_field(&current));
            current.clear();
        } else {
            current.push(ch);
        }
    }
    fields.push(finish_field(&current));
    fields
}

fn finish_field(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('\'').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix('\'').unwrap_or(trimmed);
    trimmed.to_string()
}

/// Pair fields with columns positionally; surplus on either side is ignored.
pub fn map_row(columns: &[&str], fields: &[String]) -> Result<PermissionRecord, RowRejection> {
    if fields.len() < MIN_FIELDS {
        return Err(RowRejection::TooFewFields);
    }

    let row: HashMap<&str, &str> = columns
        .iter()
        .copied()
        .zip(fields.iter().map(String::as_str))
        .collect();

    let required = |column: &'static str| {
        row.get(column)
            .copied()
            .filter(|value| !value.is_empty())
            .ok_or(RowRejection::MissingField(column))
    };
    let code = required("code")?;
    let module = required("module")?;
    let description = required("description")?;
    if code.chars().count() < MIN_CODE_CHARS {
        return Err(RowRejection::ShortCode);
    }

    Ok(PermissionRecord::new(
        code,
        module,
        description,
        PermissionId::from_source_field(row.get("id").copied()),
    ))
}

pub fn extract_records(text: &str) -> ExtractedRecords {
    let mut out = ExtractedRecords::default();

    for statement in find_statements(text) {
        out.statements += 1;
        for body in find_tuples(statement.values) {
            if !accept_tuple(body) {
                continue;
            }
            out.tuples_seen += 1;
            match map_row(&statement.columns, &split_fields(body)) {
                Ok(record) => out.records.push(record),
                Err(reason) => {
                    trace!(?reason, tuple = body, "dropping permission row");
                    out.rows_rejected += 1;
                }
            }
        }
    }

    out
}
