//! Reconcile pipeline: merge permission sources and emit the consolidated upsert.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use permrec_core::{PermissionEntry, PermissionId, PermissionRecord, EMITTED_UUID_GENERATOR};
use permrec_extract::{ExtractError, PermissionSource, SourceBatch, SourceStats, SqlFileSource};
use permrec_storage::OutputSink;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const CRATE_NAME: &str = "permrec-reconcile";

/// Scan order matters: earlier files win when a code repeats.
pub const DEFAULT_SOURCES: [&str; 5] = [
    "services/api/internal/db/schema.sql",
    "infra/seed/seed_data.sql",
    "infra/migrations/000040_platform_rbac_templates.up.sql",
    "infra/migrations/000047_tenant_default_roles_and_permissions.up.sql",
    "infra/migrations/000048_platform_extras.up.sql",
];

pub const DEFAULT_OUTPUT: &str = "all_permissions.sql";

pub const BUILTIN_MANUAL_LABEL: &str = "<builtin manual permissions>";

/// Permissions for modules that never got a seed row. Gap-fill only.
pub const BUILTIN_MANUAL_PERMISSIONS: [(&str, &str, &str); 17] = [
    ("automation:view", "automation", "View automation rules"),
    ("automation:create", "automation", "Create automation rules"),
    ("automation:edit", "automation", "Edit automation rules"),
    ("automation:delete", "automation", "Delete automation rules"),
    ("kb:view", "kb", "View knowledge base articles"),
    ("kb:write", "kb", "Create/Edit knowledge base articles"),
    ("kb:delete", "kb", "Delete knowledge base articles"),
    ("kb:search", "kb", "Search knowledge base"),
    ("biometric:ingest", "biometric", "Ingest logs from biometric devices"),
    ("files:upload", "files", "Upload system files"),
    ("files:read", "files", "Read/Download system files"),
    ("files:delete", "files", "Delete system files"),
    ("approvals:view", "approvals", "View pending and processed approvals"),
    ("approvals:process", "approvals", "Approve or Reject requests"),
    ("portal:teacher", "core", "Access teacher portal"),
    ("portal:parent", "core", "Access parent portal"),
    ("portal:accountant", "core", "Access accountant portal"),
];

const SCRIPT_HEADER: &str = "-- RECONSTRUCTED COMPREHENSIVE PERMISSIONS\n\
INSERT INTO permissions (id, code, module, description) VALUES\n";

const SCRIPT_FOOTER: &str = "\nON CONFLICT (code) DO UPDATE SET \n  \
module = EXCLUDED.module,\n  \
description = EXCLUDED.description;\n";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub workspace_root: PathBuf,
    pub sources: Vec<PathBuf>,
    /// Resolved against `workspace_root` unless absolute.
    pub output_path: PathBuf,
    pub manual_file: Option<PathBuf>,
    /// Resolved against `workspace_root` unless absolute, like `output_path`.
    pub report_path: Option<PathBuf>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            sources: DEFAULT_SOURCES.iter().map(PathBuf::from).collect(),
            output_path: PathBuf::from(DEFAULT_OUTPUT),
            manual_file: None,
            report_path: None,
        }
    }
}

impl ReconcileConfig {
    pub fn resolved_output(&self) -> PathBuf {
        self.workspace_root.join(&self.output_path)
    }

    pub fn resolved_report(&self) -> Option<PathBuf> {
        self.report_path
            .as_ref()
            .map(|path| self.workspace_root.join(path))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ManualFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    permissions: Vec<ManualEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManualEntry {
    code: String,
    module: String,
    description: String,
}

/// A curated list of permissions. Always carries generated ids.
#[derive(Debug, Clone)]
pub struct ManualPermissions {
    label: String,
    records: Vec<PermissionRecord>,
}

impl ManualPermissions {
    pub fn builtin() -> Self {
        Self {
            label: BUILTIN_MANUAL_LABEL.to_string(),
            records: BUILTIN_MANUAL_PERMISSIONS
                .iter()
                .map(|(code, module, description)| {
                    PermissionRecord::new(*code, *module, *description, PermissionId::Generated)
                })
                .collect(),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(path.display().to_string(), &text)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(label: impl Into<String>, text: &str) -> Result<Self> {
        let file: ManualFile = serde_yaml::from_str(text)?;
        Ok(Self {
            label: label.into(),
            records: file
                .permissions
                .into_iter()
                .map(|e| {
                    PermissionRecord::new(e.code, e.module, e.description, PermissionId::Generated)
                })
                .collect(),
        })
    }

    pub fn records(&self) -> &[PermissionRecord] {
        &self.records
    }
}

impl PermissionSource for ManualPermissions {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<SourceBatch, ExtractError> {
        let mut stats = SourceStats::new(&self.label);
        stats.found = true;
        stats.rows_accepted = self.records.len();
        Ok(SourceBatch {
            records: self.records.clone(),
            stats,
        })
    }
}

/// Permission code → entry, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    entries: IndexMap<String, PermissionEntry>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// First write wins; returns false when the code was already present.
    pub fn insert_if_absent(&mut self, record: PermissionRecord) -> bool {
        if self.entries.contains_key(&record.code) {
            return false;
        }
        let (code, entry) = record.into_keyed_entry();
        self.entries.insert(code, entry);
        true
    }

    pub fn get(&self, code: &str) -> Option<&PermissionEntry> {
        self.entries.get(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn sorted(&self) -> Vec<(&str, &PermissionEntry)> {
        let mut rows: Vec<_> = self
            .entries
            .iter()
            .map(|(code, entry)| (code.as_str(), entry))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        rows
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub set: PermissionSet,
    pub sources: Vec<SourceStats>,
}

/// Fold sources into one set, in order. No state outlives the call.
pub fn merge(sources: &[Box<dyn PermissionSource>]) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();

    for source in sources {
        let batch = source
            .load()
            .with_context(|| format!("loading permission source {}", source.label()))?;
        let mut stats = batch.stats;
        for record in batch.records {
            if !outcome.set.insert_if_absent(record) {
                stats.duplicates_skipped += 1;
            }
        }
        debug!(
            source = %stats.label,
            accepted = stats.rows_accepted,
            duplicates = stats.duplicates_skipped,
            "merged source"
        );
        outcome.sources.push(stats);
    }

    Ok(outcome)
}

pub fn escape_sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

pub fn render_row(code: &str, entry: &PermissionEntry) -> String {
    let description = escape_sql_literal(&entry.description);
    match entry.id.literal() {
        Some(id) => format!("('{id}', '{code}', '{}', '{description}')", entry.module),
        None => format!(
            "({EMITTED_UUID_GENERATOR}, '{code}', '{}', '{description}')",
            entry.module
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedScript {
    pub sql: String,
    pub rows: usize,
}

/// Render the whole set as one multi-row upsert keyed on `code`.
pub fn render_upsert(set: &PermissionSet) -> RenderedScript {
    let rows: Vec<String> = set
        .sorted()
        .into_iter()
        .filter(|(_, entry)| !entry.module.is_empty() && !entry.description.is_empty())
        .map(|(code, entry)| render_row(code, entry))
        .collect();

    let mut sql = String::from(SCRIPT_HEADER);
    sql.push_str(&rows.join(",\n"));
    sql.push_str(SCRIPT_FOOTER);
    RenderedScript {
        sql,
        rows: rows.len(),
    }
}

pub fn summary_line(total_permissions: usize) -> String {
    format!("Extracted {total_permissions} permissions.")
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub output_path: String,
    pub output_sha256: String,
    pub output_changed: bool,
    pub total_permissions: usize,
    pub emitted_rows: usize,
    pub sources: Vec<SourceStats>,
}

#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub set: PermissionSet,
    pub script: RenderedScript,
    pub sources: Vec<SourceStats>,
}

#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub total_permissions: usize,
    pub emitted_rows: usize,
    pub output_path: PathBuf,
    pub output_sha256: String,
    pub output_changed: bool,
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    UpToDate,
    Stale { path: PathBuf },
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    sources: Vec<Box<dyn PermissionSource>>,
}

impl ReconcilePipeline {
    /// Build the ordered source list: SQL files, built-in manual table, manual file.
    pub fn new(config: ReconcileConfig) -> Result<Self> {
        let mut sources: Vec<Box<dyn PermissionSource>> = config
            .sources
            .iter()
            .map(|rel| {
                Box::new(SqlFileSource::new(&config.workspace_root, rel)) as Box<dyn PermissionSource>
            })
            .collect();
        sources.push(Box::new(ManualPermissions::builtin()));
        if let Some(path) = &config.manual_file {
            sources.push(Box::new(ManualPermissions::from_yaml_file(path)?));
        }
        Ok(Self { config, sources })
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Everything short of touching the output file.
    pub fn plan(&self) -> Result<ReconcilePlan> {
        let merged = merge(&self.sources)?;
        let script = render_upsert(&merged.set);
        Ok(ReconcilePlan {
            set: merged.set,
            script,
            sources: merged.sources,
        })
    }

    pub fn run(&self) -> Result<ReconcileSummary> {
        let plan = self.plan()?;
        let sink = OutputSink::new(self.config.resolved_output());
        let written = sink
            .write(plan.script.sql.as_bytes())
            .context("writing permissions script")?;

        info!(
            total = plan.set.len(),
            rows = plan.script.rows,
            output = %written.path.display(),
            "reconciled permissions"
        );

        let report_path = match self.config.resolved_report() {
            Some(path) => {
                let report = RunReport {
                    generated_at: Utc::now(),
                    output_path: written.path.display().to_string(),
                    output_sha256: written.content_hash.clone(),
                    output_changed: written.changed,
                    total_permissions: plan.set.len(),
                    emitted_rows: plan.script.rows,
                    sources: plan.sources.clone(),
                };
                write_report(&path, &report)?;
                Some(path)
            }
            None => None,
        };

        Ok(ReconcileSummary {
            total_permissions: plan.set.len(),
            emitted_rows: plan.script.rows,
            output_path: written.path,
            output_sha256: written.content_hash,
            output_changed: written.changed,
            report_path,
        })
    }

    pub fn check(&self) -> Result<CheckOutcome> {
        let plan = self.plan()?;
        let sink = OutputSink::new(self.config.resolved_output());
        let current = sink
            .is_current(plan.script.sql.as_bytes())
            .context("comparing permissions script")?;
        if current {
            Ok(CheckOutcome::UpToDate)
        } else {
            Ok(CheckOutcome::Stale {
                path: sink.path().to_path_buf(),
            })
        }
    }
}

pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}
