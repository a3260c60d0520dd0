//! Core permission model shared by the extraction and reconcile stages.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "permrec-core";

/// SQL expressions that stand in for "let the database pick an id".
pub const UUID_GENERATOR_CALLS: [&str; 2] = ["uuid_generate_v4()", "uuid_generate_v7()"];

/// Expression emitted for every row that has no literal id.
pub const EMITTED_UUID_GENERATOR: &str = "uuid_generate_v7()";

/// Identifier carried by a permission row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PermissionId {
    /// No usable id in the source; the emitted row calls the generator.
    #[default]
    Generated,
    /// Pre-existing id kept verbatim.
    Literal(String),
}

impl PermissionId {
    /// Classify the raw `id` field text of a source row.
    pub fn from_source_field(raw: Option<&str>) -> Self {
        match raw {
            None => Self::Generated,
            Some(text) if text.is_empty() || is_uuid_generator_call(text) => Self::Generated,
            Some(text) => Self::Literal(text.to_string()),
        }
    }

    pub fn literal(&self) -> Option<&str> {
        match self {
            Self::Generated => None,
            Self::Literal(value) => Some(value.as_str()),
        }
    }
}

pub fn is_uuid_generator_call(text: &str) -> bool {
    UUID_GENERATOR_CALLS.contains(&text)
}

/// One permission row as read from a source, before merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub code: String,
    pub module: String,
    pub description: String,
    pub id: PermissionId,
}

impl PermissionRecord {
    pub fn new(
        code: impl Into<String>,
        module: impl Into<String>,
        description: impl Into<String>,
        id: PermissionId,
    ) -> Self {
        Self {
            code: code.into(),
            module: module.into(),
            description: description.into(),
            id,
        }
    }

    pub fn into_keyed_entry(self) -> (String, PermissionEntry) {
        (
            self.code,
            PermissionEntry {
                module: self.module,
                description: self.description,
                id: self.id,
            },
        )
    }
}

/// Merged value stored per permission code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub module: String,
    pub description: String,
    pub id: PermissionId,
}
