// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation classifier: call metadata → [`OperationKind`].
//!
//! Three signals, strongest first:
//!
//! 1. An explicit [`CommandTag`] attached to the call.
//! 2. The leading keyword of the statement text, if the call carries one.
//! 3. Case-insensitive prefixes of the operation name.
//!
//! Argument values are never inspected. Classification is a pure function of
//! the call's identity, so the same call always lands on the same path.

use crate::metrics;
use crate::types::{OperationKind, OperationRef};
use tracing::warn;

/// Statically known command type of a call, as a query layer would tag it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    Select,
    Insert,
    Update,
    Delete,
    /// Tagged, but not as one of the four data commands (e.g. a flush).
    /// Classification falls through to the weaker signals.
    Other,
}

impl CommandTag {
    fn kind(&self) -> Option<OperationKind> {
        match self {
            CommandTag::Select => Some(OperationKind::Read),
            CommandTag::Insert => Some(OperationKind::Create),
            CommandTag::Update => Some(OperationKind::Update),
            CommandTag::Delete => Some(OperationKind::Delete),
            CommandTag::Other => None,
        }
    }
}

/// Everything the classifier is allowed to look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    pub tag: Option<CommandTag>,
    /// Declared operation name (`findUserById`), without the collection.
    pub name: String,
    /// Statement text, when the call is backed by one.
    pub statement: Option<String>,
}

impl CallMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn for_operation(op: &OperationRef) -> Self {
        Self::named(op.operation.clone())
    }

    pub fn with_tag(mut self, tag: CommandTag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }
}

const READ_PREFIXES: &[&str] = &["select", "get", "find", "query", "count", "list"];
const CREATE_PREFIXES: &[&str] = &["insert", "add", "save", "create"];
const UPDATE_PREFIXES: &[&str] = &["update", "modify", "edit"];
const DELETE_PREFIXES: &[&str] = &["delete", "remove"];

/// Classify a call from its metadata.
pub fn classify(metadata: &CallMetadata) -> OperationKind {
    if let Some(kind) = metadata.tag.as_ref().and_then(CommandTag::kind) {
        return kind;
    }
    match metadata.statement.as_deref() {
        Some(sql) if !sql.trim().is_empty() => classify_sql(&metadata.name, sql),
        _ => classify_by_name(&metadata.name),
    }
}

/// Classify by the leading keyword of a statement, falling back to the name.
pub fn classify_sql(name: &str, sql: &str) -> OperationKind {
    let head = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    match head.as_str() {
        "SELECT" => OperationKind::Read,
        "INSERT" => OperationKind::Create,
        "UPDATE" => OperationKind::Update,
        "DELETE" => OperationKind::Delete,
        "" => classify_by_name(name),
        _ => {
            warn!(name = %name, keyword = %head, "Statement keyword not recognized, classifying by name");
            classify_by_name(name)
        }
    }
}

/// Classify by case-insensitive name prefix alone.
pub fn classify_by_name(name: &str) -> OperationKind {
    let lower = name.trim().to_ascii_lowercase();
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| lower.starts_with(p));

    if lower.is_empty() {
        OperationKind::Unknown
    } else if starts(READ_PREFIXES) {
        OperationKind::Read
    } else if starts(CREATE_PREFIXES) {
        OperationKind::Create
    } else if starts(UPDATE_PREFIXES) {
        OperationKind::Update
    } else if starts(DELETE_PREFIXES) {
        OperationKind::Delete
    } else {
        warn!(name = %name, "Unclassifiable operation name");
        metrics::record_policy_anomaly("unclassifiable");
        OperationKind::Unknown
    }
}
