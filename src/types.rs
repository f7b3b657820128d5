// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core vocabulary: write modes, operation kinds, store targets, operation references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Policy deciding which store(s) take part in a call and in what order.
///
/// Stored externally (see [`crate::write_mode`]) and read on every dispatched call.
/// Legacy `MASTER_*`/`SLAVE_*` spellings are accepted when parsing; serialization
/// always uses the canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteMode {
    /// Everything goes to the primary store only.
    #[serde(alias = "MASTER_ONLY")]
    PrimaryOnly,
    /// Write primary synchronously, replicate to secondary.
    #[serde(alias = "MASTER_SLAVE", alias = "PRIMARY_SECONDARY")]
    PrimaryThenSecondary,
    /// Write secondary synchronously, replicate to primary.
    #[serde(alias = "SLAVE_MASTER", alias = "SECONDARY_MASTER", alias = "SECONDARY_PRIMARY")]
    SecondaryThenPrimary,
    /// Everything goes to the secondary store only.
    #[serde(alias = "SLAVE_ONLY")]
    SecondaryOnly,
}

impl WriteMode {
    /// All modes, in migration order.
    pub const ALL: [WriteMode; 4] = [
        WriteMode::PrimaryOnly,
        WriteMode::PrimaryThenSecondary,
        WriteMode::SecondaryThenPrimary,
        WriteMode::SecondaryOnly,
    ];

    /// Canonical name, as persisted in the write-mode store.
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::PrimaryOnly => "PRIMARY_ONLY",
            WriteMode::PrimaryThenSecondary => "PRIMARY_THEN_SECONDARY",
            WriteMode::SecondaryThenPrimary => "SECONDARY_THEN_PRIMARY",
            WriteMode::SecondaryOnly => "SECONDARY_ONLY",
        }
    }

    /// Whether this mode writes to both stores.
    pub fn is_dual(&self) -> bool {
        matches!(
            self,
            WriteMode::PrimaryThenSecondary | WriteMode::SecondaryThenPrimary
        )
    }
}

impl Default for WriteMode {
    fn default() -> Self {
        WriteMode::PrimaryOnly
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored write-mode value that matches no known mode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized write mode: {0:?}")]
pub struct UnknownWriteMode(pub String);

impl FromStr for WriteMode {
    type Err = UnknownWriteMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "PRIMARY_ONLY" | "MASTER_ONLY" => Ok(WriteMode::PrimaryOnly),
            "PRIMARY_THEN_SECONDARY" | "PRIMARY_SECONDARY" | "MASTER_SLAVE" => {
                Ok(WriteMode::PrimaryThenSecondary)
            }
            "SECONDARY_THEN_PRIMARY" | "SECONDARY_PRIMARY" | "SECONDARY_MASTER"
            | "SLAVE_MASTER" => Ok(WriteMode::SecondaryThenPrimary),
            "SECONDARY_ONLY" | "SLAVE_ONLY" => Ok(WriteMode::SecondaryOnly),
            _ => Err(UnknownWriteMode(s.to_string())),
        }
    }
}

/// What a data-access call does, derived once per call by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Read,
    Create,
    Update,
    Delete,
    Unknown,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Unknown => "unknown",
        }
    }

    /// Anything but `Read` may mutate a store.
    pub fn is_write(&self) -> bool {
        !matches!(self, OperationKind::Read)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two data stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreTarget {
    Primary,
    Secondary,
}

impl StoreTarget {
    /// The other store.
    pub fn complement(&self) -> StoreTarget {
        match self {
            StoreTarget::Primary => StoreTarget::Secondary,
            StoreTarget::Secondary => StoreTarget::Primary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreTarget::Primary => "primary",
            StoreTarget::Secondary => "secondary",
        }
    }
}

impl fmt::Display for StoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a target operation: the collection (entity/repository) plus the
/// operation name within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationRef {
    pub collection: String,
    pub operation: String,
}

impl OperationRef {
    pub fn new(collection: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            operation: operation.into(),
        }
    }

    /// Split a fully qualified id (`"orders.OrderRepo.insertOrder"`) at the last dot.
    ///
    /// An id without a dot is treated as a bare operation name in an empty collection.
    pub fn parse(qualified: &str) -> Self {
        match qualified.rsplit_once('.') {
            Some((collection, operation)) => Self::new(collection, operation),
            None => Self::new("", qualified),
        }
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.collection.is_empty() {
            f.write_str(&self.operation)
        } else {
            write!(f, "{}.{}", self.collection, self.operation)
        }
    }
}

/// Names the declared type of one positional argument.
///
/// The descriptor list of a call selects the handler overload on replay, so
/// descriptors must be stable across processes: use explicit names rather than
/// compiler-generated type names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeDescriptor(pub String);

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeDescriptor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
