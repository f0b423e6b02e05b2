//! Domain types shared by the store and the engine. No I/O.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

static RE_SQL_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex"));

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A catalog row for one addressable URL.
///
/// `id` is assigned by the store and increases in creation order. Nothing at the
/// storage layer keeps `url` unique, so two rows may share it until they are
/// consolidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub url: String,
    /// Set once auxiliary metadata has been fetched for this resource.
    pub metadata_refreshed_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn is_enriched(&self) -> bool {
        self.metadata_refreshed_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Hits
// ---------------------------------------------------------------------------

/// Descriptive attributes carried by a hit. All optional; the upstream source
/// fills in what it knows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitAttributes {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub device_model: Option<String>,
    #[serde(default)]
    pub client_os: Option<String>,
}

/// A candidate hit as delivered by the telemetry source, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewHit {
    /// Natural key. Assigned upstream, unique for the lifetime of the store.
    pub request_id: Uuid,
    /// Logical key of the resource this hit concerns.
    pub url: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub attributes: HitAttributes,
}

impl NewHit {
    pub fn new(request_id: Uuid, url: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            request_id,
            url: url.into(),
            occurred_at,
            attributes: HitAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: HitAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Reason this row can never be persisted, if any.
    pub fn validation_error(&self) -> Option<String> {
        if self.request_id.is_nil() {
            return Some("request id is nil".to_string());
        }
        if self.url.trim().is_empty() {
            return Some("url is empty".to_string());
        }
        None
    }
}

/// An ordered, in-memory set of candidate hits submitted together.
///
/// Re-submitting the same batch after a partial failure is safe: rows already
/// persisted collide on their request id and are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    rows: Vec<NewHit>,
}

impl Batch {
    pub fn new(rows: Vec<NewHit>) -> Self {
        Self { rows }
    }

    pub fn push(&mut self, hit: NewHit) {
        self.rows.push(hit);
    }

    pub fn rows(&self) -> &[NewHit] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of distinct request ids in the batch.
    pub fn distinct_request_ids(&self) -> usize {
        let mut ids: Vec<Uuid> = self.rows.iter().map(|r| r.request_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

impl FromIterator<NewHit> for Batch {
    fn from_iter<I: IntoIterator<Item = NewHit>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Dependent records
// ---------------------------------------------------------------------------

/// A record kind that holds a reference to a resource.
///
/// This is the accessor/mutator pair the consolidator uses to repoint records:
/// `table.reference_column` holds the resource id and `table.id_column` addresses
/// a single record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependentKind {
    pub name: String,
    pub table: String,
    pub reference_column: String,
    pub id_column: String,
}

impl DependentKind {
    /// A kind stored in `table`, referencing resources through `resource_id`
    /// and addressed by `id`.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            reference_column: "resource_id".to_string(),
            id_column: "id".to_string(),
        }
    }

    pub fn with_reference_column(mut self, column: impl Into<String>) -> Self {
        self.reference_column = column.into();
        self
    }

    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    /// Table and column names end up inside SQL text, so they must be plain
    /// identifiers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidKind {
                entry: self.name.clone(),
                reason: "kind name is empty".to_string(),
            });
        }
        for ident in [&self.table, &self.reference_column, &self.id_column] {
            if !RE_SQL_IDENT.is_match(ident) {
                return Err(ConfigError::InvalidKind {
                    entry: self.name.clone(),
                    reason: format!("`{ident}` is not a valid SQL identifier"),
                });
            }
        }
        Ok(())
    }

    /// Parse `name:table:column[:id_column]`.
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = entry.trim().split(':').map(str::trim).collect();
        let kind = match parts.as_slice() {
            [name, table, column] => Self::new(*name, *table).with_reference_column(*column),
            [name, table, column, id] => Self::new(*name, *table)
                .with_reference_column(*column)
                .with_id_column(*id),
            _ => {
                return Err(ConfigError::InvalidKind {
                    entry: entry.to_string(),
                    reason: "expected name:table:column[:id_column]".to_string(),
                })
            }
        };
        kind.validate()?;
        Ok(kind)
    }
}

/// One record of some dependent kind, as seen during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentRecord {
    pub kind: String,
    pub id: i64,
    pub resource_id: i64,
}
