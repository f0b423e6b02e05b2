//! Registry of record kinds that reference a resource.
//!
//! Consolidation walks this registry and nothing else. Adding a kind that points
//! at `resources` means adding one entry here (or in `HITLEDGER_EXTRA_KINDS`).

use hitledger_common::{Config, DependentKind};

use crate::error::{Result, StoreError};

/// Table holding hits. Hits reference a resource like any other dependent kind
/// and are repointed with it during a merge.
pub const HITS_TABLE: &str = "hits";

#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: Vec<DependentKind>,
}

impl KindRegistry {
    /// A registry with no kinds at all.
    pub fn empty() -> Self {
        Self { kinds: Vec::new() }
    }

    /// Built-in kinds plus any configured extras.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::default();
        for kind in &config.extra_dependent_kinds {
            registry.register(kind.clone())?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, kind: DependentKind) -> Result<()> {
        kind.validate()?;
        if self.kinds.iter().any(|k| k.name == kind.name) {
            return Err(StoreError::DuplicateKind(kind.name));
        }
        self.kinds.push(kind);
        Ok(())
    }

    pub fn with(mut self, kind: DependentKind) -> Result<Self> {
        self.register(kind)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&DependentKind> {
        self.kinds.iter().find(|k| k.name == name)
    }

    pub fn kinds(&self) -> &[DependentKind] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self {
            kinds: vec![
                DependentKind::new("hits", HITS_TABLE),
                DependentKind::new("sharepoint_event_metadata", "sharepoint_event_metadata"),
                DependentKind::new("copilot_file_metadata", "copilot_file_metadata"),
                DependentKind::new("page_comments", "page_comments"),
                DependentKind::new("page_likes", "page_likes"),
                DependentKind::new(
                    "file_metadata_property_values",
                    "file_metadata_property_values",
                ),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hitledger_common::ConfigError;

    #[test]
    fn default_registry_covers_hits_and_metadata_tables() {
        let registry = KindRegistry::default();
        assert_eq!(registry.len(), 6);
        assert!(registry.get("hits").is_some());
        assert!(registry.get("page_likes").is_some());
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let err = KindRegistry::default()
            .with(DependentKind::new("page_likes", "other_likes"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKind(ref n) if n == "page_likes"));
    }

    #[test]
    fn register_rejects_bad_identifiers() {
        let err = KindRegistry::empty()
            .with(DependentKind::new("shares", "page shares"))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidKind(ConfigError::InvalidKind { .. })
        ));
    }

    #[test]
    fn from_config_appends_extras_after_defaults() {
        let config = Config {
            database_url: "postgres://localhost/hits".to_string(),
            max_db_connections: 1,
            ingest_row_concurrency: 1,
            extra_dependent_kinds: vec![DependentKind::new("page_shares", "page_shares")],
        };
        let registry = KindRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 7);
        assert_eq!(registry.kinds().last().unwrap().name, "page_shares");
    }
}
