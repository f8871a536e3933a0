//! Configuration for the ID mapper.

use idmap_docstore::EntityId;
use std::time::Duration;

/// Default retention window for mapping records.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Configuration for [`crate::IdMapper`].
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Prefix marking an identifier as temporary.
    pub temp_prefix: String,
    /// Collection holding mapping records.
    pub mapping_collection: String,
    /// Collection holding outbox entries.
    pub outbox_collection: String,
    /// Field cleared on an entity once it has been reconciled.
    pub modified_flag_field: String,
    /// Age after which mapping records are purged.
    pub retention: Duration,
    /// Keep mappings still referenced by pending outbox entries when
    /// purging.
    pub retention_cross_check: bool,
}

impl MapperConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            temp_prefix: "temp_".into(),
            mapping_collection: "id_mappings".into(),
            outbox_collection: "outbox".into(),
            modified_flag_field: "locally_modified".into(),
            retention: DEFAULT_RETENTION,
            retention_cross_check: true,
        }
    }

    /// Sets the temporary ID prefix.
    #[must_use]
    pub fn with_temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.temp_prefix = prefix.into();
        self
    }

    /// Sets the mapping collection name.
    #[must_use]
    pub fn with_mapping_collection(mut self, name: impl Into<String>) -> Self {
        self.mapping_collection = name.into();
        self
    }

    /// Sets the outbox collection name.
    #[must_use]
    pub fn with_outbox_collection(mut self, name: impl Into<String>) -> Self {
        self.outbox_collection = name.into();
        self
    }

    /// Sets the locally-modified flag field.
    #[must_use]
    pub fn with_modified_flag_field(mut self, field: impl Into<String>) -> Self {
        self.modified_flag_field = field.into();
        self
    }

    /// Sets the mapping retention window.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Enables or disables the outbox cross-check during purges.
    #[must_use]
    pub fn with_retention_cross_check(mut self, enabled: bool) -> Self {
        self.retention_cross_check = enabled;
        self
    }

    /// Returns true if `id` carries the temporary marker.
    ///
    /// Integer IDs are never temporary.
    #[must_use]
    pub fn is_temporary(&self, id: &EntityId) -> bool {
        id.as_text().is_some_and(|s| self.is_temporary_str(s))
    }

    /// Returns true if the string carries the temporary marker.
    #[must_use]
    pub fn is_temporary_str(&self, id: &str) -> bool {
        id.len() > self.temp_prefix.len() && id.starts_with(&self.temp_prefix)
    }
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self::new()
    }
}
