//! Foreign-key registry.
//!
//! The registry tells the repairer where temporary IDs of one entity type
//! can appear in other stores. It is plain immutable configuration and must
//! cover every foreign key the host schema defines: a field missing from
//! the registry is never rewritten.

use crate::error::{ReconcileError, ReconcileResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One foreign-key field and the stores that carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Field name holding the reference.
    #[serde(skip)]
    pub field: String,
    /// Entity type the field points at.
    pub referenced_entity_type: String,
    /// Stores whose documents may hold the field.
    pub dependent_stores: Vec<String>,
}

/// Immutable map from foreign-key field name to [`ForeignKey`].
///
/// # Example
///
/// ```rust
/// use idmap_core::FkRegistry;
///
/// let registry = FkRegistry::new()
///     .with_foreign_key("participant_id", "participants", ["attendance", "honors"]);
/// assert_eq!(registry.references_to("participants").count(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FkRegistry {
    entries: BTreeMap<String, ForeignKey>,
}

impl FkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a foreign-key field. A later entry for the same field replaces
    /// the earlier one.
    #[must_use]
    pub fn with_foreign_key<I, S>(
        mut self,
        field: impl Into<String>,
        referenced_entity_type: impl Into<String>,
        dependent_stores: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let field = field.into();
        self.entries.insert(
            field.clone(),
            ForeignKey {
                field,
                referenced_entity_type: referenced_entity_type.into(),
                dependent_stores: dependent_stores.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    /// Parses a registry from JSON of the form
    /// `{"participant_id": {"referenced_entity_type": "participants",
    /// "dependent_stores": ["attendance"]}}`.
    pub fn from_json(json: &str) -> ReconcileResult<Self> {
        let raw: BTreeMap<String, ForeignKey> = serde_json::from_str(json)?;
        let entries = raw
            .into_iter()
            .map(|(field, mut fk)| {
                fk.field = field.clone();
                (field, fk)
            })
            .collect();
        let registry = Self { entries };
        registry.validate()?;
        Ok(registry)
    }

    /// Checks that every entry is well formed.
    pub fn validate(&self) -> ReconcileResult<()> {
        for fk in self.entries.values() {
            if fk.field.is_empty() {
                return Err(ReconcileError::InvalidRegistry("empty field name".into()));
            }
            if fk.referenced_entity_type.is_empty() {
                return Err(ReconcileError::InvalidRegistry(format!(
                    "field `{}` references no entity type",
                    fk.field
                )));
            }
            if fk.dependent_stores.is_empty() {
                return Err(ReconcileError::InvalidRegistry(format!(
                    "field `{}` lists no dependent stores",
                    fk.field
                )));
            }
        }
        Ok(())
    }

    /// Looks up a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&ForeignKey> {
        self.entries.get(field)
    }

    /// All entries, ordered by field name.
    pub fn iter(&self) -> impl Iterator<Item = &ForeignKey> {
        self.entries.values()
    }

    /// Number of registered fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose field points at `entity_type`.
    pub fn references_to<'a>(&'a self, entity_type: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.entries
            .values()
            .filter(move |fk| fk.referenced_entity_type == entity_type)
    }

    /// Entries whose field may appear in documents of `store`.
    pub fn fields_in<'a>(&'a self, store: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.entries
            .values()
            .filter(move |fk| fk.dependent_stores.iter().any(|s| s == store))
    }

    /// Every store name the registry mentions, referenced or dependent.
    #[must_use]
    pub fn store_names(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        for fk in self.entries.values() {
            names.insert(fk.referenced_entity_type.as_str());
            names.extend(fk.dependent_stores.iter().map(String::as_str));
        }
        names
    }
}
