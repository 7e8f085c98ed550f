//! Registry of tenant-owned tables.
//!
//! Every table listed here gets the row policy installed and checked by the
//! health probe. Entity kinds are Rust types implementing [`TenantOwned`],
//! so the set of tables a soft delete can target is closed at compile time.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static IDENT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").ok());

/// Errors raised while building the table registry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("table '{0}' registered twice")]
    Duplicate(String),
}

/// Physical description of a tenant-owned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name (unqualified).
    pub name: &'static str,
    /// Column holding the owning tenant id.
    pub tenant_column: &'static str,
    /// Primary key column, addressed by soft delete.
    pub key_column: &'static str,
}

impl TableSpec {
    #[must_use]
    pub const fn new(name: &'static str, tenant_column: &'static str, key_column: &'static str) -> Self {
        Self {
            name,
            tenant_column,
            key_column,
        }
    }

    /// Validate every identifier: they are interpolated into generated DDL.
    ///
    /// # Errors
    /// Returns `TableError::InvalidIdentifier` for the first name that is not a plain
    /// lower-case SQL identifier.
    pub fn validate(&self) -> Result<(), TableError> {
        for ident in [self.name, self.tenant_column, self.key_column] {
            if !is_identifier(ident) {
                return Err(TableError::InvalidIdentifier(ident.to_owned()));
            }
        }
        Ok(())
    }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    IDENT_RE.as_ref().is_some_and(|re| re.is_match(s))
}

/// A tenant-owned entity kind.
pub trait TenantOwned {
    const TABLE: TableSpec;
}

/// Entity kinds whose rows are retired by flipping an active flag instead of deleting.
pub trait SoftDelete: TenantOwned {
    /// Boolean column cleared by [`crate::soft_delete`].
    const ACTIVE_COLUMN: &'static str;
}

/// Validated, duplicate-free set of tenant-owned tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantTables {
    specs: Vec<TableSpec>,
}

impl TenantTables {
    #[must_use]
    pub fn builder() -> TenantTablesBuilder {
        TenantTablesBuilder::default()
    }

    /// Build a registry from explicit specs.
    ///
    /// # Errors
    /// Returns `TableError` when a spec is invalid or a table appears twice.
    pub fn new(specs: impl IntoIterator<Item = TableSpec>) -> Result<Self, TableError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for spec in specs {
            spec.validate()?;
            if !seen.insert(spec.name) {
                return Err(TableError::Duplicate(spec.name.to_owned()));
            }
            out.push(spec);
        }
        Ok(Self { specs: out })
    }

    #[must_use]
    pub fn specs(&self) -> &[TableSpec] {
        &self.specs
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.specs.iter().map(|s| s.name).collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TenantTablesBuilder {
    specs: Vec<TableSpec>,
}

impl TenantTablesBuilder {
    #[must_use]
    pub fn register<E: TenantOwned>(mut self) -> Self {
        self.specs.push(E::TABLE);
        self
    }

    #[must_use]
    pub fn spec(mut self, spec: TableSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Finish the registry.
    ///
    /// # Errors
    /// Returns `TableError` when a spec is invalid or a table appears twice.
    pub fn build(self) -> Result<TenantTables, TableError> {
        TenantTables::new(self.specs)
    }
}
