//! Scope authority: which grant a library route requires.
//!
//! Libraries own a scope prefix (`books`, `comics`, ...). A route guarded at
//! role `admin` for library 3 requires the grant `<prefix of 3>:admin`.
//!
//! The `library id -> prefix` mapping is read through [`LibraryScopeIndex`],
//! a lazily built, process-wide cache in front of a [`LibraryDirectory`].
//! It is an optimization only: after [`LibraryScopeIndex::clear_mapping`] the
//! next lookup rebuilds it from the directory.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use catalog_scope::{Requirement, Role, ScopeGrant};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::config::LibraryConfig;
use crate::{Error, Result};

/// Stable library identifier.
pub type LibraryId = u64;

/// A library as far as authorization is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryRecord {
    /// Library id
    pub id: LibraryId,
    /// Display name
    pub name: String,
    /// Scope prefix
    pub scope: String,
}

impl From<&LibraryConfig> for LibraryRecord {
    fn from(config: &LibraryConfig) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            scope: config.scope.clone(),
        }
    }
}

/// Source of truth for libraries.
#[async_trait::async_trait]
pub trait LibraryDirectory: Send + Sync + 'static {
    /// Every library.
    async fn all(&self) -> Result<Vec<LibraryRecord>>;
}

/// In-memory [`LibraryDirectory`], loaded from configuration.
#[derive(Default)]
pub struct InMemoryLibraryDirectory {
    libraries: RwLock<HashMap<LibraryId, LibraryRecord>>,
}

impl InMemoryLibraryDirectory {
    /// Create a directory holding `libraries`.
    pub fn new(libraries: impl IntoIterator<Item = LibraryRecord>) -> Self {
        Self {
            libraries: RwLock::new(libraries.into_iter().map(|l| (l.id, l)).collect()),
        }
    }

    /// Create a directory from the `libraries` config section.
    #[must_use]
    pub fn from_config(libraries: &[LibraryConfig]) -> Self {
        Self::new(libraries.iter().map(LibraryRecord::from))
    }

    /// Insert or replace a library.
    pub fn upsert(&self, library: LibraryRecord) {
        self.libraries.write().insert(library.id, library);
    }

    /// Look up one library.
    #[must_use]
    pub fn get(&self, id: LibraryId) -> Option<LibraryRecord> {
        self.libraries.read().get(&id).cloned()
    }

    /// Rename a library. Returns the updated record, or `None` if it does not
    /// exist.
    pub fn rename(&self, id: LibraryId, name: impl Into<String>) -> Option<LibraryRecord> {
        let mut libraries = self.libraries.write();
        let library = libraries.get_mut(&id)?;
        library.name = name.into();
        Some(library.clone())
    }

    /// Change a library's scope prefix. Returns `false` if it does not exist.
    ///
    /// Callers must clear the scope index afterwards for the change to take
    /// effect.
    pub fn set_scope(&self, id: LibraryId, scope: impl Into<String>) -> bool {
        match self.libraries.write().get_mut(&id) {
            Some(library) => {
                library.scope = scope.into();
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl LibraryDirectory for InMemoryLibraryDirectory {
    async fn all(&self) -> Result<Vec<LibraryRecord>> {
        Ok(self.libraries.read().values().cloned().collect())
    }
}

type Mapping = HashMap<LibraryId, String>;

/// Read-through cache of `library id -> scope prefix`.
///
/// A rebuild records the generation it started at and installs its result
/// only if no [`clear_mapping`](Self::clear_mapping) happened meanwhile, so a
/// slow rebuild can never resurrect data that was invalidated under it.
pub struct LibraryScopeIndex {
    directory: Arc<dyn LibraryDirectory>,
    mapping: RwLock<Option<Arc<Mapping>>>,
    generation: AtomicU64,
}

impl LibraryScopeIndex {
    /// Create an empty index over `directory`.
    #[must_use]
    pub fn new(directory: Arc<dyn LibraryDirectory>) -> Self {
        Self {
            directory,
            mapping: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// The scope prefix of library `id`, or `None` if there is no such library.
    pub async fn prefix_for(&self, id: LibraryId) -> Result<Option<String>> {
        let cached = self.mapping.read().clone();
        let mapping = match cached {
            Some(mapping) => mapping,
            None => self.rebuild().await?,
        };
        Ok(mapping.get(&id).cloned())
    }

    async fn rebuild(&self) -> Result<Arc<Mapping>> {
        let started_at = self.generation.load(Ordering::Acquire);
        let fresh: Arc<Mapping> = Arc::new(
            self.directory
                .all()
                .await?
                .into_iter()
                .map(|l| (l.id, l.scope))
                .collect(),
        );

        let mut slot = self.mapping.write();
        if self.generation.load(Ordering::Acquire) == started_at {
            debug!(libraries = fresh.len(), "Library scope index rebuilt");
            *slot = Some(Arc::clone(&fresh));
        } else {
            debug!("Library scope index invalidated during rebuild; result not cached");
        }
        Ok(fresh)
    }

    /// Drop the cached mapping. The next lookup rebuilds it.
    pub fn clear_mapping(&self) {
        let mut slot = self.mapping.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        *slot = None;
    }

    /// Returns `true` while a mapping is cached.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.mapping.read().is_some()
    }
}

/// Decides what a route requires and whether a scope grants it.
pub struct ScopeAuthority {
    index: LibraryScopeIndex,
}

impl ScopeAuthority {
    /// Create an authority over `directory`.
    #[must_use]
    pub fn new(directory: Arc<dyn LibraryDirectory>) -> Self {
        Self {
            index: LibraryScopeIndex::new(directory),
        }
    }

    /// The grant required to act as `role` in library `library_id`.
    ///
    /// Fails with [`Error::NotFound`] for an unknown library.
    pub async fn required_scope(&self, library_id: LibraryId, role: Role) -> Result<ScopeGrant> {
        self.index
            .prefix_for(library_id)
            .await?
            .map(|prefix| ScopeGrant::library(prefix, role))
            .ok_or_else(|| Error::NotFound(format!("library {library_id}")))
    }

    /// Whether `token_scope` meets `requirement`.
    #[must_use]
    pub fn satisfies(&self, token_scope: &str, requirement: &Requirement) -> bool {
        catalog_scope::satisfies(token_scope, requirement)
    }

    /// Invalidate the library scope index.
    pub fn clear_mapping(&self) {
        self.index.clear_mapping();
    }

    /// The underlying index.
    #[must_use]
    pub fn index(&self) -> &LibraryScopeIndex {
        &self.index
    }
}
