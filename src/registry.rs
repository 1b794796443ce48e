//! Name-keyed registries holding the entities of one kind.

use std::collections::btree_map::{BTreeMap, Entry};
use std::path::{Component, Path};
use std::sync::Arc;

use tracing::debug;

use crate::archive::ArchiveHandle;
use crate::entity::{Entity, EntityKind};
use crate::error::{CffError, Result};
use crate::manifest::{Descriptor, MANIFEST_MEMBER};

/// The entities of kind `K` in one container, keyed by unique name.
///
/// Iteration is sorted by name.
#[derive(Debug)]
pub struct Registry<K: EntityKind> {
    archive: Arc<ArchiveHandle>,
    entities: BTreeMap<String, Entity<K>>,
}

impl<K: EntityKind> Registry<K> {
    pub(crate) fn new(archive: Arc<ArchiveHandle>) -> Self {
        Registry {
            archive,
            entities: BTreeMap::new(),
        }
    }

    /// Register an entity, attaching it to this registry's archive.
    ///
    /// # Errors
    ///
    /// - `CffError::InvalidName` if the name is blank.
    /// - `CffError::InvalidSource` if the source path cannot name an archive member.
    /// - `CffError::DuplicateName` if the name is taken. The registry is left unchanged.
    pub fn add(&mut self, mut entity: Entity<K>) -> Result<()> {
        if entity.name().trim().is_empty() {
            return Err(CffError::InvalidName(K::LABEL));
        }
        if !is_member_path(entity.src()) {
            return Err(CffError::InvalidSource(K::LABEL, entity.src().to_owned()));
        }
        match self.entities.entry(entity.name().to_owned()) {
            Entry::Occupied(e) => Err(CffError::DuplicateName(K::LABEL, e.key().clone())),
            Entry::Vacant(slot) => {
                entity.attach(Arc::clone(&self.archive));
                debug!(kind = K::LABEL, name = entity.name(), "registered");
                let _ = slot.insert(entity);
                Ok(())
            }
        }
    }

    /// Unregister an entity. Its payload is released and it is detached
    /// from the archive before being handed back.
    ///
    /// A loaded entity keeps its bytes, modifications included, and carries
    /// them into whichever container it is added to next. An entity that was
    /// never loaded carries nothing: once added elsewhere it reads `src` from
    /// that container's archive.
    pub fn remove(&mut self, name: &str) -> Result<Entity<K>> {
        let mut entity = self
            .entities
            .remove(name)
            .ok_or_else(|| CffError::NotFound(K::LABEL, name.to_owned()))?;
        entity.detach();
        debug!(kind = K::LABEL, name, "unregistered");
        Ok(entity)
    }

    /// Fetch an entity by name.
    pub fn get(&self, name: &str) -> Result<&Entity<K>> {
        self.entities
            .get(name)
            .ok_or_else(|| CffError::NotFound(K::LABEL, name.to_owned()))
    }

    /// Fetch an entity by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Entity<K>> {
        self.entities
            .get_mut(name)
            .ok_or_else(|| CffError::NotFound(K::LABEL, name.to_owned()))
    }

    /// Whether an entity with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Iterate over the entities, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &Entity<K>> {
        self.entities.values()
    }

    /// Iterate mutably over the entities, sorted by name.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity<K>> {
        self.entities.values_mut()
    }

    /// Release every loaded payload.
    pub fn close_all(&mut self) {
        self.entities.values_mut().for_each(Entity::close);
    }

    pub(crate) fn descriptors(&self) -> BTreeMap<String, Descriptor> {
        self.entities
            .iter()
            .map(|(name, e)| (name.clone(), e.to_descriptor()))
            .collect()
    }
}

/// A relative path without parent components, other than the manifest.
fn is_member_path(src: &str) -> bool {
    let path = Path::new(src);
    !src.trim().is_empty()
        && src != MANIFEST_MEMBER
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
