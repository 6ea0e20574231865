//! Entity registry: the authoritative in-memory table of containers and images.
//!
//! Every read returns a cloned snapshot taken under the table lock, so callers
//! never observe a half-applied mutation. Status changes go exclusively through
//! [`Registry::compare_and_set_status`]; every successful mutation publishes a
//! [`RegistryEvent`] to subscribers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{KeelError, Result};

pub mod types;

pub use types::{
    Container, ContainerId, ContainerSpec, ContainerStatus, DANGLING, Image, ImageReference,
    PortMapping, Protocol, RegistryEvent, ResourceLimits, RestartPolicy, RuntimeState,
};

#[derive(Default)]
struct Tables {
    containers: HashMap<ContainerId, Container>,
    /// Keyed by `repository:tag`
    images: BTreeMap<String, Image>,
}

impl Tables {
    fn users_of(&self, image_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .containers
            .values()
            .filter(|c| c.image_id == image_id)
            .map(|c| c.id.to_string())
            .collect();
        users.sort();
        users
    }

    fn with_usage(&self, image: &Image) -> Image {
        let mut image = image.clone();
        image.in_use = self.containers.values().any(|c| c.image_id == image.id);
        image
    }

    /// Resolve `repo:tag`, a bare repository (tag `latest`), a full content id
    /// or a unique id prefix.
    fn resolve_image(&self, reference: &str) -> Option<&Image> {
        if let Some(image) = self.images.get(reference) {
            return Some(image);
        }
        if let Ok(parsed) = ImageReference::parse(reference) {
            if let Some(image) = self.images.get(&parsed.to_string()) {
                return Some(image);
            }
        }
        let needle = reference.strip_prefix("sha256:").unwrap_or(reference);
        if needle.len() < 4 {
            return None;
        }
        let mut matches = self.images.values().filter(|image| {
            image
                .id
                .strip_prefix("sha256:")
                .unwrap_or(&image.id)
                .starts_with(needle)
        });
        let first = matches.next()?;
        // all tags of one id are equally good; distinct ids are ambiguous
        if matches.all(|other| other.id == first.id) {
            Some(first)
        } else {
            None
        }
    }
}

/// Authoritative store for container and image records
pub struct Registry {
    tables: RwLock<Tables>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            tables: RwLock::new(Tables::default()),
            events,
        }
    }

    // Mutations never panic while holding the lock, so a poisoned lock still
    // guards consistent tables.
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, id: &ContainerId) -> Result<Container> {
        self.read()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| KeelError::container_not_found(id.as_str()))
    }

    /// Snapshot of all containers, oldest first
    pub fn list(&self) -> Vec<Container> {
        let mut containers: Vec<Container> = self.read().containers.values().cloned().collect();
        containers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        containers
    }

    /// Insert a new container, or replace the declared fields of an existing
    /// one. The stored status and name of an existing record are never
    /// changed here.
    ///
    /// A new record must carry a unique id and a name unused by any other
    /// container, and must reference an image that is still registered.
    pub fn upsert(&self, container: Container) -> Result<()> {
        let mut tables = self.write();

        if let Some(existing) = tables.containers.get_mut(&container.id) {
            existing.spec = container.spec;
            existing.runtime = container.runtime;
            let id = existing.id.clone();
            self.publish(RegistryEvent::ContainerUpdated { id });
            return Ok(());
        }

        if let Some(holder) = tables.containers.values().find(|c| c.name == container.name) {
            return Err(KeelError::Conflict(format!(
                "container name '{}' is already used by {}",
                container.name,
                holder.id.short()
            )));
        }
        if !tables.images.values().any(|i| i.id == container.image_id) {
            return Err(KeelError::image_not_found(container.image_id.clone()));
        }

        debug!(container_id = %container.id, name = %container.name, "registering container");
        tables.containers.insert(container.id.clone(), container.clone());
        self.publish(RegistryEvent::ContainerCreated { container });
        Ok(())
    }

    /// Mutate the runtime fields of a container
    pub fn update_runtime<F>(&self, id: &ContainerId, f: F) -> Result<()>
    where
        F: FnOnce(&mut RuntimeState),
    {
        let mut tables = self.write();
        let container = tables
            .containers
            .get_mut(id)
            .ok_or_else(|| KeelError::container_not_found(id.as_str()))?;
        f(&mut container.runtime);
        self.publish(RegistryEvent::ContainerUpdated { id: id.clone() });
        Ok(())
    }

    /// Move `id` from `expected` to `next` atomically.
    ///
    /// Returns false, without mutating anything, when the container is
    /// missing, its current status differs from `expected`, or the edge is
    /// not part of the lifecycle graph.
    pub fn compare_and_set_status(
        &self,
        id: &ContainerId,
        expected: ContainerStatus,
        next: ContainerStatus,
    ) -> bool {
        let mut tables = self.write();
        let Some(container) = tables.containers.get_mut(id) else {
            return false;
        };
        if container.status != expected || !expected.can_transition_to(next) {
            return false;
        }
        container.status = next;
        debug!(container_id = %id, from = %expected, to = %next, "status transition");
        self.publish(RegistryEvent::ContainerStatusChanged {
            id: id.clone(),
            from: expected,
            to: next,
        });
        true
    }

    /// Delete a container row. Only records already in `removing` may go.
    pub fn remove(&self, id: &ContainerId) -> Result<Container> {
        let mut tables = self.write();
        let status = tables
            .containers
            .get(id)
            .map(|c| c.status)
            .ok_or_else(|| KeelError::container_not_found(id.as_str()))?;
        if status != ContainerStatus::Removing {
            return Err(KeelError::invalid_state(
                id.as_str(),
                status,
                "only containers being removed can be deleted",
            ));
        }
        let removed = tables
            .containers
            .remove(id)
            .ok_or_else(|| KeelError::container_not_found(id.as_str()))?;
        self.publish(RegistryEvent::ContainerRemoved { id: id.clone() });
        Ok(removed)
    }

    /// Register (or retag) an image under its `repository:tag`.
    ///
    /// When the tag pointed at another image id, that record is displaced.
    /// A displaced id still used by containers stays registered as a
    /// dangling, id-only entry. A displaced id nothing refers to any more is
    /// returned so the caller can drop its stored data.
    pub fn upsert_image(&self, image: Image) -> Option<Image> {
        let mut tables = self.write();
        let image = Image {
            in_use: false,
            ..image
        };

        // a retagged id is no longer dangling
        if !image.is_dangling() {
            if let Some(old) = tables.images.remove(&image.id) {
                self.publish(RegistryEvent::ImageRemoved {
                    id: old.id,
                    reference: format!("{}:{}", DANGLING, DANGLING),
                });
            }
        }

        let displaced = tables
            .images
            .insert(image.key(), image.clone())
            .filter(|old| old.id != image.id);
        let added = tables.with_usage(&image);
        self.publish(RegistryEvent::ImageAdded { image: added });

        let old = displaced?;
        if tables.images.values().any(|i| i.id == old.id) {
            return None;
        }
        if tables.users_of(&old.id).is_empty() {
            return Some(old);
        }

        debug!(image = %old.id, tag = %old.reference(), "tag moved, keeping image for its containers");
        let dangling = old.into_dangling();
        tables.images.insert(dangling.key(), dangling.clone());
        let dangling = tables.with_usage(&dangling);
        self.publish(RegistryEvent::ImageAdded { image: dangling });
        None
    }

    /// Look up an image by `repo:tag`, content id or unique id prefix
    pub fn get_image(&self, reference: &str) -> Result<Image> {
        let tables = self.read();
        tables
            .resolve_image(reference)
            .map(|image| tables.with_usage(image))
            .ok_or_else(|| KeelError::image_not_found(reference))
    }

    /// Snapshot of all images with `in_use` derived
    pub fn list_images(&self) -> Vec<Image> {
        let tables = self.read();
        tables.images.values().map(|i| tables.with_usage(i)).collect()
    }

    /// Remove images atomically with the in-use check.
    ///
    /// A `repo:tag` removes that tag; a content id removes every tag of that
    /// id. Fails with `ResourceInUse` while any container references the id.
    pub fn remove_image(&self, reference: &str) -> Result<Vec<Image>> {
        let mut tables = self.write();
        let target = tables
            .resolve_image(reference)
            .cloned()
            .ok_or_else(|| KeelError::image_not_found(reference))?;

        let users = tables.users_of(&target.id);
        if !users.is_empty() {
            return Err(KeelError::ResourceInUse {
                id: target.id,
                containers: users,
            });
        }

        let by_tag = tables.images.contains_key(reference)
            || ImageReference::parse(reference)
                .map(|r| tables.images.contains_key(&r.to_string()))
                .unwrap_or(false);

        let keys: Vec<String> = if by_tag {
            vec![target.key()]
        } else {
            tables
                .images
                .iter()
                .filter(|(_, image)| image.id == target.id)
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(image) = tables.images.remove(&key) {
                self.publish(RegistryEvent::ImageRemoved {
                    id: image.id.clone(),
                    reference: key,
                });
                removed.push(image);
            }
        }
        Ok(removed)
    }

    /// True if some remaining tag still points at `image_id`
    pub fn has_image_id(&self, image_id: &str) -> bool {
        self.read().images.values().any(|i| i.id == image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str, repo: &str, tag: &str) -> Image {
        Image {
            id: id.to_string(),
            repository: repo.to_string(),
            tag: tag.to_string(),
            size: 1024,
            created_at: chrono::Utc::now(),
            command: vec![],
            env: BTreeMap::new(),
            in_use: false,
        }
    }

    fn container(name: &str, image_id: &str) -> Container {
        Container::new(
            name,
            image_id,
            ContainerSpec {
                image: "alpine:latest".to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_duplicate_name_is_conflict() {
        let registry = Registry::new(16);
        registry.upsert_image(image("sha256:aaaa1111", "alpine", "latest"));
        registry.upsert(container("web", "sha256:aaaa1111")).unwrap();

        let err = registry
            .upsert(container("web", "sha256:aaaa1111"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_upsert_existing_keeps_status() {
        let registry = Registry::new(16);
        registry.upsert_image(image("sha256:aaaa1111", "alpine", "latest"));
        let c = container("web", "sha256:aaaa1111");
        registry.upsert(c.clone()).unwrap();
        assert!(registry.compare_and_set_status(
            &c.id,
            ContainerStatus::Created,
            ContainerStatus::Running
        ));

        let mut stale = c.clone();
        stale.status = ContainerStatus::Created;
        stale.spec.env.insert("A".into(), "1".into());
        registry.upsert(stale).unwrap();

        let stored = registry.get(&c.id).unwrap();
        assert_eq!(stored.status, ContainerStatus::Running);
        assert_eq!(stored.spec.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_cas_rejects_mismatch_and_illegal_edges() {
        let registry = Registry::new(16);
        registry.upsert_image(image("sha256:aaaa1111", "alpine", "latest"));
        let c = container("web", "sha256:aaaa1111");
        registry.upsert(c.clone()).unwrap();

        assert!(!registry.compare_and_set_status(
            &c.id,
            ContainerStatus::Running,
            ContainerStatus::Stopped
        ));
        // created -> paused is not an edge
        assert!(!registry.compare_and_set_status(
            &c.id,
            ContainerStatus::Created,
            ContainerStatus::Paused
        ));
        assert_eq!(registry.get(&c.id).unwrap().status, ContainerStatus::Created);
    }

    #[test]
    fn test_remove_requires_removing_status() {
        let registry = Registry::new(16);
        registry.upsert_image(image("sha256:aaaa1111", "alpine", "latest"));
        let c = container("web", "sha256:aaaa1111");
        registry.upsert(c.clone()).unwrap();

        assert!(registry.remove(&c.id).is_err());
        assert!(registry.compare_and_set_status(
            &c.id,
            ContainerStatus::Created,
            ContainerStatus::Removing
        ));
        registry.remove(&c.id).unwrap();
        assert!(registry.get(&c.id).is_err());
    }

    #[test]
    fn test_image_in_use_blocks_removal() {
        let registry = Registry::new(16);
        registry.upsert_image(image("sha256:aaaa1111", "nginx", "latest"));
        registry.upsert(container("web", "sha256:aaaa1111")).unwrap();

        let err = registry.remove_image("nginx:latest").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceInUse);
        assert!(registry.get_image("nginx:latest").unwrap().in_use);
    }

    #[test]
    fn test_remove_by_id_drops_every_tag() {
        let registry = Registry::new(16);
        registry.upsert_image(image("sha256:bbbb2222", "app", "v1"));
        registry.upsert_image(image("sha256:bbbb2222", "app", "latest"));
        registry.upsert_image(image("sha256:cccc3333", "other", "latest"));

        let removed = registry.remove_image("sha256:bbbb2222").unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.list_images().len(), 1);
    }

    #[test]
    fn test_remove_by_tag_keeps_sibling_tags() {
        let registry = Registry::new(16);
        registry.upsert_image(image("sha256:bbbb2222", "app", "v1"));
        registry.upsert_image(image("sha256:bbbb2222", "app", "latest"));

        registry.remove_image("app:v1").unwrap();
        assert!(registry.has_image_id("sha256:bbbb2222"));
        assert!(registry.get_image("app").is_ok());
    }

    #[test]
    fn test_mutations_publish_events() {
        let registry = Registry::new(16);
        let mut events = registry.subscribe();
        registry.upsert_image(image("sha256:aaaa1111", "alpine", "latest"));
        let c = container("web", "sha256:aaaa1111");
        registry.upsert(c.clone()).unwrap();
        registry.compare_and_set_status(&c.id, ContainerStatus::Created, ContainerStatus::Running);

        assert!(matches!(events.try_recv(), Ok(RegistryEvent::ImageAdded { .. })));
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::ContainerCreated { .. })));
        assert!(matches!(
            events.try_recv(),
            Ok(RegistryEvent::ContainerStatusChanged {
                to: ContainerStatus::Running,
                ..
            })
        ));
    }
}
