//! Derived (cached) classes: values computed from upstream sources.
//!
//! A derived class persists its transform results like any other class,
//! but a source update only *invalidates* the row (a version-only
//! marker); the value is recomputed lazily on the next read. Staleness
//! therefore survives restarts, and downstream indexes see a version
//! bump without waiting for the recompute.

use crate::class::EntityClass;
use crate::entity::{encode_row, EntityId, ReadyState};
use crate::error::StoreResult;
use crate::events::{UpdateEvent, UpdateKind, UpdateListener};
use cascade_kv::KvTable;
use std::sync::Arc;
use tracing::warn;

impl EntityClass {
    /// Recomputes a derived entity's value from its sources, persists
    /// the result, and returns it.
    ///
    /// Returns `None` (and removes the row) when the transform yields
    /// nothing for this id.
    pub(crate) fn refresh_derived(
        &self,
        entity: &Arc<crate::entity::Entity>,
    ) -> StoreResult<Option<serde_json::Value>> {
        let transform = self
            .descriptor()
            .transform
            .clone()
            .expect("refresh_derived on a derived class");

        let sources = self.sources();
        let mut inputs = Vec::with_capacity(sources.len());
        for source in &sources {
            let input = match source.value_of(&entity.id, &crate::context::Context::new())? {
                crate::class::ValueOutcome::Value(value) => Some(value),
                _ => None,
            };
            inputs.push(input);
        }

        let version = {
            let version = entity.version();
            if version == 0 {
                self.versions().next()
            } else {
                version
            }
        };
        let key = self.id_key(&entity.id)?;

        match transform(&inputs) {
            Some(value) => {
                let json = serde_json::to_string(&value)?;
                self.batcher()
                    .put(key, encode_row(version, Some(&json)), version);
                let mut state = entity.state();
                state.version = version;
                state.as_json = Some(json);
                state.cached_value = Some(value.clone());
                state.ready = ReadyState::UpToDate;
                Ok(Some(value))
            }
            None => {
                self.batcher().delete(key, version);
                let mut state = entity.state();
                state.version = version;
                state.as_json = None;
                state.cached_value = None;
                state.ready = ReadyState::NoLocalData;
                Ok(None)
            }
        }
    }

    /// Seeds one version-only invalidation row per source id, so
    /// downstream consumers rebuild everything derived from this class.
    pub(crate) fn reseed_from_sources(&self) -> StoreResult<()> {
        for source in self.sources() {
            for (id, _version) in source.get_instance_ids_and_versions_since(0)? {
                let version = self.versions().next();
                let key = self.id_key(&id)?;
                self.batcher().put(key, encode_row(version, None), version);
            }
        }
        Ok(())
    }

    /// Replays source updates missed while this class was offline, as
    /// synthetic replaced events tagged with the initialization origin.
    pub(crate) fn catch_up_from_sources(&self) -> StoreResult<()> {
        let last_version = self.last_version();
        for source in self.sources() {
            for (id, version) in source.get_instance_ids_and_versions_since(last_version)? {
                let mut event = UpdateEvent::new(UpdateKind::Replaced, source.name(), id.to_key())
                    .with_version(version)
                    .from_initialization();
                self.on_update(&mut event);
            }
        }
        Ok(())
    }
}

/// A derived class listens to each of its sources; a source update
/// invalidates the derived row and republishes downstream.
impl UpdateListener for EntityClass {
    fn on_update(&self, event: &mut UpdateEvent) {
        if self.descriptor().transform.is_none() {
            // Plain classes have no sources; nothing to derive.
            return;
        }
        let id = match EntityId::from_key(&event.subject) {
            Ok(id) => id,
            Err(err) => {
                warn!(class = self.name(), %err, "unusable update subject");
                return;
            }
        };

        let mut derived = UpdateEvent::new(
            match event.kind {
                UpdateKind::Deleted => UpdateKind::Deleted,
                _ => UpdateKind::Replaced,
            },
            self.name(),
            event.subject.clone(),
        );
        derived.origins.extend(event.origins.iter().cloned());
        derived.version = event.version;

        let result = match event.kind {
            UpdateKind::Deleted => self.remove_with(&id, &mut derived),
            _ => self.updated(&id, &mut derived),
        };
        match result {
            Ok(handle) => {
                event.updates_in_progress.push(handle);
                event
                    .updates_in_progress
                    .extend(derived.updates_in_progress);
            }
            Err(err) => {
                warn!(class = self.name(), %id, %err, "derived update failed");
            }
        }
    }
}

/// Reads a derived row directly, bypassing recompute; used by tests and
/// diagnostics to observe invalidation markers.
pub fn raw_row(
    class: &EntityClass,
    id: &EntityId,
) -> StoreResult<Option<crate::entity::Row>> {
    let key = class.id_key(id)?;
    match class.table().get(&key)? {
        Some(bytes) => Ok(Some(crate::entity::decode_row(&bytes)?)),
        None => Ok(None),
    }
}
