//! In-memory [`ClusterApi`] for tests.
//!
//! Objects are stored as JSON keyed by kind, namespace and name. The store
//! mimics the API-server behaviour the reconciler depends on:
//!
//! - every write bumps `metadata.resourceVersion`, and a replace carrying a
//!   stale one fails with `Conflict`
//! - `replace` never touches `status`, `replace_status` touches nothing else
//! - deleting an object with finalizers only sets `deletionTimestamp`; the
//!   object disappears once a replace clears its last finalizer
//!
//! Conflicts and per-kind failures can be injected to exercise retry and
//! degraded paths.

use super::{ClusterApi, Managed};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

type Key = (String, String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    pending_conflicts: u32,
    failing_kinds: HashMap<String, String>,
    writes: u64,
}

/// In-process object store
#[derive(Debug, Default)]
pub struct InMemoryApi {
    state: Mutex<State>,
}

fn key<K: Managed>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn labels_match(value: &Value, selector: &str) -> bool {
    let labels = &value["metadata"]["labels"];
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels[k.trim()].as_str() == Some(v.trim()),
            None => labels.get(term).is_some(),
        })
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| OperatorError::InvalidState("in-memory api lock poisoned".to_string()))
    }

    /// Make the next `n` replace or status writes fail with `Conflict`.
    pub fn inject_conflicts(&self, n: u32) {
        if let Ok(mut state) = self.lock() {
            state.pending_conflicts = n;
        }
    }

    /// Make every create, replace or delete of `kind` fail with `message`.
    pub fn fail_kind(&self, kind: &str, message: &str) {
        if let Ok(mut state) = self.lock() {
            state
                .failing_kinds
                .insert(kind.to_string(), message.to_string());
        }
    }

    /// Stop failing writes of `kind`.
    pub fn heal_kind(&self, kind: &str) {
        if let Ok(mut state) = self.lock() {
            state.failing_kinds.remove(kind);
        }
    }

    /// Number of successful creates, replaces and deletes so far.
    pub fn write_count(&self) -> u64 {
        self.lock().map(|s| s.writes).unwrap_or_default()
    }

    /// Names of the stored objects of `K` in `namespace`, sorted.
    pub fn names<K: Managed>(&self, namespace: &str) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        self.lock()
            .map(|state| {
                state
                    .objects
                    .keys()
                    .filter(|(k, ns, _)| *k == kind && ns == namespace)
                    .map(|(_, _, name)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Store an object verbatim, status included. For seeding fixtures.
    pub fn seed<K: Managed>(&self, namespace: &str, obj: &K) -> Result<()> {
        let mut value = serde_json::to_value(obj)?;
        let mut state = self.lock()?;
        let version = state.bump();
        value["metadata"]["namespace"] = Value::from(namespace);
        value["metadata"]["resourceVersion"] = Value::from(version);
        state
            .objects
            .insert(key::<K>(namespace, &obj.name_any()), value);
        Ok(())
    }
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check_failure(&self, kind: &str) -> Result<()> {
        match self.failing_kinds.get(kind) {
            Some(message) => Err(OperatorError::KubeApi(message.clone())),
            None => Ok(()),
        }
    }

    fn take_conflict(&mut self) -> bool {
        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            true
        } else {
            false
        }
    }

    /// Shared precondition for replace and replace_status.
    fn live_for_write(&mut self, key: &Key, incoming: &Value) -> Result<Value> {
        let live = self
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| OperatorError::NotFound(format!("{}/{}", key.1, key.2)))?;
        if self.take_conflict() {
            return Err(OperatorError::Conflict(format!(
                "injected conflict on {}/{}",
                key.1, key.2
            )));
        }
        let incoming_version = incoming["metadata"]["resourceVersion"].as_str();
        let live_version = live["metadata"]["resourceVersion"].as_str();
        if incoming_version.is_some() && incoming_version != live_version {
            return Err(OperatorError::Conflict(format!(
                "the object {}/{} has been modified",
                key.1, key.2
            )));
        }
        Ok(live)
    }
}

#[async_trait]
impl ClusterApi for InMemoryApi {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let state = self.lock()?;
        match state.objects.get(&key::<K>(namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let key = key::<K>(namespace, &obj.name_any());
        let mut state = self.lock()?;
        state.check_failure(&key.0)?;
        if state.objects.contains_key(&key) {
            return Err(OperatorError::AlreadyExists(format!(
                "{} {}/{} already exists",
                key.0, key.1, key.2
            )));
        }

        let mut value = serde_json::to_value(obj)?;
        let version = state.bump();
        let metadata = &mut value["metadata"];
        metadata["namespace"] = Value::from(namespace);
        metadata["resourceVersion"] = Value::from(version.clone());
        metadata["uid"] = Value::from(format!("uid-{}", version));
        metadata["generation"] = Value::from(1);
        metadata["creationTimestamp"] = serde_json::to_value(Time(Utc::now()))?;

        state.writes += 1;
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let key = key::<K>(namespace, &obj.name_any());
        let mut state = self.lock()?;
        state.check_failure(&key.0)?;
        let mut incoming = serde_json::to_value(obj)?;
        let live = state.live_for_write(&key, &incoming)?;

        // Status and server-owned metadata survive a replace
        match live.get("status") {
            Some(status) => incoming["status"] = status.clone(),
            None => {
                if let Some(map) = incoming.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp", "generation"] {
            match live["metadata"].get(field) {
                Some(v) => incoming["metadata"][field] = v.clone(),
                None => {
                    if let Some(meta) = incoming["metadata"].as_object_mut() {
                        meta.remove(field);
                    }
                }
            }
        }
        if live.get("spec") != incoming.get("spec") {
            let generation = live["metadata"]["generation"].as_i64().unwrap_or(1) + 1;
            incoming["metadata"]["generation"] = Value::from(generation);
        }
        incoming["metadata"]["namespace"] = Value::from(namespace);
        incoming["metadata"]["resourceVersion"] = Value::from(state.bump());
        state.writes += 1;

        let terminating = incoming["metadata"].get("deletionTimestamp").is_some();
        if terminating && !has_finalizers(&incoming) {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, incoming.clone());
        }
        Ok(serde_json::from_value(incoming)?)
    }

    async fn replace_status<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let key = key::<K>(namespace, &obj.name_any());
        let mut state = self.lock()?;
        let incoming = serde_json::to_value(obj)?;
        let mut live = state.live_for_write(&key, &incoming)?;

        live["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
        live["metadata"]["resourceVersion"] = Value::from(state.bump());
        state.writes += 1;
        state.objects.insert(key, live.clone());
        Ok(serde_json::from_value(live)?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool> {
        let key = key::<K>(namespace, name);
        let mut state = self.lock()?;
        state.check_failure(&key.0)?;
        let Some(live) = state.objects.get(&key).cloned() else {
            return Ok(false);
        };

        if has_finalizers(&live) {
            if live["metadata"].get("deletionTimestamp").is_none() {
                let mut terminating = live;
                terminating["metadata"]["deletionTimestamp"] =
                    serde_json::to_value(Time(Utc::now()))?;
                terminating["metadata"]["resourceVersion"] = Value::from(state.bump());
                state.objects.insert(key, terminating);
            }
        } else {
            state.objects.remove(&key);
        }
        state.writes += 1;
        Ok(true)
    }

    async fn list<K: Managed>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let state = self.lock()?;
        state
            .objects
            .iter()
            .filter(|((k, ns, _), value)| {
                *k == kind && ns == namespace && labels_match(value, label_selector)
            })
            .map(|(_, value)| serde_json::from_value(value.clone()).map_err(OperatorError::from))
            .collect()
    }
}
