//! FleetStore — the authoritative record of groups, proxies, and the
//! destroy queue.
//!
//! Every group lives behind its own mutex. Mutations run against a draft
//! copy and are only published (and persisted to redb) once the closure
//! succeeds, so a failed operation leaves no trace. Lock order is always
//! group before destroy queue, and the destroy queue lock is never held
//! across a redb commit.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Point-in-time copy of every group, ordered by key.
pub type FleetSnapshot = BTreeMap<GroupKey, InstanceGroup>;

type GroupCell = Arc<Mutex<InstanceGroup>>;

enum Write<'a> {
    Group(&'a InstanceGroup),
    QueuePut(&'a DestroyQueueEntry),
    QueueRemove(&'a str),
}

struct Inner {
    db: Database,
    groups: RwLock<BTreeMap<GroupKey, GroupCell>>,
    destroy_queue: Mutex<BTreeMap<ProxyIp, DestroyQueueEntry>>,
}

/// Thread-safe fleet store. Cloning shares the same state.
#[derive(Clone)]
pub struct FleetStore {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> StateResult<MutexGuard<'_, T>> {
    m.lock().map_err(|_| StateError::Poisoned)
}

impl FleetStore {
    /// Open (or create) a persistent store at the given path, loading any
    /// groups and queue entries written by a previous run.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::load(db)?;
        info!(?path, groups = store.keys()?.len(), "fleet store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::load(db)?;
        debug!("in-memory fleet store opened");
        Ok(store)
    }

    fn load(db: Database) -> StateResult<Self> {
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(DESTROY_QUEUE).map_err(map_err!(Table))?;
        txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;

        let mut groups = BTreeMap::new();
        let mut recovered = Vec::new();
        let mut queue = BTreeMap::new();
        {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let mut group: InstanceGroup =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                // Provider calls do not survive a restart either.
                let provisioning = group.provisioning;
                let rescheduled = group.recover_interrupted();
                if provisioning > 0 || rescheduled > 0 {
                    info!(
                        key = %group.key,
                        provisioning,
                        rescheduled,
                        "recovered provider calls interrupted by restart"
                    );
                    group.revision += 1;
                    recovered.push(group.clone());
                }
                groups.insert(group.key.clone(), Arc::new(Mutex::new(group)));
            }

            let table = txn.open_table(DESTROY_QUEUE).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let mut item: DestroyQueueEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                // Nothing survives a restart in flight.
                item.in_flight = false;
                queue.insert(item.ip.clone(), item);
            }
        }

        let store = Self {
            inner: Arc::new(Inner {
                db,
                groups: RwLock::new(groups),
                destroy_queue: Mutex::new(queue),
            }),
        };
        let writes: Vec<Write<'_>> = recovered.iter().map(Write::Group).collect();
        if !writes.is_empty() {
            store.commit(&writes)?;
        }
        Ok(store)
    }

    fn commit(&self, writes: &[Write<'_>]) -> StateResult<()> {
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let mut queue = txn.open_table(DESTROY_QUEUE).map_err(map_err!(Table))?;
            for write in writes {
                match write {
                    Write::Group(group) => {
                        let key = group.table_key();
                        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
                        groups
                            .insert(key.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Write::QueuePut(entry) => {
                        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
                        queue
                            .insert(entry.ip.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Write::QueueRemove(ip) => {
                        queue.remove(*ip).map_err(map_err!(Write))?;
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn cell(&self, key: &GroupKey) -> StateResult<GroupCell> {
        let groups = self.inner.groups.read().map_err(|_| StateError::Poisoned)?;
        groups
            .get(key)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("instance group {key}")))
    }

    fn cells(&self) -> StateResult<Vec<GroupCell>> {
        let groups = self.inner.groups.read().map_err(|_| StateError::Poisoned)?;
        Ok(groups.values().cloned().collect())
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Register a group. An existing group with the same key keeps its
    /// stored state; returns whether the group was new.
    pub fn declare(&self, group: InstanceGroup) -> StateResult<bool> {
        let mut groups = self.inner.groups.write().map_err(|_| StateError::Poisoned)?;
        if groups.contains_key(&group.key) {
            return Ok(false);
        }
        self.commit(&[Write::Group(&group)])?;
        debug!(key = %group.key, "instance group declared");
        groups.insert(group.key.clone(), Arc::new(Mutex::new(group)));
        Ok(true)
    }

    pub fn keys(&self) -> StateResult<Vec<GroupKey>> {
        let groups = self.inner.groups.read().map_err(|_| StateError::Poisoned)?;
        Ok(groups.keys().cloned().collect())
    }

    pub fn get(&self, key: &GroupKey) -> StateResult<InstanceGroup> {
        let cell = self.cell(key)?;
        let group = lock(&cell)?;
        Ok(group.clone())
    }

    /// Copy of every group. Each group is internally consistent; groups are
    /// not captured atomically with respect to each other.
    pub fn snapshot(&self) -> StateResult<FleetSnapshot> {
        let mut out = BTreeMap::new();
        for cell in self.cells()? {
            let group = lock(&cell)?;
            out.insert(group.key.clone(), group.clone());
        }
        Ok(out)
    }

    /// Find which group tracks `ip`.
    pub fn find_proxy(&self, ip: &str) -> StateResult<Option<(GroupKey, Proxy)>> {
        for cell in self.cells()? {
            let group = lock(&cell)?;
            if let Some(proxy) = group.proxies.get(ip) {
                return Ok(Some((group.key.clone(), proxy.clone())));
            }
        }
        Ok(None)
    }

    /// Run `f` against a draft of the group and commit it if `f` succeeds.
    ///
    /// Proxies newly flagged as queued for destruction get a destroy queue
    /// entry in the same commit.
    pub fn apply<T>(
        &self,
        key: &GroupKey,
        f: impl FnOnce(&mut InstanceGroup) -> StateResult<T>,
    ) -> StateResult<T> {
        self.apply_checked(key, None, f)
    }

    /// Like [`apply`](Self::apply), but fails with `Conflict` if the group's
    /// revision has moved past `expected_revision`.
    pub fn apply_at<T>(
        &self,
        key: &GroupKey,
        expected_revision: u64,
        f: impl FnOnce(&mut InstanceGroup) -> StateResult<T>,
    ) -> StateResult<T> {
        self.apply_checked(key, Some(expected_revision), f)
    }

    fn apply_checked<T>(
        &self,
        key: &GroupKey,
        expected_revision: Option<u64>,
        f: impl FnOnce(&mut InstanceGroup) -> StateResult<T>,
    ) -> StateResult<T> {
        let cell = self.cell(key)?;
        let mut group = lock(&cell)?;
        if let Some(expected) = expected_revision
            && group.revision != expected
        {
            return Err(StateError::Conflict(format!(
                "{key} is at revision {}, expected {expected}",
                group.revision
            )));
        }

        let mut draft = group.clone();
        let out = f(&mut draft)?;
        draft.revision += 1;

        let queued: Vec<DestroyQueueEntry> = draft
            .proxies
            .values()
            .filter_map(|p| {
                let retirement = p.retirement.as_ref()?;
                retirement.queued.then(|| {
                    DestroyQueueEntry::new(p.ip.clone(), Some(draft.key.clone()), retirement.started_at)
                })
            })
            .collect();
        // Only this group's proxies can be queued here, and the group lock
        // is held, so the queue lock is needed just long enough to filter.
        let new_entries: Vec<DestroyQueueEntry> = if queued.is_empty() {
            queued
        } else {
            let queue = lock(&self.inner.destroy_queue)?;
            queued
                .into_iter()
                .filter(|e| !queue.contains_key(&e.ip))
                .collect()
        };

        let mut writes = vec![Write::Group(&draft)];
        writes.extend(new_entries.iter().map(Write::QueuePut));
        self.commit(&writes)?;

        if !new_entries.is_empty() {
            let mut queue = lock(&self.inner.destroy_queue)?;
            for entry in new_entries {
                debug!(ip = %entry.ip, group = %key, "proxy queued for destruction");
                queue.entry(entry.ip.clone()).or_insert(entry);
            }
        }
        *group = draft;
        Ok(out)
    }

    // ── Operator queues ────────────────────────────────────────────

    /// Queue a tracked proxy for destruction.
    ///
    /// Unknown IPs fail with `NotFound` and leave the queue unchanged.
    /// Returns `false` if the proxy was already queued.
    pub fn enqueue_destroy(&self, ip: &str, reason: RetireReason, now: u64) -> StateResult<bool> {
        let (key, _) = self
            .find_proxy(ip)?
            .ok_or_else(|| StateError::NotFound(format!("IP {ip} not found")))?;
        self.apply(&key, |group| group.prepare_removal(ip, reason, now))
    }

    /// Ask for an active proxy to be replaced and then destroyed.
    ///
    /// Returns `false` if the proxy is already on its way out.
    pub fn request_restart(&self, ip: &str) -> StateResult<bool> {
        let (key, _) = self
            .find_proxy(ip)?
            .ok_or_else(|| StateError::NotFound(format!("IP {ip} not found")))?;
        self.apply(&key, |group| {
            let proxy = group.proxy_mut(ip)?;
            if !proxy.is_active() || proxy.restart_requested {
                return Ok(false);
            }
            proxy.restart_requested = true;
            Ok(true)
        })
    }

    /// Proxies waiting for a restart or currently being restarted, sorted
    /// by IP.
    pub fn list_restart_queue(&self) -> StateResult<Vec<(GroupKey, Proxy)>> {
        let mut out = Vec::new();
        for cell in self.cells()? {
            let group = lock(&cell)?;
            out.extend(
                group
                    .proxies
                    .values()
                    .filter(|p| {
                        (p.restart_requested && p.is_active())
                            || p.retirement
                                .as_ref()
                                .is_some_and(|r| r.reason == RetireReason::Restart)
                    })
                    .map(|p| (group.key.clone(), p.clone())),
            );
        }
        out.sort_by(|a, b| a.1.ip.cmp(&b.1.ip));
        Ok(out)
    }

    pub fn list_destroy_queue(&self) -> StateResult<Vec<DestroyQueueEntry>> {
        let queue = lock(&self.inner.destroy_queue)?;
        let mut entries: Vec<DestroyQueueEntry> = queue.values().cloned().collect();
        entries.sort_by(|a, b| (a.requested_at, &a.ip).cmp(&(b.requested_at, &b.ip)));
        Ok(entries)
    }

    /// Mark every due entry in flight and return them.
    pub fn claim_due_destroys(&self, now: u64) -> StateResult<Vec<DestroyQueueEntry>> {
        let mut queue = lock(&self.inner.destroy_queue)?;
        let mut claimed = Vec::new();
        for entry in queue.values_mut().filter(|e| e.is_due(now)) {
            entry.in_flight = true;
            claimed.push(entry.clone());
        }
        claimed.sort_by(|a, b| (a.requested_at, &a.ip).cmp(&(b.requested_at, &b.ip)));
        Ok(claimed)
    }

    /// Record a successful provider destroy: the proxy is terminated and
    /// leaves both its group and the queue.
    pub fn complete_destroy(&self, ip: &str) -> StateResult<Option<Proxy>> {
        let entry = lock(&self.inner.destroy_queue)?
            .get(ip)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("destroy queue entry {ip}")))?;

        let cell = match &entry.group {
            Some(key) => self.cell(key).ok(),
            None => None,
        };
        let Some(cell) = cell else {
            self.commit(&[Write::QueueRemove(ip)])?;
            lock(&self.inner.destroy_queue)?.remove(ip);
            return Ok(None);
        };

        let mut group = lock(&cell)?;
        let mut draft = group.clone();
        let removed = if draft.proxies.contains_key(ip) {
            Some(draft.terminate(ip)?)
        } else {
            None
        };
        draft.revision += 1;

        self.commit(&[Write::Group(&draft), Write::QueueRemove(ip)])?;
        lock(&self.inner.destroy_queue)?.remove(ip);
        *group = draft;
        debug!(%ip, "proxy terminated");
        Ok(removed)
    }

    /// Record a failed provider destroy and schedule the next attempt.
    pub fn fail_destroy(
        &self,
        ip: &str,
        error: &str,
        retry_at: u64,
        max_retries: u32,
    ) -> StateResult<DestroyQueueEntry> {
        // The entry is claimed by the caller, so nothing else updates it
        // between the read and the write below.
        let mut entry = lock(&self.inner.destroy_queue)?
            .get(ip)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("destroy queue entry {ip}")))?;
        entry.attempts += 1;
        entry.in_flight = false;
        entry.next_attempt_at = retry_at;
        entry.last_error = Some(error.to_string());
        entry.stuck = entry.attempts >= max_retries;
        self.commit(&[Write::QueuePut(&entry)])?;
        lock(&self.inner.destroy_queue)?.insert(ip.to_string(), entry.clone());
        Ok(entry)
    }

    // ── Settings ───────────────────────────────────────────────────

    pub fn put_setting<T: Serialize>(&self, name: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, "setting stored");
        Ok(())
    }

    pub fn get_setting<T: DeserializeOwned>(&self, name: &str) -> StateResult<Option<T>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
