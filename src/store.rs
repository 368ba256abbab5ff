//! Durable item store.
//!
//! One JSON file per item, grouped in a folder per lifecycle state
//! (`<root>/<state>/<id>.json`). A state change renames the file into the
//! new folder (a single atomic rename) and then rewrites it in place through
//! a temp file, so a record is never visible in two folders at once. On open
//! the folder is authoritative for the state.
//!
//! All state changes go through [`ItemStore::apply`], a compare-and-swap on
//! the item's current state. The matching audit record is appended under the
//! same lock; if the append fails the file move is reverted.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::audit::{AuditEvent, AuditLog, AuditRecord};
use crate::error::{ActionError, ErrorClass, StoreError};
use crate::state_machine::{Actor, ItemId, ItemKind, ItemState, Resolution, TaskItem};

/// Origin used for items created by hand.
pub const MANUAL_ORIGIN: &str = "manual";

/// A compare-and-swap state change plus the side data it carries.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub expected: ItemState,
    pub to: ItemState,
    pub actor: Actor,
    pub reason: String,
    /// Recorded as `last_error` when entering Error.
    pub error: Option<ActionError>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// How the item ends when entering Done. Defaults to Completed, or to
    /// Unrecoverable when leaving Error.
    pub resolution: Option<Resolution>,
    pub flag_payment_action: bool,
}

impl TransitionRequest {
    pub fn new(expected: ItemState, to: ItemState, actor: Actor, reason: impl Into<String>) -> Self {
        Self {
            expected,
            to,
            actor,
            reason: reason.into(),
            error: None,
            next_retry_at: None,
            resolution: None,
            flag_payment_action: false,
        }
    }

    pub fn with_error(mut self, error: ActionError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn unrecoverable(mut self) -> Self {
        self.resolution = Some(Resolution::Unrecoverable);
        self
    }

    pub fn flag_payment_action(mut self, flag: bool) -> Self {
        self.flag_payment_action = flag;
        self
    }
}

// Folder-per-state file layout.
struct Disk {
    root: PathBuf,
}

impl Disk {
    fn path(&self, state: ItemState, id: &ItemId) -> PathBuf {
        self.root.join(state.dir_name()).join(format!("{id}.json"))
    }

    fn write(&self, item: &TaskItem) -> std::io::Result<()> {
        let dir = self.root.join(item.state.dir_name());
        let tmp = dir.join(format!(".{}.json.tmp", item.id));
        let json = serde_json::to_vec_pretty(item)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, self.path(item.state, &item.id))
    }

    /// Moves the record from `from` into `item.state`'s folder and rewrites it.
    fn relocate(&self, from: ItemState, item: &TaskItem) -> std::io::Result<()> {
        if from != item.state {
            fs::rename(self.path(from, &item.id), self.path(item.state, &item.id))?;
        }
        if let Err(e) = self.write(item) {
            if from != item.state
                && let Err(revert) = fs::rename(self.path(item.state, &item.id), self.path(from, &item.id))
            {
                tracing::error!(item_id = %item.id, "failed to move item back to {from}: {revert}");
            }
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, item: &TaskItem) -> std::io::Result<()> {
        fs::remove_file(self.path(item.state, &item.id))
    }

    fn load(&self) -> Result<HashMap<ItemId, TaskItem>, StoreError> {
        let mut items: HashMap<ItemId, TaskItem> = HashMap::new();
        for state in ItemState::ALL {
            let dir = self.root.join(state.dir_name());
            fs::create_dir_all(&dir)?;
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with('.') || !name.ends_with(".json") {
                    continue;
                }
                let mut item: TaskItem = match fs::read(&path)
                    .map_err(StoreError::from)
                    .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
                {
                    Ok(item) => item,
                    Err(e) => {
                        tracing::warn!(file = %path.display(), "skipping unreadable item: {e}");
                        continue;
                    }
                };
                item.state = state;
                if let Some(existing) = items.get(&item.id)
                    && existing.updated_at >= item.updated_at
                {
                    tracing::warn!(item_id = %item.id, "duplicate item record in {state}, keeping newer");
                    continue;
                }
                items.insert(item.id.clone(), item);
            }
        }
        Ok(items)
    }
}

/// The single shared, mutable resource of the pipeline.
pub struct ItemStore {
    disk: Disk,
    audit: Arc<AuditLog>,
    items: Mutex<HashMap<ItemId, TaskItem>>,
    /// Error -> Inbound is refused once `retry_count` reaches this.
    retry_cap: u32,
}

impl ItemStore {
    /// Opens (or initializes) a store rooted at `root`.
    pub fn open(root: &Path, audit: Arc<AuditLog>) -> Result<Self, StoreError> {
        let disk = Disk {
            root: root.to_path_buf(),
        };
        let items = disk.load()?;
        tracing::debug!(count = items.len(), root = %root.display(), "item store opened");
        Ok(Self {
            disk,
            audit,
            items: Mutex::new(items),
            retry_cap: u32::MAX,
        })
    }

    /// Caps re-entries from Error, whoever asks for them.
    pub fn with_retry_cap(mut self, max_attempts: u32) -> Self {
        self.retry_cap = max_attempts;
        self
    }

    /// The ledger transitions are written to.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ItemId, TaskItem>>, StoreError> {
        self.items.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Creates a new Inbound item and returns its id.
    pub fn create(
        &self,
        kind: ItemKind,
        payload: Value,
        origin: &str,
    ) -> Result<ItemId, StoreError> {
        let item = TaskItem::new(kind, payload, origin);
        let actor = if origin == MANUAL_ORIGIN {
            Actor::Human
        } else {
            Actor::Watcher(origin.to_string())
        };

        let mut items = self.lock()?;
        self.disk.write(&item)?;
        let record = AuditRecord::new(
            actor,
            AuditEvent::Transition {
                item_id: item.id.clone(),
                from: None,
                to: ItemState::Inbound,
            },
            format!("created {} item", item.kind),
        )
        .at(item.created_at);
        if let Err(e) = self.audit.append(&record) {
            if let Err(revert) = self.disk.remove(&item) {
                tracing::error!(item_id = %item.id, "failed to remove item after audit failure: {revert}");
            }
            return Err(e);
        }

        tracing::info!(item_id = %item.id, kind = %item.kind, origin, "item created");
        let id = item.id.clone();
        items.insert(id.clone(), item);
        Ok(id)
    }

    /// Snapshot of one item.
    pub fn get(&self, id: &ItemId) -> Result<TaskItem, StoreError> {
        self.lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Items currently in `state`, oldest first.
    pub fn list(&self, state: ItemState) -> Result<Vec<TaskItem>, StoreError> {
        let mut found: Vec<TaskItem> = self
            .lock()?
            .values()
            .filter(|item| item.state == state)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    /// Every item in every state, oldest first.
    pub fn list_all(&self) -> Result<Vec<TaskItem>, StoreError> {
        let mut found: Vec<TaskItem> = self.lock()?.values().cloned().collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    /// Done items that ended in failure.
    pub fn unrecoverable(&self) -> Result<Vec<TaskItem>, StoreError> {
        let mut found = self.list(ItemState::Done)?;
        found.retain(TaskItem::is_unrecoverable);
        Ok(found)
    }

    /// Pending items plus Error items held back for a human decision.
    pub fn awaiting_human(&self) -> Result<Vec<TaskItem>, StoreError> {
        let mut found = self.list(ItemState::Pending)?;
        found.extend(self.list(ItemState::Error)?.into_iter().filter(|item| {
            item.last_error.as_ref().map(ActionError::class) == Some(ErrorClass::Policy)
        }));
        Ok(found)
    }

    /// Compare-and-swap with no side data.
    pub fn transition(
        &self,
        id: &ItemId,
        expected: ItemState,
        to: ItemState,
        actor: Actor,
        reason: &str,
    ) -> Result<TaskItem, StoreError> {
        self.apply(id, TransitionRequest::new(expected, to, actor, reason))
    }

    /// Moves an item to `to` from whatever state it is in now. Used for
    /// external requests that carry no expected state; the read and the swap
    /// happen under one lock.
    pub fn request_transition(
        &self,
        id: &ItemId,
        to: ItemState,
        actor: Actor,
        reason: &str,
    ) -> Result<TaskItem, StoreError> {
        let mut items = self.lock()?;
        let current = items
            .get(id)
            .map(|item| item.state)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.apply_locked(&mut items, id, TransitionRequest::new(current, to, actor, reason))
    }

    /// Applies a compare-and-swap transition.
    ///
    /// Fails with [`StoreError::Conflict`] when the item is no longer in
    /// `req.expected`, and with [`StoreError::InvalidTransition`] when the
    /// move is not an edge of the lifecycle graph.
    pub fn apply(&self, id: &ItemId, req: TransitionRequest) -> Result<TaskItem, StoreError> {
        let mut items = self.lock()?;
        self.apply_locked(&mut items, id, req)
    }

    fn apply_locked(
        &self,
        items: &mut HashMap<ItemId, TaskItem>,
        id: &ItemId,
        req: TransitionRequest,
    ) -> Result<TaskItem, StoreError> {
        let current = items
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if current.state != req.expected {
            return Err(StoreError::Conflict {
                id: id.clone(),
                expected: req.expected,
                actual: current.state,
            });
        }
        if !req.expected.can_transition_to(req.to) {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: req.expected,
                to: req.to,
            });
        }
        if req.expected == ItemState::Error
            && req.to == ItemState::Inbound
            && current.retry_count >= self.retry_cap
        {
            return Err(StoreError::RetriesExhausted {
                id: id.clone(),
                max_attempts: self.retry_cap,
            });
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.state = req.to;
        next.updated_at = now;
        next.payment_action |= req.flag_payment_action;

        match (req.expected, req.to) {
            (ItemState::Error, ItemState::Inbound) => {
                next.retry_count += 1;
                next.next_retry_at = None;
            }
            (ItemState::Pending, ItemState::Approved) => {
                next.approved_payload = Some(next.payload.clone());
            }
            _ => {}
        }
        if req.to == ItemState::Error {
            if let Some(error) = &req.error {
                next.last_error = Some(error.clone());
            }
            next.next_retry_at = req.next_retry_at;
        }
        if req.to == ItemState::Done {
            next.next_retry_at = None;
            // Leaving Error for Done always means giving up.
            let fallback = if req.expected == ItemState::Error {
                Resolution::Unrecoverable
            } else {
                Resolution::Completed
            };
            next.resolution = Some(req.resolution.unwrap_or(fallback));
        }

        self.disk.relocate(current.state, &next)?;
        let record = AuditRecord::new(
            req.actor.clone(),
            AuditEvent::Transition {
                item_id: id.clone(),
                from: Some(req.expected),
                to: req.to,
            },
            req.reason.clone(),
        )
        .at(now);
        if let Err(e) = self.audit.append(&record) {
            if let Err(revert) = self.disk.relocate(next.state, current) {
                tracing::error!(item_id = %id, "failed to revert item after audit failure: {revert}");
            }
            return Err(e);
        }

        tracing::info!(
            item_id = %id,
            from = %req.expected,
            to = %req.to,
            actor = %req.actor,
            "{}",
            req.reason
        );
        items.insert(id.clone(), next.clone());
        Ok(next)
    }

    /// Logs and audits a compare-and-swap that lost a race.
    pub fn record_abandoned(&self, actor: Actor, err: &StoreError, operation: &str) {
        let StoreError::Conflict {
            id,
            expected,
            actual,
        } = err
        else {
            return;
        };
        tracing::warn!(item_id = %id, %expected, %actual, "{operation} abandoned: item changed underneath");
        let record = AuditRecord::new(
            actor,
            AuditEvent::Abandoned {
                item_id: id.clone(),
                expected: *expected,
                actual: *actual,
            },
            format!("{operation} abandoned"),
        );
        if let Err(e) = self.audit.append(&record) {
            tracing::error!(item_id = %id, "failed to audit abandoned operation: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> ItemStore {
        let audit = Arc::new(AuditLog::open(&dir.path().join("audit")).unwrap());
        ItemStore::open(&dir.path().join("items"), audit).unwrap()
    }

    #[test]
    fn create_places_item_in_inbound_and_audits() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let id = store
            .create(ItemKind::Invoice, json!({"amount": 20}), "odoo")
            .unwrap();

        let item = store.get(&id).unwrap();
        assert_eq!(item.state, ItemState::Inbound);
        assert!(dir.path().join("items/inbound").join(format!("{id}.json")).exists());

        let replay = store.audit().replay(&id).unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].actor, Actor::Watcher("odoo".into()));
    }

    #[test]
    fn transition_relocates_record() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Payment, json!({"amount": 150}), "odoo").unwrap();

        store
            .transition(&id, ItemState::Inbound, ItemState::Pending, Actor::DecisionAgent, "needs approval")
            .unwrap();

        let inbound = dir.path().join("items/inbound").join(format!("{id}.json"));
        let pending = dir.path().join("items/pending").join(format!("{id}.json"));
        assert!(!inbound.exists());
        assert!(pending.exists());
        assert_eq!(store.list(ItemState::Pending).unwrap().len(), 1);
        assert!(store.list(ItemState::Inbound).unwrap().is_empty());
    }

    #[test]
    fn stale_expected_state_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();
        store
            .transition(&id, ItemState::Inbound, ItemState::Pending, Actor::DecisionAgent, "review")
            .unwrap();

        let err = store
            .transition(&id, ItemState::Inbound, ItemState::Done, Actor::DecisionAgent, "done")
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(&id).unwrap().state, ItemState::Pending);
    }

    #[test]
    fn edges_outside_the_graph_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();

        let err = store
            .transition(&id, ItemState::Inbound, ItemState::Approved, Actor::Human, "skip")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_items_are_immutable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Alert, json!({}), "odoo").unwrap();
        store
            .transition(&id, ItemState::Inbound, ItemState::Done, Actor::DecisionAgent, "handled")
            .unwrap();

        for to in ItemState::ALL {
            assert!(store
                .transition(&id, ItemState::Done, to, Actor::Human, "reopen")
                .is_err());
        }
        let item = store.get(&id).unwrap();
        assert_eq!(item.state, ItemState::Done);
        assert_eq!(item.resolution, Some(Resolution::Completed));
    }

    #[test]
    fn retry_reentry_increments_retry_count_only() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();

        store
            .apply(
                &id,
                TransitionRequest::new(ItemState::Inbound, ItemState::Error, Actor::DecisionAgent, "timeout")
                    .with_error(ActionError::Transient("timeout".into())),
            )
            .unwrap();
        assert_eq!(store.get(&id).unwrap().retry_count, 0);

        let item = store
            .transition(&id, ItemState::Error, ItemState::Inbound, Actor::RetryEngine, "retry")
            .unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.last_error, Some(ActionError::Transient("timeout".into())));
    }

    #[test]
    fn error_to_done_is_always_unrecoverable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();
        store
            .apply(
                &id,
                TransitionRequest::new(ItemState::Inbound, ItemState::Error, Actor::DecisionAgent, "bounce")
                    .with_error(ActionError::Transient("bounce".into())),
            )
            .unwrap();

        let item = store
            .request_transition(&id, ItemState::Done, Actor::Human, "close it")
            .unwrap();
        assert_eq!(item.resolution, Some(Resolution::Unrecoverable));
        assert_eq!(store.unrecoverable().unwrap().len(), 1);
    }

    #[test]
    fn retry_cap_blocks_reentry() {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLog::open(&dir.path().join("audit")).unwrap());
        let store = ItemStore::open(&dir.path().join("items"), audit).unwrap().with_retry_cap(1);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();
        let fail = |expected| {
            store
                .apply(
                    &id,
                    TransitionRequest::new(expected, ItemState::Error, Actor::DecisionAgent, "net")
                        .with_error(ActionError::Transient("net".into())),
                )
                .unwrap();
        };

        fail(ItemState::Inbound);
        store
            .transition(&id, ItemState::Error, ItemState::Inbound, Actor::RetryEngine, "retry")
            .unwrap();
        fail(ItemState::Inbound);

        let err = store
            .transition(&id, ItemState::Error, ItemState::Inbound, Actor::Human, "again")
            .unwrap_err();
        assert!(matches!(err, StoreError::RetriesExhausted { max_attempts: 1, .. }));
        assert_eq!(store.get(&id).unwrap().retry_count, 1);
    }

    #[test]
    fn approval_records_payload_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Payment, json!({"amount": 150}), "odoo").unwrap();
        store
            .transition(&id, ItemState::Inbound, ItemState::Pending, Actor::DecisionAgent, "gate")
            .unwrap();
        let item = store
            .transition(&id, ItemState::Pending, ItemState::Approved, Actor::Human, "ok")
            .unwrap();
        assert!(item.has_standing_approval());
    }

    #[test]
    fn request_transition_uses_observed_state() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::SocialPost, json!({}), "twitter").unwrap();
        store
            .request_transition(&id, ItemState::Pending, Actor::DecisionAgent, "post needs review")
            .unwrap();
        let item = store
            .request_transition(&id, ItemState::Rejected, Actor::Human, "off brand")
            .unwrap();
        assert_eq!(item.state, ItemState::Rejected);
    }

    #[test]
    fn concurrent_cas_has_exactly_one_winner() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Email, json!({}), "gmail").unwrap();
        store
            .apply(
                &id,
                TransitionRequest::new(ItemState::Inbound, ItemState::Error, Actor::DecisionAgent, "net")
                    .with_error(ActionError::Transient("net".into())),
            )
            .unwrap();

        let barrier = Barrier::new(8);
        let results: Vec<Result<TaskItem, StoreError>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        store.transition(
                            &id,
                            ItemState::Error,
                            ItemState::Inbound,
                            Actor::RetryEngine,
                            "retry",
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(StoreError::is_conflict));
        assert_eq!(store.get(&id).unwrap().retry_count, 1);

        let moves = store
            .audit()
            .replay(&id)
            .unwrap()
            .into_iter()
            .filter(|r| r.label() == "ERROR->INBOUND")
            .count();
        assert_eq!(moves, 1);
    }

    #[test]
    fn concurrent_creates_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        std::thread::scope(|s| {
            for w in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for n in 0..25 {
                        store
                            .create(ItemKind::SocialMention, json!({"n": n}), &format!("w{w}"))
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(store.list(ItemState::Inbound).unwrap().len(), 100);
        assert_eq!(store.audit().records().unwrap().len(), 100);
    }

    #[test]
    fn reopen_restores_items_from_folders() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = open_store(&dir);
            let id = store.create(ItemKind::Payment, json!({"amount": 5}), "odoo").unwrap();
            store
                .transition(&id, ItemState::Inbound, ItemState::Done, Actor::DecisionAgent, "paid")
                .unwrap();
            id
        };
        // Leftover temp file from an interrupted write.
        fs::write(dir.path().join("items/done/.stray.json.tmp"), b"{").unwrap();

        let store = open_store(&dir);
        let item = store.get(&id).unwrap();
        assert_eq!(item.state, ItemState::Done);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn folder_wins_over_recorded_state() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = open_store(&dir);
            store.create(ItemKind::Email, json!({}), "gmail").unwrap()
        };
        // Simulate a crash after the rename but before the rewrite.
        fs::rename(
            dir.path().join("items/inbound").join(format!("{id}.json")),
            dir.path().join("items/pending").join(format!("{id}.json")),
        )
        .unwrap();

        let store = open_store(&dir);
        assert_eq!(store.get(&id).unwrap().state, ItemState::Pending);
    }

    /// Turns the audit partitions for today and tomorrow into directories so
    /// every append fails.
    fn break_audit(dir: &TempDir) {
        let now = Utc::now();
        for day in [now, now + chrono::Duration::days(1)] {
            let partition = dir.path().join("audit").join(format!("{}.jsonl", day.format("%Y-%m-%d")));
            let _ = fs::remove_file(&partition);
            fs::create_dir_all(&partition).unwrap();
        }
    }

    #[test]
    fn failed_audit_append_reverts_transition() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(ItemKind::Payment, json!({"amount": 150}), "odoo").unwrap();
        break_audit(&dir);

        assert!(store
            .transition(&id, ItemState::Inbound, ItemState::Pending, Actor::DecisionAgent, "gate")
            .is_err());

        assert_eq!(store.get(&id).unwrap().state, ItemState::Inbound);
        assert!(dir.path().join("items/inbound").join(format!("{id}.json")).exists());
        assert!(!dir.path().join("items/pending").join(format!("{id}.json")).exists());

        // The folder still agrees after a reopen.
        let reopened = open_store(&dir);
        assert_eq!(reopened.get(&id).unwrap().state, ItemState::Inbound);
    }

    #[test]
    fn failed_audit_append_discards_new_item() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        break_audit(&dir);

        assert!(store.create(ItemKind::Email, json!({}), "gmail").is_err());
        assert!(store.list_all().unwrap().is_empty());
        let leftovers = fs::read_dir(dir.path().join("items/inbound")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn awaiting_human_includes_policy_errors() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let pending = store.create(ItemKind::SocialPost, json!({}), "twitter").unwrap();
        store
            .transition(&pending, ItemState::Inbound, ItemState::Pending, Actor::DecisionAgent, "review")
            .unwrap();

        let held = store.create(ItemKind::Payment, json!({"amount": 150}), "odoo").unwrap();
        store
            .transition(&held, ItemState::Inbound, ItemState::Pending, Actor::DecisionAgent, "gate")
            .unwrap();
        store
            .transition(&held, ItemState::Pending, ItemState::Approved, Actor::Human, "ok")
            .unwrap();
        store
            .apply(
                &held,
                TransitionRequest::new(ItemState::Approved, ItemState::Error, Actor::DecisionAgent, "bad account")
                    .with_error(ActionError::Policy("unknown account".into())),
            )
            .unwrap();

        let ids: Vec<_> = store.awaiting_human().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&pending));
        assert!(ids.contains(&held));
    }
}
