//! Optimistic override store.
//!
//! Each user-initiated status mutation parks an override here until the
//! authoritative stream or a refetch catches up. The store is the single
//! merge point between local belief and server truth: consumers must render
//! through [`OverrideStore::effective_status`], never by reading snapshots
//! directly, or optimistic edits get overwritten mid-flight by an unrelated
//! refetch.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;

use opswire_proto::EntitySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverridePhase {
    /// The mutating request is in flight.
    Pending,
    /// The server acknowledged the mutation; the entry waits for the
    /// authoritative stream to agree before it can be dropped.
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct OverrideEntry {
    /// What the UI should show.
    pub current_status: String,
    /// Pre-mutation value, restored on rollback.
    pub original_status: String,
    pub created_at: Instant,
    pub last_touched_at: Instant,
    pub phase: OverridePhase,
    /// Diagnostic only: the authoritative state has disagreed for longer
    /// than the configured threshold. The entry itself is left untouched.
    pub stale: bool,
}

/// At most one entry per entity id. Entries are created by user actions,
/// confirmed or rolled back by the mutation outcome, and retired only by
/// reconciliation against authoritative snapshots, never by a timer.
pub struct OverrideStore {
    entries: RwLock<HashMap<String, OverrideEntry>>,
    revision: watch::Sender<u64>,
    stale_after: Option<Duration>,
}

impl OverrideStore {
    pub fn new(stale_after: Option<Duration>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: RwLock::new(HashMap::new()),
            revision,
            stale_after,
        }
    }

    /// Create or replace the entry for `entity_id`. A replacement keeps the
    /// first recorded `original_status`, so rollback restores the true
    /// pre-mutation state rather than an intermediate one.
    pub fn begin_override(&self, entity_id: &str, new_status: &str, original_status: &str) {
        let now = Instant::now();
        {
            let mut entries = self.entries.write();
            let original = entries
                .get(entity_id)
                .map(|entry| entry.original_status.clone())
                .unwrap_or_else(|| original_status.to_string());
            entries.insert(
                entity_id.to_string(),
                OverrideEntry {
                    current_status: new_status.to_string(),
                    original_status: original,
                    created_at: now,
                    last_touched_at: now,
                    phase: OverridePhase::Pending,
                    stale: false,
                },
            );
        }
        self.bump();
    }

    /// Mark the in-flight mutation as acknowledged. A missing entry is a
    /// logged no-op: reconciliation may already have caught up and removed
    /// it.
    pub fn confirm_override(&self, entity_id: &str) {
        let confirmed = {
            let mut entries = self.entries.write();
            match entries.get_mut(entity_id) {
                Some(entry) => {
                    entry.phase = OverridePhase::Confirmed;
                    entry.last_touched_at = Instant::now();
                    true
                }
                None => false,
            }
        };
        if confirmed {
            self.bump();
        } else {
            tracing::debug!(
                entity = entity_id,
                "confirm for missing override; reconciliation already caught up"
            );
        }
    }

    /// Drop the entry entirely, whatever its phase. Used only when the
    /// mutating request failed; the UI falls back to the authoritative
    /// status.
    pub fn rollback_override(&self, entity_id: &str) {
        let removed = self.entries.write().remove(entity_id).is_some();
        if removed {
            self.bump();
        } else {
            tracing::debug!(entity = entity_id, "rollback for missing override");
        }
    }

    /// Reconcile confirmed entries against an authoritative snapshot.
    ///
    /// A confirmed entry is dropped when the entity no longer exists or
    /// when the snapshot agrees with it; a disagreeing entry is kept
    /// regardless of age (a late snapshot must not visibly revert a user's
    /// action). Pending entries belong to the in-flight mutation and are
    /// never touched here. Synchronous and idempotent: safe to call from a
    /// dispatch callback and commutative with interleaved push events.
    pub fn reconcile(&self, authoritative: &[EntitySnapshot]) {
        let index: HashMap<&str, &str> = authoritative
            .iter()
            .map(|snapshot| (snapshot.id.as_str(), snapshot.status.as_str()))
            .collect();

        let mut changed = false;
        {
            let mut entries = self.entries.write();
            entries.retain(|entity_id, entry| {
                if entry.phase != OverridePhase::Confirmed {
                    return true;
                }
                match index.get(entity_id.as_str()) {
                    None => {
                        changed = true;
                        false
                    }
                    Some(status) if *status == entry.current_status => {
                        changed = true;
                        false
                    }
                    Some(status) => {
                        if let Some(limit) = self.stale_after {
                            if !entry.stale && entry.created_at.elapsed() > limit {
                                entry.stale = true;
                                changed = true;
                                tracing::warn!(
                                    entity = %entity_id,
                                    held = %entry.current_status,
                                    authoritative = %status,
                                    "confirmed override still disagrees with server; keeping it"
                                );
                            }
                        }
                        true
                    }
                }
            });
        }
        if changed {
            self.bump();
        }
    }

    /// The merged view for one entity: the override's status while an entry
    /// exists, the authoritative status otherwise.
    pub fn effective_status(&self, entity_id: &str, authoritative: &str) -> String {
        self.entries
            .read()
            .get(entity_id)
            .map(|entry| entry.current_status.clone())
            .unwrap_or_else(|| authoritative.to_string())
    }

    /// Clone of the entry for `entity_id`, if any. Mutation goes through
    /// the store's own methods only.
    pub fn entry(&self, entity_id: &str) -> Option<OverrideEntry> {
        self.entries.read().get(entity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Revision counter bumped on every entry-set change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, &str)]) -> Vec<EntitySnapshot> {
        pairs
            .iter()
            .map(|(id, status)| EntitySnapshot {
                id: id.to_string(),
                status: status.to_string(),
            })
            .collect()
    }

    #[test]
    fn confirmed_override_outlives_lagging_snapshots() {
        let store = OverrideStore::new(None);
        store.begin_override("o1", "confirmed", "pending");
        store.confirm_override("o1");

        // However many stale snapshots arrive, the override holds.
        for _ in 0..5 {
            store.reconcile(&snapshot(&[("o1", "pending")]));
            assert_eq!(store.effective_status("o1", "pending"), "confirmed");
        }

        store.reconcile(&snapshot(&[("o1", "confirmed")]));
        assert!(store.entry("o1").is_none());
        assert_eq!(store.effective_status("o1", "confirmed"), "confirmed");
    }

    #[test]
    fn replacement_keeps_the_first_original_status() {
        let store = OverrideStore::new(None);
        store.begin_override("o1", "packing", "pending");
        store.begin_override("o1", "shipped", "packing");

        let entry = store.entry("o1").unwrap();
        assert_eq!(entry.current_status, "shipped");
        assert_eq!(entry.original_status, "pending");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rollback_restores_authoritative_view_immediately() {
        let store = OverrideStore::new(None);
        store.begin_override("o2", "confirmed", "pending");
        store.rollback_override("o2");

        assert!(store.entry("o2").is_none());
        assert_eq!(store.effective_status("o2", "pending"), "pending");
    }

    #[test]
    fn reconcile_drops_entries_for_vanished_entities() {
        let store = OverrideStore::new(None);
        store.begin_override("o3", "archived", "open");
        store.confirm_override("o3");

        store.reconcile(&snapshot(&[("other", "open")]));
        assert!(store.entry("o3").is_none());
    }

    #[test]
    fn reconcile_never_touches_pending_entries() {
        let store = OverrideStore::new(None);
        store.begin_override("o4", "confirmed", "pending");

        store.reconcile(&snapshot(&[("o4", "confirmed")]));
        let entry = store.entry("o4").unwrap();
        assert_eq!(entry.phase, OverridePhase::Pending);
        assert_eq!(store.effective_status("o4", "confirmed"), "confirmed");
    }

    #[test]
    fn confirm_of_missing_entry_is_a_no_op() {
        let store = OverrideStore::new(None);
        store.confirm_override("ghost");
        assert!(store.is_empty());
    }

    #[test]
    fn disagreement_past_threshold_flags_but_keeps_the_entry() {
        let store = OverrideStore::new(Some(Duration::ZERO));
        store.begin_override("o5", "confirmed", "pending");
        store.confirm_override("o5");

        store.reconcile(&snapshot(&[("o5", "pending")]));
        let entry = store.entry("o5").unwrap();
        assert!(entry.stale);
        assert_eq!(entry.current_status, "confirmed");

        // Still present and still winning the merged view.
        assert_eq!(store.effective_status("o5", "pending"), "confirmed");
    }

    #[test]
    fn revision_bumps_on_every_entry_set_change() {
        let store = OverrideStore::new(None);
        let changes = store.changes();
        let before = *changes.borrow();

        store.begin_override("o6", "confirmed", "pending");
        store.confirm_override("o6");
        store.reconcile(&snapshot(&[("o6", "confirmed")]));

        assert!(*changes.borrow() >= before + 3);
    }
}
