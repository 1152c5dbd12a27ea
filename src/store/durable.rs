//! ACID-durable workflow store backed by redb.
//!
//! Every conditional update (claim, step report, stale reclaim, expansion)
//! runs inside one write transaction. redb serializes writers, so the guard
//! always sees the latest committed record. Records are JSON-encoded; step
//! results and event payloads are arbitrary JSON values.
//!
//! Reopening the same directory restores proposals, steps, events, cursors,
//! triggers and agent registrations.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, MultimapTableDefinition, ReadTransaction, ReadableMultimapTable, ReadableTable,
    TableDefinition, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{
    AgentRecord, Expansion, ProposalGuard, StepGuard, StoreResult, Update, WorkflowStore,
};
use crate::error::StoreError;
use crate::event::{Event, Payload};
use crate::trigger::{Trigger, generate_trigger_id};
use crate::workflow::{
    Proposal, ProposalDraft, ProposalId, ProposalStatus, Step, StepId, StepStatus,
};

const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
const PROPOSALS: TableDefinition<u64, &[u8]> = TableDefinition::new("proposals");
const STEPS: TableDefinition<u64, &[u8]> = TableDefinition::new("steps");
/// proposal id → JSON list of its step ids; presence means "expanded".
const STEP_INDEX: TableDefinition<u64, &[u8]> = TableDefinition::new("step_index");
/// step kind → ids of `queued` steps whose proposal has not finished.
const QUEUED: MultimapTableDefinition<&str, u64> = MultimapTableDefinition::new("queued_steps");
const TRIGGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("triggers");
const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");
/// Id counters and named cursors.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const EVENT_SEQ: &str = "seq:event";
const PROPOSAL_SEQ: &str = "seq:proposal";
const STEP_SEQ: &str = "seq:step";

fn redb_err<E: Display>(context: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{context} failed: {e}"),
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn cursor_key(name: &str) -> String {
    format!("cursor:{name}")
}

/// ACID-durable workflow store using redb.
pub struct DurableStore {
    db: Arc<Database>,
}

impl DurableStore {
    /// Open or create a durable store in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join("agora.redb");
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Read transactions cannot open tables that were never created.
    fn ensure_tables(&self) -> StoreResult<()> {
        self.write(|txn| {
            for def in [EVENTS, PROPOSALS, STEPS, STEP_INDEX] {
                txn.open_table(def).map_err(redb_err("open_table"))?;
            }
            for def in [TRIGGERS, AGENTS] {
                txn.open_table(def).map_err(redb_err("open_table"))?;
            }
            txn.open_table(META).map_err(redb_err("open_table"))?;
            txn.open_multimap_table(QUEUED)
                .map_err(redb_err("open_multimap_table"))?;
            Ok(())
        })
    }

    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> StoreResult<T>) -> StoreResult<T> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        // Dropping an uncommitted transaction aborts it.
        let out = f(&txn)?;
        txn.commit().map_err(redb_err("commit"))?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> StoreResult<T>) -> StoreResult<T> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        f(&txn)
    }

    fn next_id(txn: &WriteTransaction, counter: &str) -> StoreResult<u64> {
        let mut meta = txn.open_table(META).map_err(redb_err("open_table"))?;
        let current = meta
            .get(counter)
            .map_err(redb_err("get"))?
            .map(|g| g.value())
            .unwrap_or(0);
        let next = current + 1;
        meta.insert(counter, next).map_err(redb_err("insert"))?;
        Ok(next)
    }

    fn load_steps<T: ReadableTable<u64, &'static [u8]>>(
        table: &T,
        ids: &[StepId],
    ) -> StoreResult<Vec<Step>> {
        let mut steps = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(guard) = table.get(id.0).map_err(redb_err("get"))? {
                steps.push(decode(guard.value())?);
            }
        }
        Ok(steps)
    }

    /// Whether a proposal is `in_progress`, memoized per scan.
    fn in_progress<T: ReadableTable<u64, &'static [u8]>>(
        table: &T,
        seen: &mut HashMap<ProposalId, bool>,
        id: ProposalId,
    ) -> StoreResult<bool> {
        if let Some(known) = seen.get(&id) {
            return Ok(*known);
        }
        let raw = table
            .get(id.0)
            .map_err(redb_err("get"))?
            .map(|g| g.value().to_vec());
        let known = match raw {
            Some(raw) => decode::<Proposal>(&raw)?.status == ProposalStatus::InProgress,
            None => false,
        };
        seen.insert(id, known);
        Ok(known)
    }

    fn proposal_finished(txn: &WriteTransaction, id: ProposalId) -> StoreResult<bool> {
        let table = txn.open_table(PROPOSALS).map_err(redb_err("open_table"))?;
        let raw = table
            .get(id.0)
            .map_err(redb_err("get"))?
            .map(|g| g.value().to_vec());
        match raw {
            Some(raw) => Ok(decode::<Proposal>(&raw)?.status.is_terminal()),
            None => Ok(true),
        }
    }

    /// Drop a finished proposal's queued steps from the claim index.
    fn unindex_queued(txn: &WriteTransaction, id: ProposalId) -> StoreResult<()> {
        let index = txn.open_table(STEP_INDEX).map_err(redb_err("open_table"))?;
        let raw = index
            .get(id.0)
            .map_err(redb_err("get"))?
            .map(|g| g.value().to_vec());
        let Some(raw) = raw else {
            return Ok(());
        };
        let steps_table = txn.open_table(STEPS).map_err(redb_err("open_table"))?;
        let steps = Self::load_steps(&steps_table, &decode::<Vec<StepId>>(&raw)?)?;
        let mut queued = txn
            .open_multimap_table(QUEUED)
            .map_err(redb_err("open_multimap_table"))?;
        for step in steps.iter().filter(|s| s.status == StepStatus::Queued) {
            queued
                .remove(step.kind.as_str(), step.id.0)
                .map_err(redb_err("remove"))?;
        }
        Ok(())
    }

    fn scan<K, T>(table: &T) -> StoreResult<Vec<Vec<u8>>>
    where
        K: redb::Key + 'static,
        T: ReadableTable<K, &'static [u8]>,
    {
        let mut out = Vec::new();
        for entry in table.iter().map_err(redb_err("iter"))? {
            let (_, value) = entry.map_err(redb_err("iter"))?;
            out.push(value.value().to_vec());
        }
        Ok(out)
    }

    fn decode_all<T: DeserializeOwned>(raw: Vec<Vec<u8>>) -> StoreResult<Vec<T>> {
        raw.iter().map(|bytes| decode(bytes)).collect()
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish()
    }
}

impl WorkflowStore for DurableStore {
    fn append_event(&self, kind: &str, payload: Payload, occurred_at: u64) -> StoreResult<Event> {
        self.write(|txn| {
            let seq = Self::next_id(txn, EVENT_SEQ)?;
            let event = Event {
                seq,
                kind: kind.to_string(),
                payload,
                occurred_at,
            };
            let mut table = txn.open_table(EVENTS).map_err(redb_err("open_table"))?;
            table
                .insert(seq, encode(&event)?.as_slice())
                .map_err(redb_err("insert"))?;
            Ok(event)
        })
    }

    fn events_after(&self, after: u64, limit: usize) -> StoreResult<Vec<Event>> {
        self.read(|txn| {
            let table = txn.open_table(EVENTS).map_err(redb_err("open_table"))?;
            let range = table
                .range::<u64>((Bound::Excluded(after), Bound::Unbounded))
                .map_err(redb_err("range"))?;
            let mut out = Vec::new();
            for entry in range.take(limit) {
                let (_, value) = entry.map_err(redb_err("range"))?;
                out.push(decode(value.value())?);
            }
            Ok(out)
        })
    }

    fn last_event_seq(&self) -> StoreResult<u64> {
        self.read(|txn| {
            let table = txn.open_table(META).map_err(redb_err("open_table"))?;
            let value = table
                .get(EVENT_SEQ)
                .map_err(redb_err("get"))?
                .map(|g| g.value());
            Ok(value.unwrap_or(0))
        })
    }

    fn cursor(&self, name: &str) -> StoreResult<u64> {
        self.read(|txn| {
            let table = txn.open_table(META).map_err(redb_err("open_table"))?;
            let value = table
                .get(cursor_key(name).as_str())
                .map_err(redb_err("get"))?
                .map(|g| g.value());
            Ok(value.unwrap_or(0))
        })
    }

    fn set_cursor(&self, name: &str, value: u64) -> StoreResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(META).map_err(redb_err("open_table"))?;
            table
                .insert(cursor_key(name).as_str(), value)
                .map_err(redb_err("insert"))?;
            Ok(())
        })
    }

    fn insert_proposal(&self, draft: ProposalDraft, now: u64) -> StoreResult<Proposal> {
        self.write(|txn| {
            let id = ProposalId(Self::next_id(txn, PROPOSAL_SEQ)?);
            let proposal = Proposal::from_draft(id, draft, now);
            let mut table = txn.open_table(PROPOSALS).map_err(redb_err("open_table"))?;
            table
                .insert(id.0, encode(&proposal)?.as_slice())
                .map_err(redb_err("insert"))?;
            Ok(proposal)
        })
    }

    fn get_proposal(&self, id: ProposalId) -> StoreResult<Option<Proposal>> {
        self.read(|txn| {
            let table = txn.open_table(PROPOSALS).map_err(redb_err("open_table"))?;
            let bytes = table
                .get(id.0)
                .map_err(redb_err("get"))?
                .map(|g| g.value().to_vec());
            bytes.map(|b| decode(&b)).transpose()
        })
    }

    fn list_proposals(&self, status: Option<ProposalStatus>) -> StoreResult<Vec<Proposal>> {
        let all: Vec<Proposal> = self.read(|txn| {
            let table = txn.open_table(PROPOSALS).map_err(redb_err("open_table"))?;
            Self::decode_all(Self::scan::<u64, _>(&table)?)
        })?;
        Ok(all
            .into_iter()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .collect())
    }

    fn update_proposal_if(
        &self,
        id: ProposalId,
        guard: ProposalGuard<'_>,
    ) -> StoreResult<Update<Proposal>> {
        self.write(|txn| {
            let mut table = txn.open_table(PROPOSALS).map_err(redb_err("open_table"))?;
            let bytes = table
                .get(id.0)
                .map_err(redb_err("get"))?
                .map(|g| g.value().to_vec())
                .ok_or(StoreError::NotFound {
                    entity: "proposal",
                    id: id.to_string(),
                })?;
            let current: Proposal = decode(&bytes)?;
            let Some(next) = guard(&current) else {
                return Ok(Update::Rejected(current));
            };
            table
                .insert(id.0, encode(&next)?.as_slice())
                .map_err(redb_err("insert"))?;
            if next.status.is_terminal() && !current.status.is_terminal() {
                Self::unindex_queued(txn, id)?;
            }
            Ok(Update::Applied(next))
        })
    }

    fn list_approved_unexpanded(&self) -> StoreResult<Vec<Proposal>> {
        self.read(|txn| {
            let proposals = txn.open_table(PROPOSALS).map_err(redb_err("open_table"))?;
            let index = txn.open_table(STEP_INDEX).map_err(redb_err("open_table"))?;
            let mut out = Vec::new();
            for proposal in Self::decode_all::<Proposal>(Self::scan::<u64, _>(&proposals)?)? {
                if proposal.status != ProposalStatus::Approved {
                    continue;
                }
                if index.get(proposal.id.0).map_err(redb_err("get"))?.is_none() {
                    out.push(proposal);
                }
            }
            Ok(out)
        })
    }

    fn expand_proposal(&self, id: ProposalId) -> StoreResult<Expansion> {
        self.write(|txn| {
            let mut proposals = txn.open_table(PROPOSALS).map_err(redb_err("open_table"))?;
            let mut index = txn.open_table(STEP_INDEX).map_err(redb_err("open_table"))?;
            let mut steps_table = txn.open_table(STEPS).map_err(redb_err("open_table"))?;

            let bytes = proposals
                .get(id.0)
                .map_err(redb_err("get"))?
                .map(|g| g.value().to_vec())
                .ok_or(StoreError::NotFound {
                    entity: "proposal",
                    id: id.to_string(),
                })?;
            let mut proposal: Proposal = decode(&bytes)?;

            let indexed = index
                .get(id.0)
                .map_err(redb_err("get"))?
                .map(|g| g.value().to_vec());
            if let Some(raw) = indexed {
                let ids: Vec<StepId> = decode(&raw)?;
                let steps = Self::load_steps(&steps_table, &ids)?;
                return Ok(Expansion::AlreadyExpanded { proposal, steps });
            }

            if proposal.mark_expanded().is_err() {
                return Ok(Expansion::NotApproved(proposal));
            }

            let mut steps = Vec::with_capacity(proposal.step_kinds.len());
            for (position, kind) in proposal.step_kinds.iter().enumerate() {
                let step_id = StepId(Self::next_id(txn, STEP_SEQ)?);
                let step = Step::queued(step_id, id, position, kind);
                steps_table
                    .insert(step_id.0, encode(&step)?.as_slice())
                    .map_err(redb_err("insert"))?;
                steps.push(step);
            }
            let mut queued = txn
                .open_multimap_table(QUEUED)
                .map_err(redb_err("open_multimap_table"))?;
            for step in &steps {
                queued
                    .insert(step.kind.as_str(), step.id.0)
                    .map_err(redb_err("insert"))?;
            }
            let ids: Vec<StepId> = steps.iter().map(|s| s.id).collect();
            index
                .insert(id.0, encode(&ids)?.as_slice())
                .map_err(redb_err("insert"))?;
            proposals
                .insert(id.0, encode(&proposal)?.as_slice())
                .map_err(redb_err("insert"))?;

            Ok(Expansion::Expanded { proposal, steps })
        })
    }

    fn get_step(&self, id: StepId) -> StoreResult<Option<Step>> {
        self.read(|txn| {
            let table = txn.open_table(STEPS).map_err(redb_err("open_table"))?;
            let bytes = table
                .get(id.0)
                .map_err(redb_err("get"))?
                .map(|g| g.value().to_vec());
            bytes.map(|b| decode(&b)).transpose()
        })
    }

    fn steps_for(&self, proposal: ProposalId) -> StoreResult<Vec<Step>> {
        self.read(|txn| {
            let index = txn.open_table(STEP_INDEX).map_err(redb_err("open_table"))?;
            let steps = txn.open_table(STEPS).map_err(redb_err("open_table"))?;
            let raw = index
                .get(proposal.0)
                .map_err(redb_err("get"))?
                .map(|g| g.value().to_vec());
            match raw {
                Some(raw) => Self::load_steps(&steps, &decode::<Vec<StepId>>(&raw)?),
                None => Ok(Vec::new()),
            }
        })
    }

    fn claimable_steps(&self, kinds: &BTreeSet<String>, limit: usize) -> StoreResult<Vec<Step>> {
        self.read(|txn| {
            let queued = txn
                .open_multimap_table(QUEUED)
                .map_err(redb_err("open_multimap_table"))?;
            let steps = txn.open_table(STEPS).map_err(redb_err("open_table"))?;
            let proposals = txn.open_table(PROPOSALS).map_err(redb_err("open_table"))?;
            let mut seen = HashMap::new();
            let mut out = Vec::new();
            // The first `limit` per kind always contain the oldest `limit`
            // overall.
            for kind in kinds {
                let mut taken = 0;
                for entry in queued.get(kind.as_str()).map_err(redb_err("get"))? {
                    if taken >= limit {
                        break;
                    }
                    let step_id = entry.map_err(redb_err("get"))?.value();
                    let raw = steps
                        .get(step_id)
                        .map_err(redb_err("get"))?
                        .map(|g| g.value().to_vec());
                    let Some(raw) = raw else {
                        continue;
                    };
                    let step: Step = decode(&raw)?;
                    if step.status == StepStatus::Queued
                        && Self::in_progress(&proposals, &mut seen, step.proposal_id)?
                    {
                        out.push(step);
                        taken += 1;
                    }
                }
            }
            out.sort_by_key(|s| s.id);
            out.truncate(limit);
            Ok(out)
        })
    }

    fn update_step_if(&self, id: StepId, guard: StepGuard<'_>) -> StoreResult<Update<Step>> {
        self.write(|txn| {
            let mut table = txn.open_table(STEPS).map_err(redb_err("open_table"))?;
            let bytes = table
                .get(id.0)
                .map_err(redb_err("get"))?
                .map(|g| g.value().to_vec())
                .ok_or(StoreError::NotFound {
                    entity: "step",
                    id: id.to_string(),
                })?;
            let current: Step = decode(&bytes)?;
            let Some(next) = guard(&current) else {
                return Ok(Update::Rejected(current));
            };
            table
                .insert(id.0, encode(&next)?.as_slice())
                .map_err(redb_err("insert"))?;

            let was_queued = current.status == StepStatus::Queued;
            let is_queued = next.status == StepStatus::Queued;
            if was_queued != is_queued {
                let requeue_open = is_queued && !Self::proposal_finished(txn, next.proposal_id)?;
                let mut queued = txn
                    .open_multimap_table(QUEUED)
                    .map_err(redb_err("open_multimap_table"))?;
                if requeue_open {
                    queued
                        .insert(next.kind.as_str(), id.0)
                        .map_err(redb_err("insert"))?;
                } else if was_queued {
                    queued
                        .remove(current.kind.as_str(), id.0)
                        .map_err(redb_err("remove"))?;
                }
            }
            Ok(Update::Applied(next))
        })
    }

    fn list_stale_steps(&self, cutoff: u64) -> StoreResult<Vec<Step>> {
        let all: Vec<Step> = self.read(|txn| {
            let table = txn.open_table(STEPS).map_err(redb_err("open_table"))?;
            Self::decode_all(Self::scan::<u64, _>(&table)?)
        })?;
        Ok(all
            .into_iter()
            .filter(|s| {
                matches!(s.status, StepStatus::Claimed | StepStatus::Running)
                    && s.claimed_at.is_some_and(|at| at < cutoff)
            })
            .collect())
    }

    fn put_trigger(&self, mut trigger: Trigger) -> StoreResult<Trigger> {
        if trigger.id.is_empty() {
            trigger.id = generate_trigger_id();
        }
        let bytes = encode(&trigger)?;
        self.write(|txn| {
            let mut table = txn.open_table(TRIGGERS).map_err(redb_err("open_table"))?;
            table
                .insert(trigger.id.as_str(), bytes.as_slice())
                .map_err(redb_err("insert"))?;
            Ok(())
        })?;
        Ok(trigger)
    }

    fn remove_trigger(&self, id: &str) -> StoreResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(TRIGGERS).map_err(redb_err("open_table"))?;
            let existed = table.remove(id).map_err(redb_err("remove"))?.is_some();
            Ok(existed)
        })
    }

    fn record_trigger_fired(&self, id: &str, at: u64) -> StoreResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(TRIGGERS).map_err(redb_err("open_table"))?;
            let raw = table
                .get(id)
                .map_err(redb_err("get"))?
                .map(|g| g.value().to_vec());
            let Some(raw) = raw else {
                return Ok(false);
            };
            let mut trigger: Trigger = decode(&raw)?;
            trigger.last_fired_at = Some(trigger.last_fired_at.map_or(at, |prev| prev.max(at)));
            table
                .insert(id, encode(&trigger)?.as_slice())
                .map_err(redb_err("insert"))?;
            Ok(true)
        })
    }

    fn list_triggers(&self) -> StoreResult<Vec<Trigger>> {
        self.read(|txn| {
            let table = txn.open_table(TRIGGERS).map_err(redb_err("open_table"))?;
            Self::decode_all(Self::scan::<&str, _>(&table)?)
        })
    }

    fn put_agent(&self, record: AgentRecord) -> StoreResult<()> {
        let bytes = encode(&record)?;
        self.write(|txn| {
            let mut table = txn.open_table(AGENTS).map_err(redb_err("open_table"))?;
            table
                .insert(record.agent_id.as_str(), bytes.as_slice())
                .map_err(redb_err("insert"))?;
            Ok(())
        })
    }

    fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        self.read(|txn| {
            let table = txn.open_table(AGENTS).map_err(redb_err("open_table"))?;
            Self::decode_all(Self::scan::<&str, _>(&table)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::store::contract;

    fn store() -> (TempDir, DurableStore) {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn events_are_sequenced() {
        let (_dir, store) = store();
        contract::events_are_sequenced(&store);
    }

    #[test]
    fn expansion_is_idempotent() {
        let (_dir, store) = store();
        contract::expansion_is_idempotent(&store);
    }

    #[test]
    fn claim_respects_kinds_and_proposal_status() {
        let (_dir, store) = store();
        contract::claim_respects_kinds_and_proposal_status(&store);
    }

    #[test]
    fn stale_scan_uses_strict_cutoff() {
        let (_dir, store) = store();
        contract::stale_scan_uses_strict_cutoff(&store);
    }

    #[test]
    fn registries_round_trip() {
        let (_dir, store) = store();
        contract::registries_round_trip(&store);
    }

    #[test]
    fn firing_time_leaves_other_fields_alone() {
        let (_dir, store) = store();
        contract::firing_time_leaves_other_fields_alone(&store);
    }

    #[test]
    fn requeued_steps_are_claimable_again() {
        let (_dir, store) = store();
        contract::requeued_steps_are_claimable_again(&store);
    }

    #[test]
    fn finished_proposals_leave_the_queued_index() {
        let (_dir, store) = store();
        let queued_votes = |store: &DurableStore| {
            store
                .read(|txn| {
                    let table = txn
                        .open_multimap_table(QUEUED)
                        .map_err(redb_err("open_multimap_table"))?;
                    Ok(table.get("vote").map_err(redb_err("get"))?.count())
                })
                .unwrap()
        };

        let p = store
            .insert_proposal(contract::draft(&["vote", "vote"], true), 1)
            .unwrap();
        store.expand_proposal(p.id).unwrap();
        assert_eq!(queued_votes(&store), 2);

        let claimed = store
            .claim_step(&contract::kinds(&["vote"]), "a", 5)
            .unwrap()
            .unwrap();
        assert_eq!(queued_votes(&store), 1);

        store
            .update_proposal_if(p.id, &|cur: &Proposal| {
                let mut next = cur.clone();
                next.cancel(&[], 6).ok().map(|_| next)
            })
            .unwrap();
        assert_eq!(queued_votes(&store), 0);

        // A late requeue under the cancelled proposal stays out of the index.
        store
            .update_step_if(claimed.id, &|cur: &Step| {
                let mut next = cur.clone();
                next.reclaim_stale(3).ok().map(|_| next)
            })
            .unwrap();
        assert_eq!(queued_votes(&store), 0);
        assert_eq!(
            store.get_step(claimed.id).unwrap().unwrap().status,
            StepStatus::Queued
        );
        assert!(store
            .claimable_steps(&contract::kinds(&["vote"]), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn exactly_one_claim_wins() {
        let (_dir, store) = store();
        contract::exactly_one_claim_wins(Arc::new(store));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let (proposal_id, step_id) = {
            let store = DurableStore::open(dir.path()).unwrap();
            let p = store
                .insert_proposal(contract::draft(&["build"], true), 1)
                .unwrap();
            store.expand_proposal(p.id).unwrap();
            let step = store
                .claim_step(&contract::kinds(&["build"]), "a", 5)
                .unwrap()
                .unwrap();
            store.append_event("deployed", Payload::new(), 6).unwrap();
            store.set_cursor("heartbeat.events", 1).unwrap();
            (p.id, step.id)
        };

        let store = DurableStore::open(dir.path()).unwrap();
        let proposal = store.get_proposal(proposal_id).unwrap().unwrap();
        assert_eq!(proposal.status, ProposalStatus::InProgress);
        let step = store.get_step(step_id).unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Claimed);
        assert_eq!(step.claimed_by.as_deref(), Some("a"));
        assert_eq!(store.cursor("heartbeat.events").unwrap(), 1);

        // Counters continue instead of reusing ids.
        let next = store
            .insert_proposal(contract::draft(&["x"], false), 7)
            .unwrap();
        assert!(next.id > proposal_id);
        let event = store.append_event("again", Payload::new(), 8).unwrap();
        assert_eq!(event.seq, 2);
    }
}
