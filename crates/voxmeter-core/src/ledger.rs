use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::MetricsSnapshot;

/// Errors produced by ledger implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Requested agent does not exist (or is not visible to the caller).
    #[error("agent not found: {id}")]
    AgentNotFound { id: Uuid },
    /// Underlying storage failure.
    #[error("ledger storage failure: {reason}")]
    Storage { reason: String },
}

/// A voice-agent record holding the encrypted provider credential.
/// The blob is opaque here; only the vault can open it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentCredential {
    pub id: Uuid,
    pub name: String,
    /// Vault-produced blob (base64 of salt/iv/tag/ciphertext).
    pub encrypted_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl AgentCredential {
    pub fn new(name: String, encrypted_key: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            encrypted_key,
            is_active: true,
            created_at: Utc::now(),
            last_synced_at: None,
        }
    }
}

/// One append-only usage row derived from a metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub api_calls: u64,
    /// Call time in whole seconds (minutes rounded to the nearest second).
    pub seconds_used: u64,
    pub cost: f64,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Convert a snapshot into a ledger row for the given agent.
    pub fn from_snapshot(agent_id: Uuid, snapshot: &MetricsSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            api_calls: snapshot.call_count,
            seconds_used: (snapshot.minutes_used * 60.0).round().max(0.0) as u64,
            cost: snapshot.costs,
            recorded_at: Utc::now(),
        }
    }
}

/// Persistence contract for agents and their usage history.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert or replace an agent record keyed by id.
    async fn upsert_agent(&self, agent: AgentCredential) -> Result<(), LedgerError>;

    async fn get_agent(&self, id: Uuid) -> Result<AgentCredential, LedgerError>;

    async fn list_agents(&self) -> Result<Vec<AgentCredential>, LedgerError>;

    /// Refresh the agent's last-synced timestamp.
    async fn touch_agent_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), LedgerError>;

    /// Append one usage row; rows are never updated or deleted.
    async fn append_usage(&self, record: UsageRecord) -> Result<(), LedgerError>;

    /// List usage rows, optionally scoped to one agent, oldest first.
    async fn list_usage(&self, agent_id: Option<Uuid>) -> Result<Vec<UsageRecord>, LedgerError>;
}

#[derive(Debug, Default)]
struct LedgerState {
    agents: Vec<AgentCredential>,
    usage: Vec<UsageRecord>,
}

/// In-memory ledger for tests and smoke runs. Production uses the
/// file-backed implementation in `voxmeter-ledger`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLedger {
    inner: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, LedgerError> {
        self.inner.lock().map_err(|err| LedgerError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn upsert_agent(&self, agent: AgentCredential) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        if let Some(existing) = state.agents.iter_mut().find(|a| a.id == agent.id) {
            *existing = agent;
        } else {
            state.agents.push(agent);
        }
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<AgentCredential, LedgerError> {
        let state = self.lock()?;
        state
            .agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(LedgerError::AgentNotFound { id })
    }

    async fn list_agents(&self) -> Result<Vec<AgentCredential>, LedgerError> {
        Ok(self.lock()?.agents.clone())
    }

    async fn touch_agent_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let agent = state
            .agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(LedgerError::AgentNotFound { id })?;
        agent.last_synced_at = Some(at);
        Ok(())
    }

    async fn append_usage(&self, record: UsageRecord) -> Result<(), LedgerError> {
        self.lock()?.usage.push(record);
        Ok(())
    }

    async fn list_usage(&self, agent_id: Option<Uuid>) -> Result<Vec<UsageRecord>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .usage
            .iter()
            .filter(|r| agent_id.is_none_or(|id| r.agent_id == id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_rounds_minutes_to_seconds() {
        let snapshot = MetricsSnapshot {
            minutes_used: 8.25,
            call_count: 2,
            costs: 3.5,
            start_date: None,
            end_date: None,
        };
        let record = UsageRecord::from_snapshot(Uuid::new_v4(), &snapshot);
        assert_eq!(record.seconds_used, 495);
        assert_eq!(record.api_calls, 2);
        assert_eq!(record.cost, 3.5);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_agent() {
        let ledger = InMemoryLedger::new();
        let mut agent = AgentCredential::new("support-line".into(), "blob-a".into());
        ledger.upsert_agent(agent.clone()).await.expect("insert");

        agent.encrypted_key = "blob-b".into();
        ledger.upsert_agent(agent.clone()).await.expect("replace");

        let agents = ledger.list_agents().await.expect("list");
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].encrypted_key, "blob-b");
    }

    #[tokio::test]
    async fn touch_updates_last_synced() {
        let ledger = InMemoryLedger::new();
        let agent = AgentCredential::new("sales".into(), "blob".into());
        let id = agent.id;
        ledger.upsert_agent(agent).await.expect("insert");

        let at = Utc::now();
        ledger.touch_agent_synced(id, at).await.expect("touch");
        let fetched = ledger.get_agent(id).await.expect("get");
        assert_eq!(fetched.last_synced_at, Some(at));

        let missing = ledger
            .touch_agent_synced(Uuid::new_v4(), at)
            .await
            .expect_err("unknown agent");
        assert!(matches!(missing, LedgerError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn usage_listing_scopes_by_agent() {
        let ledger = InMemoryLedger::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let snapshot = MetricsSnapshot::default();
        ledger
            .append_usage(UsageRecord::from_snapshot(a, &snapshot))
            .await
            .expect("append a");
        ledger
            .append_usage(UsageRecord::from_snapshot(b, &snapshot))
            .await
            .expect("append b");

        assert_eq!(ledger.list_usage(None).await.expect("all").len(), 2);
        assert_eq!(ledger.list_usage(Some(a)).await.expect("scoped").len(), 1);
    }
}
