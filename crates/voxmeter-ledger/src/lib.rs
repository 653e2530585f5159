//! File-backed usage ledger and the sync orchestration on top of it.
//!
//! The engine owns the full cycle for one agent: decrypt the stored
//! credential, fetch a snapshot from the provider, append exactly one usage
//! row, and refresh the agent's last-synced timestamp.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::instrument;
use uuid::Uuid;
use voxmeter_core::{
    ledger::{AgentCredential, LedgerError, LedgerStore, UsageRecord},
    metrics::{MetricsSnapshot, MetricsSource},
};
use voxmeter_vault::Vault;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    agents: Vec<AgentCredential>,
    usage: Vec<UsageRecord>,
}

/// JSON-file ledger. The file is the single source of truth; every operation
/// is a full read-modify-write, serialized by an internal guard.
pub struct FileLedger {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    guard: Mutex<()>,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<LedgerFile, LedgerError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(storage_err),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(LedgerFile::default()),
            Err(err) => Err(storage_err(err)),
        }
    }

    fn save(&self, file: &LedgerFile) -> Result<(), LedgerError> {
        let parent = self.path.parent().ok_or_else(|| LedgerError::Storage {
            reason: "invalid ledger path".to_string(),
        })?;
        fs::create_dir_all(parent).map_err(storage_err)?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
        let json = serde_json::to_vec_pretty(file).map_err(storage_err)?;
        tmp.write_all(&json).map_err(storage_err)?;
        tmp.flush().map_err(storage_err)?;
        tmp.persist(&self.path).map_err(|e| storage_err(e.error))?;
        Ok(())
    }

    fn with_file<T>(
        &self,
        op: impl FnOnce(&mut LedgerFile) -> Result<T, LedgerError>,
        mutates: bool,
    ) -> Result<T, LedgerError> {
        let _guard = self.guard.lock().map_err(|err| LedgerError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        let mut file = self.load()?;
        let out = op(&mut file)?;
        if mutates {
            self.save(&file)?;
        }
        Ok(out)
    }
}

fn storage_err<E: ToString>(err: E) -> LedgerError {
    LedgerError::Storage {
        reason: err.to_string(),
    }
}

#[async_trait]
impl LedgerStore for FileLedger {
    #[instrument(skip_all, fields(agent = %agent.name))]
    async fn upsert_agent(&self, agent: AgentCredential) -> Result<(), LedgerError> {
        self.with_file(
            |file| {
                if let Some(existing) = file.agents.iter_mut().find(|a| a.id == agent.id) {
                    *existing = agent;
                } else {
                    file.agents.push(agent);
                }
                Ok(())
            },
            true,
        )
    }

    async fn get_agent(&self, id: Uuid) -> Result<AgentCredential, LedgerError> {
        self.with_file(
            |file| {
                file.agents
                    .iter()
                    .find(|a| a.id == id)
                    .cloned()
                    .ok_or(LedgerError::AgentNotFound { id })
            },
            false,
        )
    }

    async fn list_agents(&self) -> Result<Vec<AgentCredential>, LedgerError> {
        self.with_file(|file| Ok(file.agents.clone()), false)
    }

    #[instrument(skip(self))]
    async fn touch_agent_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.with_file(
            |file| {
                let agent = file
                    .agents
                    .iter_mut()
                    .find(|a| a.id == id)
                    .ok_or(LedgerError::AgentNotFound { id })?;
                agent.last_synced_at = Some(at);
                Ok(())
            },
            true,
        )
    }

    #[instrument(skip_all, fields(agent = %record.agent_id))]
    async fn append_usage(&self, record: UsageRecord) -> Result<(), LedgerError> {
        self.with_file(
            |file| {
                file.usage.push(record);
                Ok(())
            },
            true,
        )
    }

    async fn list_usage(&self, agent_id: Option<Uuid>) -> Result<Vec<UsageRecord>, LedgerError> {
        self.with_file(
            |file| {
                Ok(file
                    .usage
                    .iter()
                    .filter(|r| agent_id.is_none_or(|id| r.agent_id == id))
                    .cloned()
                    .collect())
            },
            false,
        )
    }
}

/// Result of one completed sync cycle.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub agent: AgentCredential,
    pub snapshot: MetricsSnapshot,
    pub record: UsageRecord,
}

/// Orchestrates vault, metrics source, and ledger for credential and sync
/// operations. Holds no state of its own beyond its collaborators.
pub struct SyncEngine<L: LedgerStore, M: MetricsSource> {
    vault: Vault,
    ledger: L,
    source: M,
}

impl<L: LedgerStore, M: MetricsSource> SyncEngine<L, M> {
    pub fn new(vault: Vault, ledger: L, source: M) -> Self {
        Self {
            vault,
            ledger,
            source,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn source(&self) -> &M {
        &self.source
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Encrypt a plaintext provider key and register it as a new agent.
    #[instrument(skip(self, secret))]
    pub async fn add_agent(&self, name: &str, secret: &str) -> Result<AgentCredential> {
        let blob = self.vault.encrypt(secret)?;
        let agent = AgentCredential::new(name.to_string(), blob);
        self.ledger.upsert_agent(agent.clone()).await?;
        Ok(agent)
    }

    /// Run one sync cycle for an agent over an optional inclusive date range.
    /// Decryption and fetch errors propagate untouched; nothing is written
    /// to the ledger unless a snapshot was obtained.
    #[instrument(skip(self))]
    pub async fn sync_agent(
        &self,
        agent_id: Uuid,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<SyncOutcome> {
        let agent = self.ledger.get_agent(agent_id).await?;
        if !agent.is_active {
            bail!("agent '{}' is inactive", agent.name);
        }

        let secret = self.vault.decrypt(&agent.encrypted_key)?;
        let snapshot = self.source.fetch_metrics(&secret, start, end).await?;

        let record = UsageRecord::from_snapshot(agent.id, &snapshot);
        self.ledger.append_usage(record.clone()).await?;
        self.ledger
            .touch_agent_synced(agent.id, record.recorded_at)
            .await?;

        Ok(SyncOutcome {
            agent,
            snapshot,
            record,
        })
    }

    /// Decrypt an agent's stored credential and check it against the provider.
    #[instrument(skip(self))]
    pub async fn verify_agent(&self, agent_id: Uuid) -> Result<bool> {
        let agent = self.ledger.get_agent(agent_id).await?;
        let secret = self.vault.decrypt(&agent.encrypted_key)?;
        Ok(self.source.verify_credential(&secret).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use voxmeter_core::ledger::InMemoryLedger;
    use voxmeter_core::metrics::CallRecord;

    /// Metrics source that records the secrets it was handed.
    struct StubSource {
        snapshot: MetricsSnapshot,
        seen_secrets: Arc<Mutex<Vec<String>>>,
    }

    impl StubSource {
        fn new(snapshot: MetricsSnapshot) -> (Self, Arc<Mutex<Vec<String>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    snapshot,
                    seen_secrets: seen.clone(),
                },
                seen,
            )
        }
    }

    #[async_trait]
    impl MetricsSource for StubSource {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn verify_credential(&self, secret: &str) -> bool {
            self.seen_secrets.lock().unwrap().push(secret.to_string());
            true
        }

        async fn fetch_metrics(
            &self,
            secret: &str,
            _start: Option<DateTime<Utc>>,
            _end: Option<DateTime<Utc>>,
        ) -> Result<MetricsSnapshot> {
            self.seen_secrets.lock().unwrap().push(secret.to_string());
            Ok(self.snapshot.clone())
        }

        async fn fetch_recent_calls(
            &self,
            _secret: &str,
            _limit: usize,
        ) -> Result<Vec<CallRecord>> {
            Ok(Vec::new())
        }
    }

    fn test_vault() -> Vault {
        Vault::new(&"v".repeat(32)).expect("valid passphrase")
    }

    fn test_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            minutes_used: 8.0,
            call_count: 2,
            costs: 3.5,
            start_date: None,
            end_date: None,
        }
    }

    #[tokio::test]
    async fn sync_appends_usage_and_touches_agent() {
        let (source, seen) = StubSource::new(test_snapshot());
        let engine = SyncEngine::new(test_vault(), InMemoryLedger::new(), source);

        let agent = engine
            .add_agent("support-line", "sk_live_abc123")
            .await
            .expect("add agent");
        assert_ne!(agent.encrypted_key, "sk_live_abc123");

        let outcome = engine
            .sync_agent(agent.id, None, None)
            .await
            .expect("sync");
        assert_eq!(outcome.record.api_calls, 2);
        assert_eq!(outcome.record.seconds_used, 480);
        assert_eq!(outcome.record.cost, 3.5);

        // The source must have received the decrypted plaintext.
        assert_eq!(seen.lock().unwrap().as_slice(), ["sk_live_abc123"]);

        let stored = engine.ledger().get_agent(agent.id).await.expect("get");
        assert!(stored.last_synced_at.is_some());
        let usage = engine
            .ledger()
            .list_usage(Some(agent.id))
            .await
            .expect("usage");
        assert_eq!(usage.len(), 1);
    }

    #[tokio::test]
    async fn inactive_agents_are_refused() {
        let (source, _) = StubSource::new(test_snapshot());
        let engine = SyncEngine::new(test_vault(), InMemoryLedger::new(), source);

        let mut agent = engine
            .add_agent("dormant", "sk_live_dormant_0")
            .await
            .expect("add agent");
        agent.is_active = false;
        engine
            .ledger()
            .upsert_agent(agent.clone())
            .await
            .expect("deactivate");

        let err = engine
            .sync_agent(agent.id, None, None)
            .await
            .expect_err("must refuse");
        assert!(err.to_string().contains("inactive"));

        // Nothing was written for the refused sync.
        let usage = engine.ledger().list_usage(None).await.expect("usage");
        assert!(usage.is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_is_an_error() {
        let (source, _) = StubSource::new(test_snapshot());
        let engine = SyncEngine::new(test_vault(), InMemoryLedger::new(), source);
        let err = engine
            .sync_agent(Uuid::new_v4(), None, None)
            .await
            .expect_err("unknown agent");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn file_ledger_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");

        let agent = AgentCredential::new("persisted".into(), "blob".into());
        let id = agent.id;
        {
            let ledger = FileLedger::new(&path);
            ledger.upsert_agent(agent).await.expect("upsert");
            ledger
                .append_usage(UsageRecord::from_snapshot(id, &test_snapshot()))
                .await
                .expect("append");
        }

        let reopened = FileLedger::new(&path);
        let fetched = reopened.get_agent(id).await.expect("get");
        assert_eq!(fetched.name, "persisted");
        assert_eq!(reopened.list_usage(Some(id)).await.expect("usage").len(), 1);
    }

    #[tokio::test]
    async fn missing_ledger_file_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = FileLedger::new(dir.path().join("absent.json"));
        assert!(ledger.list_agents().await.expect("agents").is_empty());
        assert!(ledger.list_usage(None).await.expect("usage").is_empty());

        let err = ledger.get_agent(Uuid::new_v4()).await.expect_err("missing");
        assert!(matches!(err, LedgerError::AgentNotFound { .. }));
    }
}
