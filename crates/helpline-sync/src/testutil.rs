//! Shared scaffolding for engine and queue tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use helpline_cache::{CacheStats, MessageCache};
use helpline_store::{Database, OfflineOperation, SharedDatabase};

use crate::engine::{SyncEngine, SyncEngineConfig};
use crate::remote::{FetchWindow, MessageFetcher, OperationExecutor, RemoteMessage};

/// Pops one scripted response per fetch, in order. An exhausted script
/// returns an empty batch.
pub(crate) struct ScriptedFetcher {
    responses: Mutex<VecDeque<anyhow::Result<Vec<RemoteMessage>>>>,
    pub windows: Mutex<Vec<FetchWindow>>,
}

impl ScriptedFetcher {
    pub fn new(responses: Vec<anyhow::Result<Vec<RemoteMessage>>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            windows: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MessageFetcher for ScriptedFetcher {
    async fn fetch_messages(
        &self,
        _request_id: &str,
        window: &FetchWindow,
    ) -> anyhow::Result<Vec<RemoteMessage>> {
        self.windows.lock().unwrap().push(window.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(Vec::new()),
        }
    }
}

/// Records executed operations; optionally rejects everything.
#[derive(Default)]
pub(crate) struct FlakyExecutor {
    pub fail: AtomicBool,
    pub executed: Mutex<Vec<Uuid>>,
}

impl FlakyExecutor {
    pub fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            executed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OperationExecutor for FlakyExecutor {
    async fn execute(&self, operation: &OfflineOperation) -> anyhow::Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            anyhow::bail!("network unreachable");
        }
        self.executed.lock().unwrap().push(operation.id);
        Ok(())
    }
}

pub(crate) fn remote(request_id: &str, sequence: i64) -> RemoteMessage {
    RemoteMessage {
        id: format!("{request_id}-{sequence}"),
        temp_id: None,
        request_id: request_id.to_string(),
        sequence_number: sequence,
        content: format!("message {sequence}"),
        sender_id: "agent-1".into(),
        sender_name: "Agent".into(),
        sent_at: Utc::now(),
    }
}

pub(crate) fn remotes(request_id: &str, sequences: impl IntoIterator<Item = i64>) -> Vec<RemoteMessage> {
    sequences
        .into_iter()
        .map(|s| remote(request_id, s))
        .collect()
}

pub(crate) struct Harness {
    pub engine: SyncEngine,
    pub fetcher: Arc<ScriptedFetcher>,
    pub executor: Arc<FlakyExecutor>,
    pub db: SharedDatabase,
    _dir: tempfile::TempDir,
}

/// Opt-in log output for test runs via `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) async fn harness(
    responses: Vec<anyhow::Result<Vec<RemoteMessage>>>,
    executor: FlakyExecutor,
    config: SyncEngineConfig,
) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_at(&dir.path().join("test.db")).unwrap();
    let shared: SharedDatabase = Arc::new(tokio::sync::Mutex::new(db));
    let cache = MessageCache::new(shared.clone(), Arc::new(CacheStats::new()));

    let fetcher = Arc::new(ScriptedFetcher::new(responses));
    let executor = Arc::new(executor);
    let engine = SyncEngine::new(cache, fetcher.clone(), executor.clone(), config)
        .await
        .unwrap();

    Harness {
        engine,
        fetcher,
        executor,
        db: shared,
        _dir: dir,
    }
}
