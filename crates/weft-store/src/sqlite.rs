use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use weft_core::error::{Result, WeftError};
use weft_core::graph::Graph;
use weft_core::traits::{IdempotencyRegistry, RunStore};
use weft_core::types::{IdempotencyKey, NodeRun, Run, RunId, RunStatus};

use crate::apply_transition;

const RUN_COLUMNS: &str = "id, graph_id, status, generation, parent_run_id, failure_message, \
                           created_at, started_at, finished_at";

const NODE_RUN_COLUMNS: &str = "id, run_id, node_id, execution_index, status, input_context, \
                                output_state, routing_state, error, dispatch, started_at, finished_at";

/// SQLite-backed store for graphs, runs, node runs, and idempotency keys.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Opened run store");
        Ok(store)
    }

    /// A private in-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS graphs (
                 id TEXT PRIMARY KEY,
                 body TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS runs (
                 id TEXT PRIMARY KEY,
                 graph_id TEXT NOT NULL,
                 status TEXT NOT NULL,
                 generation INTEGER NOT NULL DEFAULT 1,
                 parent_run_id TEXT,
                 failure_message TEXT,
                 created_at TEXT NOT NULL,
                 started_at TEXT,
                 finished_at TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_runs_graph ON runs(graph_id, created_at);

             CREATE TABLE IF NOT EXISTS node_runs (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 id TEXT NOT NULL UNIQUE,
                 run_id TEXT NOT NULL,
                 node_id TEXT NOT NULL,
                 execution_index INTEGER NOT NULL,
                 status TEXT NOT NULL,
                 input_context TEXT NOT NULL,
                 output_state TEXT,
                 routing_state TEXT,
                 error TEXT,
                 dispatch TEXT,
                 started_at TEXT NOT NULL,
                 finished_at TEXT,
                 UNIQUE(run_id, node_id, execution_index)
             );

             CREATE INDEX IF NOT EXISTS idx_node_runs_run ON node_runs(run_id, seq);

             CREATE TABLE IF NOT EXISTS idempotency_keys (
                 scope TEXT NOT NULL,
                 key TEXT NOT NULL,
                 first_seen_at TEXT NOT NULL,
                 last_seen_at TEXT NOT NULL,
                 hit_count INTEGER NOT NULL DEFAULT 1,
                 PRIMARY KEY (scope, key)
             );",
        )
        .map_err(db)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| WeftError::Database(e.to_string()))
    }

    /// Read-modify-write a run inside one immediate transaction.
    fn mutate_run<F>(&self, run_id: &RunId, f: F) -> Result<Run>
    where
        F: FnOnce(&mut Run),
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        let mut run = select_run(&tx, run_id)?
            .ok_or_else(|| WeftError::not_found("run", run_id.as_str()))?;
        f(&mut run);
        tx.execute(
            "UPDATE runs SET status = ?2, failure_message = ?3, started_at = ?4, finished_at = ?5
             WHERE id = ?1",
            params![
                run.id.as_str(),
                run.status.as_str(),
                run.failure_message,
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(run)
    }
}

fn db(e: rusqlite::Error) -> WeftError {
    WeftError::Database(e.to_string())
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| conversion(idx, e))
}

fn parse_opt_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<T>> {
    s.as_deref().map(|s| parse_json(idx, s)).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(6)?;
    Ok(Run {
        id: RunId(row.get(0)?),
        graph_id: row.get(1)?,
        status: status.parse().map_err(|e| conversion(2, e))?,
        generation: row.get::<_, i64>(3)? as u32,
        parent_run_id: row.get::<_, Option<String>>(4)?.map(RunId),
        failure_message: row.get(5)?,
        created_at: parse_ts(&created_at),
        started_at: parse_opt_ts(row.get(7)?),
        finished_at: parse_opt_ts(row.get(8)?),
    })
}

fn row_to_node_run(row: &Row<'_>) -> rusqlite::Result<NodeRun> {
    let status: String = row.get(4)?;
    let input: String = row.get(5)?;
    let started_at: String = row.get(10)?;
    Ok(NodeRun {
        id: row.get(0)?,
        run_id: RunId(row.get(1)?),
        node_id: row.get(2)?,
        execution_index: row.get::<_, i64>(3)? as u32,
        status: status.parse().map_err(|e| conversion(4, e))?,
        input_context: parse_json(5, &input)?,
        output_state: parse_opt_json(6, row.get(6)?)?,
        routing_state: parse_opt_json(7, row.get(7)?)?,
        error: row.get(8)?,
        dispatch: parse_opt_json(9, row.get(9)?)?,
        started_at: parse_ts(&started_at),
        finished_at: parse_opt_ts(row.get(11)?),
    })
}

fn select_run(conn: &Connection, run_id: &RunId) -> Result<Option<Run>> {
    conn.query_row(
        &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
        params![run_id.as_str()],
        row_to_run,
    )
    .optional()
    .map_err(db)
}

impl RunStore for SqliteStore {
    fn put_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>> {
        let id = graph.id.clone();
        let body = to_json(graph);
        Box::pin(async move {
            let body = body?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO graphs (id, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![id, body, Utc::now().to_rfc3339()],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn get_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM graphs WHERE id = ?1",
                    params![graph_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            let body = body.ok_or_else(|| WeftError::not_found("graph", graph_id))?;
            Ok(serde_json::from_str(&body)?)
        })
    }

    fn create_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                &format!(
                    "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    RUN_COLUMNS
                ),
                params![
                    run.id.as_str(),
                    run.graph_id,
                    run.status.as_str(),
                    run.generation as i64,
                    run.parent_run_id.as_ref().map(|p| p.as_str()),
                    run.failure_message,
                    run.created_at.to_rfc3339(),
                    run.started_at.map(|t| t.to_rfc3339()),
                    run.finished_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(db)?;
            debug!(run_id = %run.id, graph_id = %run.graph_id, "Run created");
            Ok(())
        })
    }

    fn get_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            select_run(&conn, &run_id)?.ok_or_else(|| WeftError::not_found("run", run_id.0))
        })
    }

    fn list_runs(&self, graph_id: &str) -> BoxFuture<'_, Result<Vec<Run>>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM runs WHERE graph_id = ?1 ORDER BY created_at, rowid",
                    RUN_COLUMNS
                ))
                .map_err(db)?;
            let rows = stmt
                .query_map(params![graph_id], row_to_run)
                .map_err(db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db)?;
            Ok(rows)
        })
    }

    fn transition_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        failure_message: Option<String>,
    ) -> BoxFuture<'_, Result<Run>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.mutate_run(&run_id, |run| apply_transition(run, status, failure_message))
        })
    }

    fn claim_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let mut claimed = false;
            let run = self.mutate_run(&run_id, |run| {
                if run.status == RunStatus::Queued {
                    apply_transition(run, RunStatus::Running, None);
                    claimed = true;
                }
            })?;
            Ok(claimed.then_some(run))
        })
    }

    fn request_stop(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.mutate_run(&run_id, |run| {
                if matches!(run.status, RunStatus::Queued | RunStatus::Running) {
                    run.status = RunStatus::Stopping;
                }
            })
        })
    }

    fn cancel_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.mutate_run(&run_id, |run| apply_transition(run, RunStatus::Canceled, None))
        })
    }

    fn insert_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>> {
        let nr = node_run.clone();
        Box::pin(async move {
            let input = to_json(&nr.input_context)?;
            let output = nr.output_state.as_ref().map(to_json).transpose()?;
            let routing = nr.routing_state.as_ref().map(to_json).transpose()?;
            let dispatch = nr.dispatch.as_ref().map(to_json).transpose()?;

            let mut conn = self.lock()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let latest: Option<i64> = tx
                .query_row(
                    "SELECT MAX(execution_index) FROM node_runs WHERE run_id = ?1 AND node_id = ?2",
                    params![nr.run_id.as_str(), nr.node_id],
                    |row| row.get(0),
                )
                .map_err(db)?;
            if latest.is_some_and(|l| l >= nr.execution_index as i64) {
                return Err(WeftError::Database(format!(
                    "execution index {} for node {} is not increasing",
                    nr.execution_index, nr.node_id
                )));
            }
            tx.execute(
                &format!(
                    "INSERT INTO node_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    NODE_RUN_COLUMNS
                ),
                params![
                    nr.id,
                    nr.run_id.as_str(),
                    nr.node_id,
                    nr.execution_index as i64,
                    nr.status.as_str(),
                    input,
                    output,
                    routing,
                    nr.error,
                    dispatch,
                    nr.started_at.to_rfc3339(),
                    nr.finished_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(db)?;
            tx.commit().map_err(db)?;
            Ok(())
        })
    }

    fn update_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>> {
        let nr = node_run.clone();
        Box::pin(async move {
            let output = nr.output_state.as_ref().map(to_json).transpose()?;
            let routing = nr.routing_state.as_ref().map(to_json).transpose()?;
            let dispatch = nr.dispatch.as_ref().map(to_json).transpose()?;

            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE node_runs SET status = ?2, output_state = ?3, routing_state = ?4,
                         error = ?5, dispatch = ?6, finished_at = ?7
                     WHERE id = ?1",
                    params![
                        nr.id,
                        nr.status.as_str(),
                        output,
                        routing,
                        nr.error,
                        dispatch,
                        nr.finished_at.map(|t| t.to_rfc3339()),
                    ],
                )
                .map_err(db)?;
            if changed == 0 {
                return Err(WeftError::not_found("node run", nr.id));
            }
            Ok(())
        })
    }

    fn list_node_runs(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<NodeRun>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM node_runs WHERE run_id = ?1 ORDER BY seq",
                    NODE_RUN_COLUMNS
                ))
                .map_err(db)?;
            let rows = stmt
                .query_map(params![run_id.as_str()], row_to_node_run)
                .map_err(db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db)?;
            Ok(rows)
        })
    }
}

impl IdempotencyRegistry for SqliteStore {
    fn register(&self, scope: &str, key: &str) -> BoxFuture<'_, Result<bool>> {
        let scope = scope.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let now = Utc::now().to_rfc3339();
            let mut conn = self.lock()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO idempotency_keys (scope, key, first_seen_at, last_seen_at, hit_count)
                     VALUES (?1, ?2, ?3, ?3, 1)",
                    params![scope, key, now],
                )
                .map_err(db)?;
            if inserted == 0 {
                tx.execute(
                    "UPDATE idempotency_keys SET hit_count = hit_count + 1, last_seen_at = ?3
                     WHERE scope = ?1 AND key = ?2",
                    params![scope, key, now],
                )
                .map_err(db)?;
                debug!(%scope, %key, "Idempotency key already registered");
            }
            tx.commit().map_err(db)?;
            Ok(inserted == 1)
        })
    }

    fn lookup(&self, scope: &str, key: &str) -> BoxFuture<'_, Result<Option<IdempotencyKey>>> {
        let scope = scope.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT scope, key, first_seen_at, last_seen_at, hit_count
                 FROM idempotency_keys WHERE scope = ?1 AND key = ?2",
                params![scope, key],
                |row| {
                    let first: String = row.get(2)?;
                    let last: String = row.get(3)?;
                    Ok(IdempotencyKey {
                        scope: row.get(0)?,
                        key: row.get(1)?,
                        first_seen_at: parse_ts(&first),
                        last_seen_at: parse_ts(&last),
                        hit_count: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()
            .map_err(db)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::graph::{Edge, Node, NodeKind};
    use weft_core::types::{NodeRunStatus, RoutingState};

    fn sample_graph() -> Graph {
        Graph {
            id: "g1".into(),
            name: Some("sample".into()),
            nodes: vec![Node::new("start", NodeKind::Start), Node::new("end", NodeKind::End)],
            edges: vec![Edge::solid("e1", "start", "end")],
            guardrails: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_graph_roundtrip_and_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let mut graph = sample_graph();
        store.put_graph(&graph).await.unwrap();
        graph.name = Some("renamed".into());
        store.put_graph(&graph).await.unwrap();

        let loaded = store.get_graph("g1").await.unwrap();
        assert_eq!(loaded.name.as_deref(), Some("renamed"));
        assert_eq!(loaded.nodes.len(), 2);
        assert!(matches!(
            store.get_graph("missing").await,
            Err(WeftError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_lifecycle_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.db");
        let run = Run::queued("g1");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_run(&run).await.unwrap();
            assert!(store.claim_run(&run.id).await.unwrap().is_some());
            store
                .transition_run(&run.id, RunStatus::Failed, Some("boom".into()))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_run(&run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.failure_message.as_deref(), Some("boom"));
        assert!(loaded.started_at.is_some());
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_is_single_shot() {
        let store = SqliteStore::in_memory().unwrap();
        let run = Run::queued("g1");
        store.create_run(&run).await.unwrap();
        assert!(store.claim_run(&run.id).await.unwrap().is_some());
        assert!(store.claim_run(&run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_then_cancel() {
        let store = SqliteStore::in_memory().unwrap();
        let run = Run::queued("g1");
        store.create_run(&run).await.unwrap();
        let stopping = store.request_stop(&run.id).await.unwrap();
        assert_eq!(stopping.status, RunStatus::Stopping);
        let canceled = store.cancel_run(&run.id).await.unwrap();
        assert_eq!(canceled.status, RunStatus::Canceled);
        // Terminal: a late stop request is a no-op.
        let still = store.request_stop(&run.id).await.unwrap();
        assert_eq!(still.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn test_node_runs_keep_order_and_payloads() {
        let store = SqliteStore::in_memory().unwrap();
        let run_id = RunId::from_str("r1");
        let mut first = NodeRun::running(run_id.clone(), "a", 1, serde_json::json!({"tokens": []}));
        store.insert_node_run(&first).await.unwrap();
        let second = NodeRun::running(run_id.clone(), "b", 1, serde_json::json!({}));
        store.insert_node_run(&second).await.unwrap();

        first.complete(
            serde_json::json!({"x": 1}),
            RoutingState::route("A"),
            weft_core::types::RunMetadata {
                selected_provider: weft_core::types::ProviderKind::InProcess,
                final_provider: Some(weft_core::types::ProviderKind::InProcess),
                dispatch_id: "dsp-1".into(),
                dispatch_status: weft_core::types::DispatchStatus::Confirmed,
                fallback_attempted: false,
                fallback_reason: None,
                dispatch_uncertain: false,
                cli_used: false,
                api_failure: None,
            },
        );
        store.update_node_run(&first).await.unwrap();

        let rows = store.list_node_runs(&run_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].node_id, "a");
        assert_eq!(rows[0].status, NodeRunStatus::Completed);
        assert_eq!(rows[0].output_state, Some(serde_json::json!({"x": 1})));
        assert_eq!(
            rows[0].routing_state.as_ref().and_then(|r| r.route_key.as_deref()),
            Some("A")
        );
        assert_eq!(rows[0].dispatch.as_ref().map(|d| d.dispatch_id.as_str()), Some("dsp-1"));
        assert_eq!(rows[1].status, NodeRunStatus::Running);

        let stale = NodeRun::running(run_id, "a", 1, serde_json::json!({}));
        assert!(store.insert_node_run(&stale).await.is_err());
    }

    #[tokio::test]
    async fn test_register_counts_hits() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.register("run-1", "dsp-1").await.unwrap());
        assert!(!store.register("run-1", "dsp-1").await.unwrap());
        assert!(!store.register("run-1", "dsp-1").await.unwrap());
        assert!(store.register("run-1", "dsp-1/workspace").await.unwrap());

        let rec = store.lookup("run-1", "dsp-1").await.unwrap().unwrap();
        assert_eq!(rec.hit_count, 3);
        assert!(rec.last_seen_at >= rec.first_seen_at);
        assert!(store.lookup("run-1", "nope").await.unwrap().is_none());
    }
}
