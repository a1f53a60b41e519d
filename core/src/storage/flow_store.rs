use crate::error::{CoreError, CoreResult};
use crate::models::{
    Flow, FlowFilter, FlowQuery, FlowSummary, HeaderList, ResponseBody, ResponseBodyOverride,
    SortKey, MAX_QUERY_LIMIT,
};
use crate::storage::predicate::{self, WhereClause};
use anyhow::{anyhow, Context};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DB_FILE_NAME: &str = "flowscope.sqlite3";
pub const DEFAULT_MAX_ROWS: usize = 50_000;

// Stay under SQLite's default bound-parameter limit when matching id lists.
const MATCH_CHUNK_SIZE: usize = 900;

const SUMMARY_COLUMNS: &str =
    "seq, id, ts, method, url, host, path, status, duration, req_size, resp_size";

const FULL_COLUMNS: &str = "id, ts, method, url, host, path, status, duration, \
     req_headers_json, resp_headers_json, req_size, resp_size, req_body_b64, \
     req_preview, resp_preview";

/// Durable, size-bounded archive of captured flows.
pub struct FlowStore {
    pub(super) db: Arc<Mutex<Connection>>,
    max_rows: usize,
    db_path: PathBuf,
}

impl FlowStore {
    /// Open (or create) the archive inside `base_path`.
    pub fn new(base_path: impl AsRef<Path>, max_rows: usize) -> anyhow::Result<Self> {
        let dir = base_path.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating storage directory {:?}", dir))?;
        }
        let db_path = dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database at {:?}", db_path))?;
        init_schema(&conn)?;

        tracing::info!(
            "Flow store opened at {} (max_rows={})",
            db_path.display(),
            max_rows
        );

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            max_rows: max_rows.max(1),
            db_path,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub(super) async fn with_conn<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Connection) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow!("db mutex poisoned: {}", e))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| anyhow!("storage task failed: {}", e))?
    }

    /// Insert or replace the flow keyed by id and return its sequence number.
    ///
    /// The sequence number survives updates in place. Bound enforcement runs
    /// in the same transaction.
    pub async fn upsert(&self, flow: Flow, body: ResponseBodyOverride) -> CoreResult<i64> {
        let max_rows = self.max_rows;
        let req_headers = serde_json::to_string(&flow.request_headers)
            .context("encoding request headers")?;
        let resp_headers = serde_json::to_string(&flow.response_headers)
            .context("encoding response headers")?;

        let (seq, evicted) = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO flows (
                       id, ts, method, url, host, path, status, duration,
                       req_headers_json, resp_headers_json,
                       req_size, resp_size, req_body_b64,
                       req_preview, resp_preview,
                       resp_body_b64, resp_body_text
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                     ON CONFLICT(id) DO UPDATE SET
                       ts=excluded.ts,
                       method=excluded.method,
                       url=excluded.url,
                       host=excluded.host,
                       path=excluded.path,
                       status=excluded.status,
                       duration=excluded.duration,
                       req_headers_json=excluded.req_headers_json,
                       resp_headers_json=excluded.resp_headers_json,
                       req_size=excluded.req_size,
                       resp_size=excluded.resp_size,
                       req_body_b64=excluded.req_body_b64,
                       req_preview=excluded.req_preview,
                       resp_preview=excluded.resp_preview,
                       resp_body_b64=excluded.resp_body_b64,
                       resp_body_text=excluded.resp_body_text",
                    params![
                        flow.id,
                        flow.timestamp,
                        flow.method,
                        flow.url,
                        flow.host,
                        flow.path,
                        flow.status.map(i64::from),
                        flow.duration,
                        req_headers,
                        resp_headers,
                        flow.request_size as i64,
                        flow.response_size as i64,
                        flow.request_body,
                        flow.request_preview,
                        flow.response_preview,
                        body.body_b64,
                        body.body_text,
                    ],
                )
                .context("upserting flow")?;

                let seq: i64 = tx
                    .query_row("SELECT seq FROM flows WHERE id = ?1", params![flow.id], |row| {
                        row.get(0)
                    })
                    .context("reading flow sequence")?;

                let evicted = enforce_bound(&tx, max_rows)?;
                tx.commit().context("committing flow upsert")?;
                Ok((seq, evicted))
            })
            .await?;

        if evicted > 0 {
            tracing::debug!("Evicted {} oldest flows (max_rows={})", evicted, max_rows);
        }
        Ok(seq)
    }

    /// Paged, sorted listing of flow summaries.
    pub async fn query(&self, query: &FlowQuery) -> CoreResult<Vec<FlowSummary>> {
        let predicate = checked_predicate(&query.filter)?;
        let clause = WhereClause::build(&query.filter);
        let limit = query.limit.clamp(1, MAX_QUERY_LIMIT) as i64;
        let offset = query.offset.min(i64::MAX as u64) as i64;
        let order_by = order_by_sql(query.sort, query.order);

        self.with_conn(move |conn| {
            if let Some(predicate) = &predicate {
                predicate::validate_predicate(conn, predicate)?;
            }

            let sql = format!(
                "SELECT {} FROM flows {} {} LIMIT ? OFFSET ?",
                SUMMARY_COLUMNS,
                clause.sql(),
                order_by
            );
            let mut params = clause.params;
            params.push(Value::from(limit));
            params.push(Value::from(offset));

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| query_error(predicate.as_deref(), e))?;
            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter()))
                .map_err(|e| query_error(predicate.as_deref(), e))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(summary_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Number of rows matching the filter.
    pub async fn count(&self, filter: &FlowFilter) -> CoreResult<u64> {
        let predicate = checked_predicate(filter)?;
        let clause = WhereClause::build(filter);

        self.with_conn(move |conn| {
            if let Some(predicate) = &predicate {
                predicate::validate_predicate(conn, predicate)?;
            }
            let sql = format!("SELECT COUNT(*) FROM flows {}", clause.sql());
            let total: i64 = conn
                .query_row(&sql, rusqlite::params_from_iter(clause.params.iter()), |row| {
                    row.get(0)
                })
                .map_err(|e| query_error(predicate.as_deref(), e))?;
            Ok(total.max(0) as u64)
        })
        .await
    }

    /// Subset of `ids` whose rows satisfy `predicate`, in the caller's order.
    pub async fn match_ids(&self, predicate: &str, ids: Vec<String>) -> CoreResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let predicate = predicate::normalize_predicate(Some(predicate));
        if let Some(p) = &predicate {
            predicate::reject_separator(p)?;
        }

        self.with_conn(move |conn| {
            if let Some(predicate) = &predicate {
                predicate::validate_predicate(conn, predicate)?;
            }

            let mut matched: HashSet<String> = HashSet::new();
            for chunk in ids.chunks(MATCH_CHUNK_SIZE) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = match &predicate {
                    Some(p) => format!(
                        "SELECT id FROM flows WHERE id IN ({placeholders}) AND ({p})"
                    ),
                    None => format!("SELECT id FROM flows WHERE id IN ({placeholders})"),
                };
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| query_error(predicate.as_deref(), e))?;
                let mut rows = stmt
                    .query(rusqlite::params_from_iter(chunk.iter()))
                    .map_err(|e| query_error(predicate.as_deref(), e))?;
                while let Some(row) = rows.next()? {
                    matched.insert(row.get(0)?);
                }
            }

            Ok(ids.into_iter().filter(|id| matched.contains(id)).collect())
        })
        .await
    }

    /// Full flow by id.
    pub async fn get_full(&self, id: &str) -> CoreResult<Option<Flow>> {
        let id_owned = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM flows WHERE id = ?1", FULL_COLUMNS);
            let flow = conn
                .query_row(&sql, params![id_owned], flow_from_row)
                .optional()
                .context("loading flow")?;
            Ok(flow)
        })
        .await
    }

    /// Stored response body, or `None` when absent or never captured.
    pub async fn get_response_body(&self, id: &str) -> CoreResult<Option<ResponseBody>> {
        let id_owned = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT resp_body_b64, resp_headers_json, resp_size FROM flows WHERE id = ?1",
                    params![id_owned],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                        ))
                    },
                )
                .optional()
                .context("loading response body")?;

            let Some((body_b64, headers_json, size)) = row else {
                return Ok(None);
            };
            let Some(body_b64) = body_b64.filter(|b| !b.is_empty()) else {
                return Ok(None);
            };
            let headers = decode_headers(headers_json.as_deref());
            let content_type = crate::models::header_value(&headers, "content-type")
                .map(str::to_string);

            Ok(Some(ResponseBody {
                body_b64,
                content_type,
                bytes: size.unwrap_or(0).max(0) as u64,
            }))
        })
        .await
    }

    /// Delete every flow row. Scope settings are kept.
    pub async fn clear(&self) -> CoreResult<u64> {
        let deleted = self
            .with_conn(|conn| {
                let count = conn
                    .execute("DELETE FROM flows", [])
                    .context("clearing flows")?;
                conn.execute_batch("VACUUM").context("vacuuming after clear")?;
                Ok(count as u64)
            })
            .await?;

        tracing::info!("Cleared {} flows from database", deleted);
        Ok(deleted)
    }

    /// Total stored rows.
    pub async fn total_count(&self) -> CoreResult<u64> {
        self.count(&FlowFilter::default()).await
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Raw SQL against the archive, for tests that need to break it.
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> CoreResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }
}

const PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA temp_store=MEMORY;
    PRAGMA foreign_keys=ON;
";

const FLOWS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        ts REAL NOT NULL,
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        host TEXT,
        path TEXT,
        status INTEGER,
        duration REAL,
        req_headers_json TEXT,
        resp_headers_json TEXT,
        req_size INTEGER,
        resp_size INTEGER,
        req_body_b64 TEXT,
        req_preview TEXT,
        resp_preview TEXT,
        resp_body_b64 TEXT,
        resp_body_text TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_flows_ts ON flows(ts DESC);
    CREATE INDEX IF NOT EXISTS idx_flows_host ON flows(host);
    CREATE INDEX IF NOT EXISTS idx_flows_status ON flows(status);
    CREATE INDEX IF NOT EXISTS idx_flows_method ON flows(method);
";

const STORED_COLUMNS: &str = "id, ts, method, url, host, path, status, duration, \
     req_headers_json, resp_headers_json, req_size, resp_size, req_body_b64, \
     req_preview, resp_preview, resp_body_b64, resp_body_text";

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(PRAGMAS).context("applying pragmas")?;

    let columns = table_columns(conn, "flows")?;
    if !columns.is_empty() && !columns.contains("seq") {
        rebuild_without_seq(conn)?;
    }

    conn.execute_batch(FLOWS_SCHEMA)
        .context("initializing flows schema")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )
    .context("initializing settings schema")?;

    ensure_column(conn, "flows", "resp_body_b64", "TEXT")?;
    ensure_column(conn, "flows", "resp_body_text", "TEXT")?;
    Ok(())
}

/// Move rows from a table keyed only by `id` into the current layout. Rows
/// keep their relative insertion order, so sequence numbers follow it.
fn rebuild_without_seq(conn: &Connection) -> anyhow::Result<()> {
    ensure_column(conn, "flows", "resp_body_b64", "TEXT")?;
    ensure_column(conn, "flows", "resp_body_text", "TEXT")?;

    conn.execute_batch(&format!(
        "BEGIN;
         ALTER TABLE flows RENAME TO flows_legacy;
         DROP INDEX IF EXISTS idx_flows_ts;
         DROP INDEX IF EXISTS idx_flows_host;
         DROP INDEX IF EXISTS idx_flows_status;
         DROP INDEX IF EXISTS idx_flows_method;
         {FLOWS_SCHEMA}
         INSERT INTO flows ({STORED_COLUMNS})
           SELECT {STORED_COLUMNS} FROM flows_legacy ORDER BY rowid;
         DROP TABLE flows_legacy;
         COMMIT;"
    ))
    .context("rebuilding flows table with a sequence column")?;

    let migrated: i64 = conn.query_row("SELECT COUNT(*) FROM flows", [], |row| row.get(0))?;
    tracing::info!("Migrated {} flows to the sequenced layout", migrated);
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(columns)
}

/// Add a column to an existing table when an older database lacks it.
fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> anyhow::Result<()> {
    if table_columns(conn, table)?.contains(column) {
        return Ok(());
    }

    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
        .with_context(|| format!("adding column {table}.{column}"))?;
    tracing::info!("Migrated {}: added column {}", table, column);
    Ok(())
}

/// Delete the oldest flows by timestamp until at most `max_rows` remain.
fn enforce_bound(conn: &Connection, max_rows: usize) -> anyhow::Result<u64> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM flows", [], |row| row.get(0))?;
    let excess = total - max_rows as i64;
    if excess <= 0 {
        return Ok(0);
    }

    let deleted = conn
        .execute(
            "DELETE FROM flows WHERE seq IN (
               SELECT seq FROM flows ORDER BY ts ASC, seq ASC LIMIT ?1
             )",
            params![excess],
        )
        .context("evicting oldest flows")?;
    Ok(deleted as u64)
}

fn checked_predicate(filter: &FlowFilter) -> CoreResult<Option<String>> {
    let predicate = predicate::normalize_predicate(filter.predicate.as_deref());
    if let Some(p) = &predicate {
        predicate::reject_separator(p)?;
    }
    Ok(predicate)
}

fn query_error(predicate: Option<&str>, err: rusqlite::Error) -> CoreError {
    match predicate {
        Some(p) => CoreError::invalid_query(p, err),
        None => CoreError::from(err),
    }
}

fn order_by_sql(sort: SortKey, order: crate::models::SortOrder) -> String {
    let dir = order.as_sql();
    match sort {
        SortKey::Timestamp => format!("ORDER BY ts {dir}, seq {dir}"),
        SortKey::Seq => format!("ORDER BY seq {dir}, ts DESC"),
        SortKey::Method => format!("ORDER BY method {dir}, ts DESC"),
        SortKey::Url => format!("ORDER BY url {dir}, ts DESC"),
        SortKey::ResponseSize => format!("ORDER BY resp_size {dir}, ts DESC"),
        SortKey::Status => format!("ORDER BY status IS NULL DESC, status {dir}, ts DESC"),
        SortKey::Duration => format!("ORDER BY duration IS NULL DESC, duration {dir}, ts DESC"),
    }
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<FlowSummary> {
    Ok(FlowSummary {
        seq: row.get(0)?,
        id: row.get(1)?,
        timestamp: row.get(2)?,
        method: row.get(3)?,
        url: row.get(4)?,
        host: row.get(5)?,
        path: row.get(6)?,
        status: row.get::<_, Option<i64>>(7)?.map(|s| s as u16),
        duration: row.get(8)?,
        request_size: row.get::<_, Option<i64>>(9)?.unwrap_or(0).max(0) as u64,
        response_size: row.get::<_, Option<i64>>(10)?.unwrap_or(0).max(0) as u64,
    })
}

fn flow_from_row(row: &Row<'_>) -> rusqlite::Result<Flow> {
    Ok(Flow {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        method: row.get(2)?,
        url: row.get(3)?,
        host: row.get(4)?,
        path: row.get(5)?,
        status: row.get::<_, Option<i64>>(6)?.map(|s| s as u16),
        duration: row.get(7)?,
        request_headers: decode_headers(row.get::<_, Option<String>>(8)?.as_deref()),
        response_headers: decode_headers(row.get::<_, Option<String>>(9)?.as_deref()),
        request_size: row.get::<_, Option<i64>>(10)?.unwrap_or(0).max(0) as u64,
        response_size: row.get::<_, Option<i64>>(11)?.unwrap_or(0).max(0) as u64,
        request_body: row.get(12)?,
        request_preview: row.get(13)?,
        response_preview: row.get(14)?,
    })
}

/// Lenient decode of a stored header list; malformed entries are skipped.
fn decode_headers(raw: Option<&str>) -> HeaderList {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return Vec::new();
    };
    let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(raw)
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item.as_array().map(Vec::as_slice) {
            Some([key, value]) => Some((key.as_str()?.to_string(), value.as_str()?.to_string())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldFilter, SortOrder};
    use tempfile::tempdir;

    fn sample_flow(id: &str, ts: f64, status: Option<u16>) -> Flow {
        Flow {
            id: id.to_string(),
            timestamp: ts,
            method: "GET".into(),
            url: format!("https://api.example.com/{id}"),
            host: Some("api.example.com".into()),
            path: Some(format!("/{id}")),
            status,
            duration: None,
            request_headers: vec![("Accept".into(), "*/*".into())],
            response_headers: vec![("Content-Type".into(), "application/json".into())],
            request_size: 0,
            response_size: 10,
            request_body: None,
            request_preview: None,
            response_preview: None,
        }
    }

    fn store_in(dir: &tempfile::TempDir, max_rows: usize) -> FlowStore {
        FlowStore::new(dir.path(), max_rows).expect("store initializes")
    }

    fn predicate_query(predicate: &str) -> FlowQuery {
        FlowQuery {
            filter: FlowFilter::predicate(predicate),
            ..FlowQuery::default()
        }
    }

    #[tokio::test]
    async fn upsert_same_id_overwrites_and_keeps_sequence() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);

        store
            .upsert(sample_flow("other", 1.0, Some(200)), Default::default())
            .await
            .expect("upsert other");
        let first = store
            .upsert(sample_flow("a", 2.0, None), Default::default())
            .await
            .expect("first upsert");

        let mut updated = sample_flow("a", 3.0, Some(204));
        updated.method = "POST".into();
        let second = store
            .upsert(updated, Default::default())
            .await
            .expect("second upsert");

        assert_eq!(first, second, "sequence number stable across update");
        assert_eq!(store.total_count().await.unwrap(), 2);

        let flow = store.get_full("a").await.unwrap().expect("flow exists");
        assert_eq!(flow.method, "POST");
        assert_eq!(flow.status, Some(204));
        assert_eq!(flow.timestamp, 3.0);
    }

    #[tokio::test]
    async fn bound_keeps_most_recent_by_timestamp() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 3);

        // Insert out of timestamp order to show eviction is by ts, not insertion.
        for (id, ts) in [("e", 5.0), ("a", 1.0), ("c", 3.0), ("b", 2.0), ("d", 4.0)] {
            store
                .upsert(sample_flow(id, ts, Some(200)), Default::default())
                .await
                .expect("upsert");
        }

        assert_eq!(store.total_count().await.unwrap(), 3);
        let items = store.query(&FlowQuery::default()).await.expect("query");
        let ids: Vec<_> = items.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["e", "d", "c"]);
    }

    #[tokio::test]
    async fn predicate_filters_by_status() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        store
            .upsert(sample_flow("ok", 1.0, Some(200)), Default::default())
            .await
            .unwrap();

        let hits = store.query(&predicate_query("status = 200")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ok");

        let misses = store.query(&predicate_query("status = 404")).await.unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn separator_rejected_before_storage() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);

        let err = store
            .query(&predicate_query("status = 200; DELETE FROM flows"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery { .. }));

        let err = store
            .count(&FlowFilter::predicate("1; DROP TABLE flows"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn malformed_predicate_is_invalid_query() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        let err = store.query(&predicate_query("status ===")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn status_sort_places_nulls_first() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        store
            .upsert(sample_flow("s500", 1.0, Some(500)), Default::default())
            .await
            .unwrap();
        store
            .upsert(sample_flow("pending", 2.0, None), Default::default())
            .await
            .unwrap();
        store
            .upsert(sample_flow("s200", 3.0, Some(200)), Default::default())
            .await
            .unwrap();

        let query = FlowQuery {
            sort: SortKey::Status,
            order: SortOrder::Asc,
            ..FlowQuery::default()
        };
        let ids: Vec<_> = store
            .query(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["pending", "s200", "s500"]);
    }

    #[tokio::test]
    async fn duration_sort_places_nulls_first() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        for (id, ts, duration) in [("slow", 1.0, Some(2.5)), ("open", 2.0, None), ("fast", 3.0, Some(0.1))] {
            let mut flow = sample_flow(id, ts, Some(200));
            flow.duration = duration;
            store.upsert(flow, Default::default()).await.unwrap();
        }

        for (order, expected) in [
            (SortOrder::Asc, vec!["open", "fast", "slow"]),
            (SortOrder::Desc, vec!["open", "slow", "fast"]),
        ] {
            let query = FlowQuery {
                sort: SortKey::Duration,
                order,
                ..FlowQuery::default()
            };
            let ids: Vec<_> = store
                .query(&query)
                .await
                .unwrap()
                .into_iter()
                .map(|s| s.id)
                .collect();
            assert_eq!(ids, expected);
        }
    }

    #[tokio::test]
    async fn table_without_sequence_is_rebuilt() {
        let dir = tempdir().expect("temp dir");
        {
            let conn = Connection::open(dir.path().join(DB_FILE_NAME)).unwrap();
            conn.execute_batch(
                "CREATE TABLE flows (
                   id TEXT PRIMARY KEY, ts REAL NOT NULL, method TEXT NOT NULL,
                   url TEXT NOT NULL, host TEXT, path TEXT, status INTEGER,
                   duration REAL, req_headers_json TEXT, resp_headers_json TEXT,
                   req_size INTEGER, resp_size INTEGER, req_body_b64 TEXT,
                   req_preview TEXT, resp_preview TEXT
                 );
                 CREATE INDEX idx_flows_ts ON flows(ts DESC);
                 INSERT INTO flows (id, ts, method, url, status) VALUES ('first', 5.0, 'GET', 'https://h/1', 200);
                 INSERT INTO flows (id, ts, method, url, status) VALUES ('second', 1.0, 'GET', 'https://h/2', 404);",
            )
            .unwrap();
        }

        let store = store_in(&dir, 100);
        let by_seq = FlowQuery {
            sort: SortKey::Seq,
            order: SortOrder::Asc,
            ..FlowQuery::default()
        };
        let rows = store.query(&by_seq).await.unwrap();
        assert_eq!(
            rows.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert!(rows[0].seq < rows[1].seq);
        assert_eq!(store.count(&FlowFilter::predicate("status = 404")).await.unwrap(), 1);

        let seq = store
            .upsert(sample_flow("third", 9.0, Some(200)), Default::default())
            .await
            .unwrap();
        assert!(seq > rows[1].seq);
    }

    #[tokio::test]
    async fn paging_and_sequence_order() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        for (i, id) in ["x", "y", "z"].iter().enumerate() {
            store
                .upsert(sample_flow(id, 10.0 - i as f64, Some(200)), Default::default())
                .await
                .unwrap();
        }

        let query = FlowQuery {
            limit: 2,
            offset: 1,
            sort: SortKey::Seq,
            order: SortOrder::Asc,
            ..FlowQuery::default()
        };
        let page = store.query(&query).await.unwrap();
        let ids: Vec<_> = page.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["y", "z"]);
        assert!(page[0].seq < page[1].seq);
    }

    #[tokio::test]
    async fn field_filters_search_body_text() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        store
            .upsert(
                sample_flow("with-body", 1.0, Some(200)),
                ResponseBodyOverride {
                    body_b64: Some("eyJ0b2tlbiI6MX0=".into()),
                    body_text: Some("{\"token\":1}".into()),
                },
            )
            .await
            .unwrap();
        store
            .upsert(sample_flow("plain", 2.0, Some(200)), Default::default())
            .await
            .unwrap();

        let filter = FlowFilter {
            predicate: None,
            fields: FieldFilter {
                body_contains: Some("token".into()),
                ..FieldFilter::default()
            },
        };
        assert_eq!(store.count(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn match_ids_short_circuits_and_filters() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        store
            .upsert(sample_flow("a", 1.0, Some(200)), Default::default())
            .await
            .unwrap();
        store
            .upsert(sample_flow("b", 2.0, Some(404)), Default::default())
            .await
            .unwrap();

        // Invalid predicate is never inspected when there is nothing to match.
        assert!(store
            .match_ids("status ===", Vec::new())
            .await
            .unwrap()
            .is_empty());

        let matched = store
            .match_ids(
                "status >= 400",
                vec!["a".into(), "b".into(), "missing".into()],
            )
            .await
            .unwrap();
        assert_eq!(matched, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn response_body_absent_is_none() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        store
            .upsert(sample_flow("nobody", 1.0, Some(200)), Default::default())
            .await
            .unwrap();
        store
            .upsert(
                sample_flow("body", 2.0, Some(200)),
                ResponseBodyOverride {
                    body_b64: Some("aGk=".into()),
                    body_text: Some("hi".into()),
                },
            )
            .await
            .unwrap();

        assert!(store.get_response_body("nobody").await.unwrap().is_none());
        assert!(store.get_response_body("unknown").await.unwrap().is_none());

        let body = store.get_response_body("body").await.unwrap().unwrap();
        assert_eq!(body.body_b64, "aGk=");
        assert_eq!(body.content_type.as_deref(), Some("application/json"));
        assert_eq!(body.bytes, 10);
    }

    #[tokio::test]
    async fn clear_removes_flows() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(&dir, 100);
        store
            .upsert(sample_flow("a", 1.0, Some(200)), Default::default())
            .await
            .unwrap();
        assert_eq!(store.clear().await.unwrap(), 1);
        assert_eq!(store.total_count().await.unwrap(), 0);
        assert!(store.get_full("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reopening_keeps_rows() {
        let dir = tempdir().expect("temp dir");
        {
            let store = store_in(&dir, 100);
            store
                .upsert(sample_flow("durable", 1.0, Some(200)), Default::default())
                .await
                .unwrap();
        }
        let reopened = store_in(&dir, 100);
        assert!(reopened.get_full("durable").await.unwrap().is_some());
    }

    #[test]
    fn decode_headers_skips_malformed_entries() {
        let headers = decode_headers(Some(r#"[["a","1"],["b"],[1,2],"x",["c","3"]]"#));
        assert_eq!(
            headers,
            vec![("a".to_string(), "1".to_string()), ("c".to_string(), "3".to_string())]
        );
        assert!(decode_headers(Some("{}")).is_empty());
        assert!(decode_headers(None).is_empty());
    }
}
