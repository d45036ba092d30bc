//! In-memory catalog and gossip implementations.
//!
//! Deterministic stand-ins for the injected collaborators, used by the
//! crate's tests and local demos. The catalog keeps the three system
//! tables in memory with commit-or-discard transactions and dispatches on
//! the stable statement op names; the gossip network fans broadcasts out
//! to every registered node synchronously.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::catalog::{CatalogError, SqlExecutor, SqlRow, SqlTxn, SqlValue};
use crate::error::Error;
use crate::gossip::{Gossip, GossipCallback, GossipError};
use crate::time::{WallClockSource, WallTime};

/// Manually advanced wall clock.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(AtomicU64::new(start_ms))
    }

    pub fn advance(&self, d: Duration) {
        self.0.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }
}

impl WallClockSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestRow {
    pub id: i64,
    pub fingerprint: String,
    pub min_execution_latency: Option<Duration>,
    pub expires_at: Option<WallTime>,
    pub sampling_probability: Option<f64>,
    pub completed: bool,
    pub statement_diagnostics_id: Option<i64>,
    pub requested_at: WallTime,
}

impl RequestRow {
    fn is_pending(&self, now: WallTime) -> bool {
        !self.completed && self.expires_at.map_or(true, |e| e > now)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticsRow {
    pub id: i64,
    pub statement_fingerprint: String,
    pub statement: String,
    pub collected_at: WallTime,
    pub bundle_chunks: Vec<i64>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkRow {
    pub id: i64,
    pub description: String,
    pub data: Vec<u8>,
}

/// The three system tables backing the registry.
#[derive(Clone, Debug, Default)]
pub struct Tables {
    pub requests: Vec<RequestRow>,
    pub diagnostics: Vec<DiagnosticsRow>,
    pub chunks: Vec<ChunkRow>,
    next_request_id: i64,
    next_diagnostics_id: i64,
    next_chunk_id: i64,
}

impl Tables {
    pub fn request(&self, id: i64) -> Option<&RequestRow> {
        self.requests.iter().find(|row| row.id == id)
    }

    pub fn diagnostic(&self, id: i64) -> Option<&DiagnosticsRow> {
        self.diagnostics.iter().find(|row| row.id == id)
    }

    pub fn chunk(&self, id: i64) -> Option<&ChunkRow> {
        self.chunks.iter().find(|row| row.id == id)
    }
}

/// In-memory catalog shared by every node of a test cluster. The table
/// mutex is held for the whole transaction closure, which makes
/// transactions serializable the way the real catalog's are.
pub struct MemCatalog {
    tables: Mutex<Tables>,
    clock: Arc<dyn WallClockSource>,
    unavailable: AtomicBool,
}

impl MemCatalog {
    pub fn new(clock: Arc<dyn WallClockSource>) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            clock,
            unavailable: AtomicBool::new(false),
        })
    }

    /// While set, every statement fails with `CatalogError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// A snapshot of the tables for assertions.
    pub fn tables(&self) -> Tables {
        self.lock_tables().clone()
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn check_available(&self, op: &'static str) -> Result<(), CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable {
                op,
                message: "injected outage".to_string(),
            });
        }
        Ok(())
    }
}

impl SqlExecutor for MemCatalog {
    fn query(
        &self,
        op: &'static str,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Vec<SqlRow>, CatalogError> {
        self.check_available(op)?;
        let mut tables = self.lock_tables();
        apply(&mut tables, self.clock.now(), op, stmt, args)
    }

    fn txn(
        &self,
        op: &'static str,
        body: &mut dyn FnMut(&mut dyn SqlTxn) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.check_available(op)?;
        let mut tables = self.lock_tables();
        let mut staged = tables.clone();
        let mut txn = MemTxn {
            tables: &mut staged,
            clock: self.clock.as_ref(),
        };
        body(&mut txn)?;
        *tables = staged;
        Ok(())
    }
}

struct MemTxn<'a> {
    tables: &'a mut Tables,
    clock: &'a dyn WallClockSource,
}

impl SqlTxn for MemTxn<'_> {
    fn query(
        &mut self,
        op: &'static str,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Vec<SqlRow>, CatalogError> {
        apply(self.tables, self.clock.now(), op, stmt, args)
    }

    fn exec(
        &mut self,
        op: &'static str,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<u64, CatalogError> {
        let rows = apply(self.tables, self.clock.now(), op, stmt, args)?;
        Ok(rows.len() as u64)
    }
}

/// Interprets one registry statement against the tables. Statements are
/// recognized by op name; the insert's dynamic column list is read back
/// out of the statement text.
fn apply(
    tables: &mut Tables,
    now: WallTime,
    op: &'static str,
    stmt: &str,
    args: &[SqlValue],
) -> Result<Vec<SqlRow>, CatalogError> {
    match op {
        "stmt-diag-check-pending" => {
            let fingerprint = str_arg(op, args, 0)?;
            let count = tables
                .requests
                .iter()
                .filter(|row| row.fingerprint == fingerprint && row.is_pending(now))
                .count();
            Ok(vec![SqlRow(vec![SqlValue::Int(count as i64)])])
        }
        "stmt-diag-insert-request" => {
            tables.next_request_id += 1;
            let mut row = RequestRow {
                id: tables.next_request_id,
                fingerprint: String::new(),
                min_execution_latency: None,
                expires_at: None,
                sampling_probability: None,
                completed: false,
                statement_diagnostics_id: None,
                requested_at: now,
            };
            for (column, arg) in insert_columns(stmt).into_iter().zip(args) {
                match column {
                    "statement_fingerprint" => {
                        row.fingerprint =
                            arg.as_str().ok_or(malformed(op))?.to_string();
                    }
                    "requested_at" => {
                        row.requested_at = arg.as_timestamp().ok_or(malformed(op))?;
                    }
                    "sampling_probability" => {
                        row.sampling_probability = arg.as_float();
                    }
                    "min_execution_latency" => {
                        row.min_execution_latency = arg.as_duration();
                    }
                    "expires_at" => {
                        row.expires_at = arg.as_timestamp();
                    }
                    _ => return Err(malformed(op)),
                }
            }
            let id = row.id;
            tables.requests.push(row);
            Ok(vec![SqlRow(vec![SqlValue::Int(id)])])
        }
        "stmt-diag-cancel-request" => {
            let expires_at = args
                .first()
                .and_then(SqlValue::as_timestamp)
                .ok_or(malformed(op))?;
            let id = int_arg(op, args, 1)?;
            let mut updated = Vec::new();
            for row in &mut tables.requests {
                if row.id == id && row.is_pending(now) {
                    row.expires_at = Some(expires_at);
                    updated.push(SqlRow(vec![SqlValue::Int(row.id)]));
                }
            }
            Ok(updated)
        }
        "stmt-diag-poll" => {
            let include_sampling = stmt.contains("sampling_probability");
            Ok(tables
                .requests
                .iter()
                .filter(|row| row.is_pending(now))
                .map(|row| {
                    let mut cols = vec![
                        SqlValue::Int(row.id),
                        SqlValue::String(row.fingerprint.clone()),
                        row.min_execution_latency
                            .map_or(SqlValue::Null, SqlValue::Duration),
                        row.expires_at.map_or(SqlValue::Null, SqlValue::Timestamp),
                    ];
                    if include_sampling {
                        cols.push(
                            row.sampling_probability
                                .map_or(SqlValue::Null, SqlValue::Float),
                        );
                    }
                    SqlRow(cols)
                })
                .collect())
        }
        "stmt-diag-check-completed" => {
            let id = int_arg(op, args, 0)?;
            let count = tables
                .requests
                .iter()
                .filter(|row| row.id == id && !row.completed)
                .count();
            Ok(vec![SqlRow(vec![SqlValue::Int(count as i64)])])
        }
        "stmt-bundle-chunks-insert" => {
            tables.next_chunk_id += 1;
            let id = tables.next_chunk_id;
            tables.chunks.push(ChunkRow {
                id,
                description: str_arg(op, args, 0)?.to_string(),
                data: args
                    .get(1)
                    .and_then(SqlValue::as_bytes)
                    .ok_or(malformed(op))?
                    .to_vec(),
            });
            Ok(vec![SqlRow(vec![SqlValue::Int(id)])])
        }
        "stmt-diag-insert" => {
            tables.next_diagnostics_id += 1;
            let id = tables.next_diagnostics_id;
            let bundle_chunks = match args.get(3) {
                Some(SqlValue::IntArray(ids)) => ids.clone(),
                _ => return Err(malformed(op)),
            };
            tables.diagnostics.push(DiagnosticsRow {
                id,
                statement_fingerprint: str_arg(op, args, 0)?.to_string(),
                statement: str_arg(op, args, 1)?.to_string(),
                collected_at: args
                    .get(2)
                    .and_then(SqlValue::as_timestamp)
                    .ok_or(malformed(op))?,
                bundle_chunks,
                error: args.get(4).and_then(SqlValue::as_str).map(str::to_string),
            });
            Ok(vec![SqlRow(vec![SqlValue::Int(id)])])
        }
        "stmt-diag-mark-completed" => {
            let diag_id = int_arg(op, args, 0)?;
            let id = int_arg(op, args, 1)?;
            let mut updated = Vec::new();
            for row in &mut tables.requests {
                if row.id == id {
                    row.completed = true;
                    row.statement_diagnostics_id = Some(diag_id);
                    updated.push(SqlRow(vec![SqlValue::Int(row.id)]));
                }
            }
            Ok(updated)
        }
        "stmt-diag-add-completed" => {
            tables.next_request_id += 1;
            let id = tables.next_request_id;
            tables.requests.push(RequestRow {
                id,
                fingerprint: str_arg(op, args, 0)?.to_string(),
                min_execution_latency: None,
                expires_at: None,
                sampling_probability: None,
                completed: true,
                statement_diagnostics_id: Some(int_arg(op, args, 1)?),
                requested_at: args
                    .get(2)
                    .and_then(SqlValue::as_timestamp)
                    .ok_or(malformed(op))?,
            });
            Ok(vec![SqlRow(vec![SqlValue::Int(id)])])
        }
        _ => Err(CatalogError::Unavailable {
            op,
            message: "unrecognized statement".to_string(),
        }),
    }
}

fn malformed(op: &'static str) -> CatalogError {
    CatalogError::MalformedRow { op }
}

fn str_arg<'a>(
    op: &'static str,
    args: &'a [SqlValue],
    idx: usize,
) -> Result<&'a str, CatalogError> {
    args.get(idx).and_then(SqlValue::as_str).ok_or(malformed(op))
}

fn int_arg(op: &'static str, args: &[SqlValue], idx: usize) -> Result<i64, CatalogError> {
    args.get(idx).and_then(SqlValue::as_int).ok_or(malformed(op))
}

fn insert_columns(stmt: &str) -> Vec<&str> {
    let Some(open) = stmt.find('(') else {
        return Vec::new();
    };
    let Some(close) = stmt[open..].find(')') else {
        return Vec::new();
    };
    stmt[open + 1..open + close].split(',').map(str::trim).collect()
}

/// Synchronous gossip fan-out shared by every node of a test cluster.
/// Broadcasts deliver to all registered callbacks, the sender's included,
/// on the broadcasting thread.
#[derive(Default)]
pub struct GossipNetwork {
    callbacks: Mutex<Vec<(&'static str, GossipCallback)>>,
    down: AtomicBool,
}

impl GossipNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A per-node handle onto this network.
    pub fn node(self: &Arc<Self>) -> Arc<MemGossip> {
        Arc::new(MemGossip {
            network: Arc::clone(self),
        })
    }

    /// While set, broadcasts fail; registered callbacks stay alive.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

pub struct MemGossip {
    network: Arc<GossipNetwork>,
}

impl Gossip for MemGossip {
    fn register_callback(&self, prefix: &'static str, callback: GossipCallback) {
        self.network
            .callbacks
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push((prefix, callback));
    }

    fn broadcast(
        &self,
        key: &'static str,
        payload: &[u8],
        _ttl: Duration,
    ) -> Result<(), GossipError> {
        if self.network.down.load(Ordering::SeqCst) {
            return Err(GossipError::Unavailable {
                message: "network partitioned".to_string(),
            });
        }
        let callbacks = self
            .network
            .callbacks
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        for (prefix, callback) in callbacks.iter() {
            if key.starts_with(prefix) {
                callback(key, payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<MemCatalog> {
        MemCatalog::new(Arc::new(ManualClock::new(1_000_000)))
    }

    #[test]
    fn failed_transaction_discards_every_write() {
        let catalog = catalog();
        let err = catalog.txn("stmt-diag-insert", &mut |txn| {
            txn.query(
                "stmt-bundle-chunks-insert",
                "INSERT INTO system.statement_bundle_chunks (description, data) \
                 VALUES ($1, $2) RETURNING id",
                &[
                    SqlValue::String("statement diagnostics bundle".to_string()),
                    SqlValue::Bytes(vec![1, 2, 3]),
                ],
            )?;
            Err(Error::Catalog(CatalogError::Unavailable {
                op: "stmt-diag-insert",
                message: "boom".to_string(),
            }))
        });
        assert!(err.is_err());
        assert!(catalog.tables().chunks.is_empty());
    }

    #[test]
    fn committed_transaction_keeps_writes() {
        let catalog = catalog();
        catalog
            .txn("stmt-diag-insert", &mut |txn| {
                txn.query(
                    "stmt-bundle-chunks-insert",
                    "INSERT INTO system.statement_bundle_chunks (description, data) \
                     VALUES ($1, $2) RETURNING id",
                    &[
                        SqlValue::String("statement diagnostics bundle".to_string()),
                        SqlValue::Bytes(vec![1, 2, 3]),
                    ],
                )?;
                Ok(())
            })
            .unwrap();
        assert_eq!(catalog.tables().chunks.len(), 1);
    }

    #[test]
    fn insert_column_list_is_read_from_the_statement() {
        assert_eq!(
            insert_columns(
                "INSERT INTO system.statement_diagnostics_requests \
                 (statement_fingerprint, requested_at, expires_at) \
                 VALUES ($1, $2, $3) RETURNING id"
            ),
            vec!["statement_fingerprint", "requested_at", "expires_at"],
        );
    }

    #[test]
    fn broadcast_reaches_every_registered_node() {
        let network = GossipNetwork::new();
        let hits = Arc::new(AtomicU64::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            network.node().register_callback(
                "stmt-diag",
                Box::new(move |_, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        network
            .node()
            .broadcast("stmt-diag-request", &[0; 8], Duration::ZERO)
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        network.set_down(true);
        assert!(network
            .node()
            .broadcast("stmt-diag-request", &[0; 8], Duration::ZERO)
            .is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
