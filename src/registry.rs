//! The per-node statement diagnostics registry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::catalog::{single_row, CatalogError, SqlExecutor, SqlValue};
use crate::error::Error;
use crate::gossip::{
    decode_request_id, encode_request_id, Gossip, GOSSIP_CANCEL_KEY, GOSSIP_KEY_PREFIX,
    GOSSIP_REQUEST_KEY,
};
use crate::index::IndexState;
use crate::poller;
use crate::request::{validate_request, CollectedId, Request, RequestId};
use crate::settings::RegistrySettings;
use crate::time::{SystemWallClock, WallClockSource, WallTime};
use crate::version::VersionGate;

/// Maintains this node's view of the statement fingerprints on which
/// diagnostics are to be collected, answers the executor's "should I trace
/// this?" question, and persists completed collections.
///
/// One registry per node, constructed at startup and shared with every
/// executor. The index mutex is never held across catalog statements or
/// gossip broadcasts; it would deadlock against the completion writer.
pub struct Registry {
    index: Mutex<IndexState>,
    settings: Arc<RegistrySettings>,
    catalog: Arc<dyn SqlExecutor>,
    gossip: Option<Arc<dyn Gossip>>,
    version: Arc<dyn VersionGate>,
    clock: Arc<dyn WallClockSource>,
    /// Gossip callbacks push ids here without blocking; the poller drains.
    gossip_update_rx: Receiver<RequestId>,
    gossip_cancel_rx: Receiver<RequestId>,
}

impl Registry {
    pub fn new(
        catalog: Arc<dyn SqlExecutor>,
        gossip: Option<Arc<dyn Gossip>>,
        settings: Arc<RegistrySettings>,
        version: Arc<dyn VersionGate>,
    ) -> Arc<Registry> {
        Self::with_clock(catalog, gossip, settings, version, Arc::new(SystemWallClock))
    }

    pub fn with_clock(
        catalog: Arc<dyn SqlExecutor>,
        gossip: Option<Arc<dyn Gossip>>,
        settings: Arc<RegistrySettings>,
        version: Arc<dyn VersionGate>,
        clock: Arc<dyn WallClockSource>,
    ) -> Arc<Registry> {
        let (update_tx, update_rx) = bounded(1);
        let (cancel_tx, cancel_rx) = bounded(1);

        // Gossip is absent on nodes without a transport; they fall back to
        // polling only.
        if let Some(transport) = &gossip {
            transport.register_callback(
                GOSSIP_KEY_PREFIX,
                Box::new(move |key, payload| notification(key, payload, &update_tx, &cancel_tx)),
            );
        }

        Arc::new(Registry {
            index: Mutex::new(IndexState::new(clock.now_ms())),
            settings,
            catalog,
            gossip,
            version,
            clock,
            gossip_update_rx: update_rx,
            gossip_cancel_rx: cancel_rx,
        })
    }

    /// Starts the polling loop on its own thread. The loop exits when
    /// `shutdown` receives a message or its sender is dropped.
    pub fn start(self: &Arc<Self>, shutdown: Receiver<()>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        std::thread::spawn(move || poller::run(registry, shutdown))
    }

    pub fn settings(&self) -> &Arc<RegistrySettings> {
        &self.settings
    }

    /// Registers a request to trace a coming execution of `fingerprint`.
    ///
    /// On success the id is already visible in the local index; other
    /// nodes learn about it via gossip or their next poll.
    pub fn insert_request(
        &self,
        fingerprint: &str,
        sampling_probability: f64,
        min_execution_latency: Duration,
        expires_after: Duration,
    ) -> Result<RequestId, Error> {
        if sampling_probability != 0.0 && !self.version.is_sampling_probability_supported() {
            return Err(Error::SamplingProbabilityUnsupported);
        }
        validate_request(sampling_probability, min_execution_latency)?;

        let now = self.now();
        let expires_at = if expires_after.is_zero() {
            None
        } else {
            Some(now.saturating_add(expires_after))
        };

        let mut req_id = None;
        self.catalog.txn("stmt-diag-insert-request", &mut |txn| {
            let row = single_row(
                "stmt-diag-check-pending",
                txn.query(
                    "stmt-diag-check-pending",
                    "SELECT count(1) FROM system.statement_diagnostics_requests \
                     WHERE completed = false AND statement_fingerprint = $1 \
                     AND (expires_at IS NULL OR expires_at > now())",
                    &[SqlValue::String(fingerprint.to_string())],
                )?,
            )?;
            if row.col(0).as_int().unwrap_or(0) != 0 {
                return Err(Error::PendingRequestExists {
                    fingerprint: fingerprint.to_string(),
                });
            }

            let mut columns = vec!["statement_fingerprint", "requested_at"];
            let mut args = vec![
                SqlValue::String(fingerprint.to_string()),
                SqlValue::Timestamp(now),
            ];
            if sampling_probability != 0.0 {
                columns.push("sampling_probability");
                args.push(SqlValue::Float(sampling_probability));
            }
            if !min_execution_latency.is_zero() {
                columns.push("min_execution_latency");
                args.push(SqlValue::Duration(min_execution_latency));
            }
            if let Some(expires_at) = expires_at {
                columns.push("expires_at");
                args.push(SqlValue::Timestamp(expires_at));
            }
            let placeholders = (1..=args.len())
                .map(|i| format!("${i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let stmt = format!(
                "INSERT INTO system.statement_diagnostics_requests ({}) \
                 VALUES ({}) RETURNING id",
                columns.join(", "),
                placeholders,
            );
            let row = single_row(
                "stmt-diag-insert-request",
                txn.query("stmt-diag-insert-request", &stmt, &args)?,
            )?;
            req_id = row.col(0).as_int().map(RequestId);
            Ok(())
        })?;
        let id = req_id.ok_or(CatalogError::MalformedRow {
            op: "stmt-diag-insert-request",
        })?;

        // Add locally right away so this node can pick up the request
        // before its next poll. The epoch bump keeps a poll that raced the
        // insert from erasing it.
        {
            let mut index = self.lock_index();
            index.bump_epoch();
            index.add_if_absent(
                id,
                Request {
                    fingerprint: fingerprint.to_string(),
                    sampling_probability,
                    min_execution_latency,
                    expires_at,
                },
                now,
            );
        }

        self.broadcast(GOSSIP_REQUEST_KEY, id);
        Ok(id)
    }

    /// Cancels a pending request.
    ///
    /// The row is expired in the past rather than deleted, so a trace
    /// already in flight on some node can still write its bundle.
    pub fn cancel_request(&self, id: RequestId) -> Result<(), Error> {
        let rows = self.catalog.query(
            "stmt-diag-cancel-request",
            "UPDATE system.statement_diagnostics_requests SET expires_at = $1 \
             WHERE completed = false AND id = $2 \
             AND (expires_at IS NULL OR expires_at > now()) RETURNING id",
            &[SqlValue::Timestamp(WallTime::EPOCH), SqlValue::Int(id.0)],
        )?;
        if rows.is_empty() {
            return Err(Error::NoPendingRequest { id });
        }

        self.lock_index().cancel(id);
        self.broadcast(GOSSIP_CANCEL_KEY, id);
        Ok(())
    }

    /// Hot-path hook, called on every statement execution.
    ///
    /// Returns the request to trace under, if any. A caller that got
    /// `Some` must follow up with either `insert_statement_diagnostics` or
    /// `remove_ongoing` (`is_exec_latency_condition_met` inlines the
    /// latter when it returns false).
    pub fn should_collect_diagnostics(&self, fingerprint: &str) -> Option<(RequestId, Request)> {
        let now = self.now();
        self.lock_index().match_and_admit(fingerprint, now)
    }

    /// For conditional requests: whether the observed latency clears the
    /// request's gate. A false return has already released the admission.
    pub fn is_exec_latency_condition_met(
        &self,
        id: RequestId,
        req: &Request,
        exec_latency: Duration,
    ) -> bool {
        if req.min_execution_latency <= exec_latency {
            return true;
        }
        let now = self.now();
        if req.is_expired(now) {
            self.lock_index().remove_ongoing(id, req, now);
        }
        false
    }

    /// Releases an admission that will not reach the completion writer.
    pub fn remove_ongoing(&self, id: RequestId, req: &Request) {
        let now = self.now();
        self.lock_index().remove_ongoing(id, req, now);
    }

    /// Persists one collected diagnostic in a single catalog transaction:
    /// the chunked bundle, the diagnostics row, and the completion mark on
    /// the parent request.
    ///
    /// With a request id, first checks that no other node completed the
    /// request; the loser of that race returns `Ok(None)` and writes
    /// nothing. Without one, records an ad-hoc collection together with a
    /// synthetic already-completed request row.
    pub fn insert_statement_diagnostics(
        &self,
        request_id: Option<RequestId>,
        fingerprint: &str,
        statement: &str,
        bundle: &[u8],
        collection_error: Option<&str>,
    ) -> Result<Option<CollectedId>, Error> {
        let chunk_size = self.settings.bundle_chunk_size() as usize;
        let collected_at = self.now();

        let mut diag_id = None;
        self.catalog.txn("stmt-diag-insert", &mut |txn| {
            if let Some(id) = request_id {
                let row = single_row(
                    "stmt-diag-check-completed",
                    txn.query(
                        "stmt-diag-check-completed",
                        "SELECT count(1) FROM system.statement_diagnostics_requests \
                         WHERE id = $1 AND completed = false",
                        &[SqlValue::Int(id.0)],
                    )?,
                )?;
                if row.col(0).as_int().unwrap_or(0) == 0 {
                    // Another node satisfied the request first; drop the
                    // bundle without writing anything.
                    return Ok(());
                }
            }

            let mut chunk_ids = Vec::new();
            for chunk in bundle.chunks(chunk_size) {
                let row = single_row(
                    "stmt-bundle-chunks-insert",
                    txn.query(
                        "stmt-bundle-chunks-insert",
                        "INSERT INTO system.statement_bundle_chunks (description, data) \
                         VALUES ($1, $2) RETURNING id",
                        &[
                            SqlValue::String("statement diagnostics bundle".to_string()),
                            SqlValue::Bytes(chunk.to_vec()),
                        ],
                    )?,
                )?;
                let chunk_id = row.col(0).as_int().ok_or(CatalogError::MalformedRow {
                    op: "stmt-bundle-chunks-insert",
                })?;
                chunk_ids.push(chunk_id);
            }

            let error_val = match collection_error {
                Some(err) => SqlValue::String(err.to_string()),
                None => SqlValue::Null,
            };
            let row = single_row(
                "stmt-diag-insert",
                txn.query(
                    "stmt-diag-insert",
                    "INSERT INTO system.statement_diagnostics \
                     (statement_fingerprint, statement, collected_at, bundle_chunks, error) \
                     VALUES ($1, $2, $3, $4, $5) RETURNING id",
                    &[
                        SqlValue::String(fingerprint.to_string()),
                        SqlValue::String(statement.to_string()),
                        SqlValue::Timestamp(collected_at),
                        SqlValue::IntArray(chunk_ids.clone()),
                        error_val,
                    ],
                )?,
            )?;
            let id = row.col(0).as_int().ok_or(CatalogError::MalformedRow {
                op: "stmt-diag-insert",
            })?;
            diag_id = Some(CollectedId(id));

            match request_id {
                Some(req_id) => {
                    txn.exec(
                        "stmt-diag-mark-completed",
                        "UPDATE system.statement_diagnostics_requests \
                         SET completed = true, statement_diagnostics_id = $1 WHERE id = $2",
                        &[SqlValue::Int(id), SqlValue::Int(req_id.0)],
                    )?;
                }
                None => {
                    // The UI discovers every diagnostic through the
                    // requests table, so ad-hoc collections get a
                    // pre-completed row.
                    txn.exec(
                        "stmt-diag-add-completed",
                        "INSERT INTO system.statement_diagnostics_requests \
                         (completed, statement_fingerprint, statement_diagnostics_id, \
                         requested_at) VALUES (true, $1, $2, $3)",
                        &[
                            SqlValue::String(fingerprint.to_string()),
                            SqlValue::Int(id),
                            SqlValue::Timestamp(collected_at),
                        ],
                    )?;
                }
            }
            Ok(())
        })?;
        Ok(diag_id)
    }

    /// Reconciles the local index against the requests table.
    pub(crate) fn poll_requests(&self) -> Result<(), CatalogError> {
        let include_sampling = self.version.is_sampling_probability_supported();

        // Loop until the read lands without straddling an epoch bump.
        loop {
            let epoch_before = self.lock_index().epoch();

            let extra = if include_sampling {
                ", sampling_probability"
            } else {
                ""
            };
            let stmt = format!(
                "SELECT id, statement_fingerprint, min_execution_latency, expires_at{extra} \
                 FROM system.statement_diagnostics_requests \
                 WHERE completed = false AND (expires_at IS NULL OR expires_at > now())"
            );
            let rows = self.catalog.query("stmt-diag-poll", &stmt, &[])?;

            let mut parsed = Vec::with_capacity(rows.len());
            for row in &rows {
                let id = row.col(0).as_int().ok_or(CatalogError::MalformedRow {
                    op: "stmt-diag-poll",
                })?;
                let fingerprint = row
                    .col(1)
                    .as_str()
                    .ok_or(CatalogError::MalformedRow {
                        op: "stmt-diag-poll",
                    })?
                    .to_string();
                let min_execution_latency = row.col(2).as_duration().unwrap_or_default();
                let expires_at = row.col(3).as_timestamp();
                let sampling_probability = if include_sampling {
                    row.col(4).as_float().unwrap_or(0.0)
                } else {
                    0.0
                };
                parsed.push((
                    RequestId(id),
                    Request {
                        fingerprint,
                        sampling_probability,
                        min_execution_latency,
                        expires_at,
                    },
                ));
            }

            let mut index = self.lock_index();
            // A request inserted locally while the read ran would be
            // missing from this snapshot; processing it would drop that
            // request. Read again instead.
            if index.epoch() != epoch_before {
                continue;
            }

            let now = self.now();
            let mut seen = HashSet::with_capacity(parsed.len());
            for (id, req) in parsed {
                seen.insert(id);
                index.add_if_absent(id, req, now);
            }
            index.retain_polled(&seen, now);
            return Ok(());
        }
    }

    pub(crate) fn find_request(&self, id: RequestId) -> bool {
        let now = self.now();
        self.lock_index().find(id, now)
    }

    pub(crate) fn cancel_request_locally(&self, id: RequestId) {
        self.lock_index().cancel(id);
    }

    pub(crate) fn gossip_update_rx(&self) -> Receiver<RequestId> {
        self.gossip_update_rx.clone()
    }

    pub(crate) fn gossip_cancel_rx(&self) -> Receiver<RequestId> {
        self.gossip_cancel_rx.clone()
    }

    fn now(&self) -> WallTime {
        self.clock.now()
    }

    fn lock_index(&self) -> MutexGuard<'_, IndexState> {
        self.index.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Best-effort: failures are logged and the poller backstops delivery.
    fn broadcast(&self, key: &'static str, id: RequestId) {
        let Some(transport) = &self.gossip else {
            return;
        };
        let payload = encode_request_id(id);
        if let Err(err) = transport.broadcast(key, &payload, Duration::ZERO) {
            tracing::warn!(%err, key, %id, "failed to notify cluster of diagnostics request");
        }
    }
}

/// Runs on the gossip transport's thread: forward without ever blocking.
/// A full channel drops the notification; the poller re-reads the catalog
/// on its own schedule anyway.
fn notification(
    key: &str,
    payload: &[u8],
    update_tx: &Sender<RequestId>,
    cancel_tx: &Sender<RequestId>,
) {
    let Some(id) = decode_request_id(payload) else {
        tracing::debug!(key, len = payload.len(), "ignoring malformed diagnostics payload");
        return;
    };
    match key {
        GOSSIP_REQUEST_KEY => {
            let _ = update_tx.try_send(id);
        }
        GOSSIP_CANCEL_KEY => {
            let _ = cancel_tx.try_send(id);
        }
        // Unknown keys under the prefix may come from newer versions.
        _ => {}
    }
}
