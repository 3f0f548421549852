/**
 * FLEET STORE - Live state of every connected endpoint
 *
 * ROLE :
 * Single owner of per-endpoint state: last reported label, active session,
 * pending kill signal and the stream that owns the entry.
 *
 * HOW IT WORKS :
 * - One mutex around the whole map, every operation is one critical section
 *   covering its full read-modify-write (report, payment, disconnect, snapshot)
 * - Session transitions come from `session::decide`
 * - Durable writes go through `SessionStore`; failures are logged and the
 *   in-memory state stays authoritative
 * - Entries are owned by a `ConnectionId` so a stale stream cannot evict the
 *   stream that replaced it
 */

use crate::billing::{accrued_minutes, fee_for};
use crate::models::{EndpointView, FleetSnapshot, PaymentReceipt, Session};
use crate::session::{decide, Transition};
use crate::store::{SessionStore, SessionUpdate, StoreError};
use nexus_protocol::{normalize_label, CommandResponse, Heartbeat, IDLE_LABEL};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Identifies one accepted stream.
pub type ConnectionId = u64;

#[derive(Debug, Clone)]
struct ActiveSession {
    id: String,
    label: String,
    started_at: OffsetDateTime,
    last_fee: i64,
}

#[derive(Debug)]
struct EndpointEntry {
    last_label: Option<String>,
    active: Option<ActiveSession>,
    pending_kill: bool,
    owner: ConnectionId,
}

impl EndpointEntry {
    fn new(owner: ConnectionId) -> Self {
        Self {
            last_label: None,
            active: None,
            pending_kill: false,
            owner,
        }
    }
}

pub struct FleetStore {
    endpoints: Mutex<HashMap<String, EndpointEntry>>,
    store: Arc<dyn SessionStore>,
    hourly_rate: i64,
    next_conn: AtomicU64,
}

impl FleetStore {
    pub fn new(store: Arc<dyn SessionStore>, hourly_rate: i64) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            store,
            hourly_rate,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn hourly_rate(&self) -> i64 {
        self.hourly_rate
    }

    /// Allocates the id a new stream uses for every later call.
    pub fn attach(&self) -> ConnectionId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connected_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Clears active flags left by a previous run. Call once before serving.
    pub fn recover_stale_sessions(&self) -> Result<usize, StoreError> {
        let closed = self.store.mark_all_active_sessions_inactive()?;
        if closed > 0 {
            info!(closed, "recovered stale active sessions");
        }
        Ok(closed)
    }

    pub fn apply_report(&self, conn: ConnectionId, report: &Heartbeat) -> CommandResponse {
        self.apply_report_at(conn, report, OffsetDateTime::now_utc())
    }

    /// Runs one report through the session state machine and returns the
    /// directive for it. Consumes a pending kill signal.
    pub fn apply_report_at(
        &self,
        conn: ConnectionId,
        report: &Heartbeat,
        now: OffsetDateTime,
    ) -> CommandResponse {
        let endpoint_id = report.pc_id.trim();
        if endpoint_id.is_empty() {
            warn!(conn, "report without endpoint id ignored");
            return CommandResponse::noop();
        }
        let label = normalize_label(&report.current_game);

        let mut endpoints = self.endpoints.lock();
        let entry = endpoints
            .entry(endpoint_id.to_string())
            .or_insert_with(|| EndpointEntry::new(conn));

        if entry.owner != conn {
            info!(endpoint = %endpoint_id, old = entry.owner, new = conn, "endpoint taken over by new stream");
            entry.owner = conn;
        }

        let transition = decide(entry.last_label.as_deref(), &label, entry.active.is_some());
        debug!(
            endpoint = %endpoint_id,
            label = %label,
            reported_at = report.timestamp,
            ?transition,
            "report applied"
        );

        match transition {
            Transition::Start => {
                self.close_active(endpoint_id, entry, now);
                self.open_session(endpoint_id, entry, &label, now);
            }
            Transition::Accrue => {
                if let Some(active) = entry.active.as_mut() {
                    self.accrue(endpoint_id, active, now, false);
                }
            }
            Transition::End { successor } => {
                self.close_active(endpoint_id, entry, now);
                if let Some(next) = successor {
                    self.open_session(endpoint_id, entry, &next, now);
                }
            }
            Transition::Noop => {}
        }

        entry.last_label = Some(label);

        if std::mem::take(&mut entry.pending_kill) {
            info!(endpoint = %endpoint_id, "delivering kill directive");
            CommandResponse::close_active_game()
        } else {
            CommandResponse::noop()
        }
    }

    /// Consistent view of all connected endpoints, sorted by id.
    pub fn snapshot(&self) -> FleetSnapshot {
        let endpoints = self.endpoints.lock();
        let mut ids: Vec<&String> = endpoints.keys().collect();
        ids.sort();

        let views = ids
            .into_iter()
            .filter_map(|id| endpoints.get(id).map(|entry| self.view_of(id, entry)))
            .collect();

        FleetSnapshot {
            generated_at: OffsetDateTime::now_utc(),
            endpoints: views,
        }
    }

    pub fn endpoint_view(&self, endpoint_id: &str) -> Option<EndpointView> {
        let endpoints = self.endpoints.lock();
        endpoints
            .get(endpoint_id.trim())
            .map(|entry| self.view_of(endpoint_id.trim(), entry))
    }

    pub fn mark_paid(&self, endpoint_id: &str) -> Result<PaymentReceipt, StoreError> {
        self.mark_paid_at(endpoint_id, OffsetDateTime::now_utc())
    }

    /// Settles the endpoint's ledger: closes the active session, marks every
    /// unpaid session paid at `now` and queues a kill directive if the
    /// endpoint is connected.
    pub fn mark_paid_at(
        &self,
        endpoint_id: &str,
        now: OffsetDateTime,
    ) -> Result<PaymentReceipt, StoreError> {
        let endpoint_id = endpoint_id.trim();
        let mut endpoints = self.endpoints.lock();

        // read first: a failed read must leave the active session running
        let mut unpaid = self.store.find_unpaid_sessions_by_endpoint(endpoint_id)?;

        let closed = endpoints
            .get_mut(endpoint_id)
            .and_then(|entry| self.close_active(endpoint_id, entry, now));
        if let Some(closed) = closed {
            match unpaid.iter_mut().find(|s| s.id == closed.id) {
                Some(session) => session.fee = closed.last_fee,
                // record was recreated while closing
                None => match self.store.find_unpaid_sessions_by_endpoint(endpoint_id) {
                    Ok(fresh) => unpaid = fresh,
                    Err(e) => warn!(endpoint = %endpoint_id, error = %e, "failed to reload unpaid sessions"),
                },
            }
        }
        let update = SessionUpdate::paid(now);
        let mut sessions_paid = 0;
        let mut total = 0i64;
        for session in &unpaid {
            match self.store.update_session(&session.id, &update) {
                Ok(()) => {
                    sessions_paid += 1;
                    total = total.saturating_add(session.fee);
                }
                Err(e) => warn!(endpoint = %endpoint_id, session = %session.id, error = %e, "failed to mark session paid"),
            }
        }

        let kill_requested = match endpoints.get_mut(endpoint_id) {
            Some(entry) => {
                entry.pending_kill = true;
                true
            }
            None => {
                info!(endpoint = %endpoint_id, "endpoint not connected, kill directive dropped");
                false
            }
        };

        info!(endpoint = %endpoint_id, sessions = sessions_paid, total, "payment recorded");
        Ok(PaymentReceipt {
            endpoint_id: endpoint_id.to_string(),
            paid_at: now,
            sessions_paid,
            total,
            kill_requested,
        })
    }

    pub fn disconnect(&self, endpoint_id: &str, conn: ConnectionId) -> bool {
        self.disconnect_at(endpoint_id, conn, OffsetDateTime::now_utc())
    }

    /// Finalizes the endpoint's session and forgets it, if `conn` still owns
    /// the entry. Returns whether the entry was removed.
    pub fn disconnect_at(&self, endpoint_id: &str, conn: ConnectionId, now: OffsetDateTime) -> bool {
        let mut endpoints = self.endpoints.lock();
        let Some(entry) = endpoints.get_mut(endpoint_id) else {
            return false;
        };
        if entry.owner != conn {
            debug!(endpoint = %endpoint_id, conn, owner = entry.owner, "stale stream closed, entry kept");
            return false;
        }

        self.close_active(endpoint_id, entry, now);
        if entry.pending_kill {
            warn!(endpoint = %endpoint_id, "stream closed with undelivered kill directive");
        }
        endpoints.remove(endpoint_id);
        info!(endpoint = %endpoint_id, "endpoint disconnected");
        true
    }

    fn view_of(&self, endpoint_id: &str, entry: &EndpointEntry) -> EndpointView {
        let sessions = match self.store.find_unpaid_sessions_by_endpoint(endpoint_id) {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(endpoint = %endpoint_id, error = %e, "failed to load unpaid sessions");
                Vec::new()
            }
        };
        let subtotal = sessions.iter().fold(0i64, |acc, s| acc.saturating_add(s.fee));

        EndpointView {
            id: endpoint_id.to_string(),
            current_activity: entry
                .last_label
                .clone()
                .unwrap_or_else(|| IDLE_LABEL.to_string()),
            active_session_id: entry.active.as_ref().map(|a| a.id.clone()),
            sessions,
            subtotal,
        }
    }

    fn open_session(&self, endpoint_id: &str, entry: &mut EndpointEntry, label: &str, now: OffsetDateTime) {
        let session = Session::open(endpoint_id, label, now);
        if let Err(e) = self.store.create_session(&session) {
            warn!(endpoint = %endpoint_id, session = %session.id, error = %e, "failed to record new session");
        }
        info!(endpoint = %endpoint_id, session = %session.id, label = %label, "session started");
        entry.active = Some(ActiveSession {
            id: session.id,
            label: label.to_string(),
            started_at: now,
            last_fee: 0,
        });
    }

    /// Final accrue of the active session, if any. Returns it as closed.
    fn close_active(
        &self,
        endpoint_id: &str,
        entry: &mut EndpointEntry,
        now: OffsetDateTime,
    ) -> Option<ActiveSession> {
        let mut active = entry.active.take()?;
        self.accrue(endpoint_id, &mut active, now, true);
        info!(
            endpoint = %endpoint_id,
            session = %active.id,
            label = %active.label,
            fee = active.last_fee,
            "session ended"
        );
        Some(active)
    }

    /// Recomputes the fee from the session start. The published fee never
    /// goes down.
    fn accrue(&self, endpoint_id: &str, active: &mut ActiveSession, now: OffsetDateTime, closing: bool) {
        let elapsed = now - active.started_at;
        let fee = fee_for(elapsed, self.hourly_rate).max(active.last_fee);
        let minutes = accrued_minutes(elapsed);
        active.last_fee = fee;

        let update = if closing {
            SessionUpdate::close(now, minutes, fee)
        } else {
            SessionUpdate::accrual(now, minutes, fee)
        };

        match self.store.update_session(&active.id, &update) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                warn!(endpoint = %endpoint_id, session = %active.id, "session record missing, recreating");
                let mut session = Session::open(endpoint_id, &active.label, active.started_at);
                session.id = active.id.clone();
                session.end_time = now;
                session.accrued_minutes = minutes;
                session.fee = fee;
                session.is_active = !closing;
                if let Err(e) = self.store.create_session(&session) {
                    warn!(endpoint = %endpoint_id, session = %active.id, error = %e, "failed to recreate session record");
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint_id, session = %active.id, error = %e, "failed to update session record");
            }
        }
    }
}
