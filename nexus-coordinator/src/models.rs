use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// One continuous billable interval of a single activity on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub endpoint_id: String,
    pub activity_label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    pub accrued_minutes: i64,
    pub fee: i64,
    pub is_active: bool,
    pub is_paid: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub payment_time: Option<OffsetDateTime>,
}

impl Session {
    pub fn open(endpoint_id: &str, activity_label: &str, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint_id: endpoint_id.to_string(),
            activity_label: activity_label.to_string(),
            start_time: now,
            end_time: now,
            accrued_minutes: 0,
            fee: 0,
            is_active: true,
            is_paid: false,
            payment_time: None,
        }
    }
}

/// Display view of one connected endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointView {
    pub id: String,
    pub current_activity: String,
    pub active_session_id: Option<String>,
    /// Unpaid sessions, oldest first.
    pub sessions: Vec<Session>,
    pub subtotal: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub endpoints: Vec<EndpointView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub endpoint_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_at: OffsetDateTime,
    pub sessions_paid: usize,
    pub total: i64,
    /// False when the endpoint was not connected, so no directive was queued.
    pub kill_requested: bool,
}
