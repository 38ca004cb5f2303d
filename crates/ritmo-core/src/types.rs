//! Domain types: quotes, cadence events and the manual tasks they spawn.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RitmoError;

/// Commercial status of a quote, owned by the surrounding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessStatus {
    Draft,
    Sent,
    Negotiation,
    Won,
    Lost,
}

impl BusinessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessStatus::Draft => "draft",
            BusinessStatus::Sent => "sent",
            BusinessStatus::Negotiation => "negotiation",
            BusinessStatus::Won => "won",
            BusinessStatus::Lost => "lost",
        }
    }

    /// Only a quote that is still waiting for an answer gets followed up.
    pub fn is_followable(&self) -> bool {
        matches!(self, BusinessStatus::Sent)
    }
}

impl fmt::Display for BusinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusinessStatus {
    type Err = RitmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(BusinessStatus::Draft),
            "sent" => Ok(BusinessStatus::Sent),
            "negotiation" => Ok(BusinessStatus::Negotiation),
            "won" => Ok(BusinessStatus::Won),
            "lost" => Ok(BusinessStatus::Lost),
            other => Err(RitmoError::Database(format!("unknown business status '{other}'"))),
        }
    }
}

/// Position of a quote in the follow-up sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RitmoStage {
    None,
    FupD1,
    FupD3,
    FupD7,
    FupD14,
    Completed,
    Stopped,
    Paused,
}

impl RitmoStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RitmoStage::None => "none",
            RitmoStage::FupD1 => "fup_d1",
            RitmoStage::FupD3 => "fup_d3",
            RitmoStage::FupD7 => "fup_d7",
            RitmoStage::FupD14 => "fup_d14",
            RitmoStage::Completed => "completed",
            RitmoStage::Stopped => "stopped",
            RitmoStage::Paused => "paused",
        }
    }

    /// Terminal stages accept no further transitions from the cascade.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RitmoStage::Completed | RitmoStage::Stopped | RitmoStage::Paused
        )
    }

    /// Order along the follow-up sequence. `None` for stages off the sequence.
    pub fn sequence_rank(&self) -> Option<u8> {
        match self {
            RitmoStage::None => Some(0),
            RitmoStage::FupD1 => Some(1),
            RitmoStage::FupD3 => Some(2),
            RitmoStage::FupD7 => Some(3),
            RitmoStage::FupD14 => Some(4),
            RitmoStage::Completed => Some(5),
            RitmoStage::Stopped | RitmoStage::Paused => None,
        }
    }
}

impl fmt::Display for RitmoStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RitmoStage {
    type Err = RitmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RitmoStage::None),
            "fup_d1" => Ok(RitmoStage::FupD1),
            "fup_d3" => Ok(RitmoStage::FupD3),
            "fup_d7" => Ok(RitmoStage::FupD7),
            "fup_d14" => Ok(RitmoStage::FupD14),
            "completed" => Ok(RitmoStage::Completed),
            "stopped" => Ok(RitmoStage::Stopped),
            "paused" => Ok(RitmoStage::Paused),
            other => Err(RitmoError::Database(format!("unknown ritmo stage '{other}'"))),
        }
    }
}

/// The four steps of a cadence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EmailD1,
    EmailD3,
    CallD7,
    EmailD14,
}

impl EventType {
    /// All steps, in schedule order.
    pub const ALL: [EventType; 4] = [
        EventType::EmailD1,
        EventType::EmailD3,
        EventType::CallD7,
        EventType::EmailD14,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EmailD1 => "email_d1",
            EventType::EmailD3 => "email_d3",
            EventType::CallD7 => "call_d7",
            EventType::EmailD14 => "email_d14",
        }
    }

    pub fn is_email(&self) -> bool {
        !matches!(self, EventType::CallD7)
    }

    /// Template code handed to the email transport.
    pub fn template_code(&self) -> &'static str {
        match self {
            EventType::EmailD1 => "followup_d1",
            EventType::EmailD3 => "followup_d3",
            EventType::CallD7 => "followup_call_d7",
            EventType::EmailD14 => "followup_d14",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = RitmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_d1" => Ok(EventType::EmailD1),
            "email_d3" => Ok(EventType::EmailD3),
            "call_d7" => Ok(EventType::CallD7),
            "email_d14" => Ok(EventType::EmailD14),
            other => Err(RitmoError::Database(format!("unknown event type '{other}'"))),
        }
    }
}

/// Lifecycle of a cadence event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    Claimed,
    Sent,
    Completed,
    Skipped,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Claimed => "claimed",
            EventStatus::Sent => "sent",
            EventStatus::Completed => "completed",
            EventStatus::Skipped => "skipped",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Scheduled | EventStatus::Claimed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = RitmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(EventStatus::Scheduled),
            "claimed" => Ok(EventStatus::Claimed),
            "sent" => Ok(EventStatus::Sent),
            "completed" => Ok(EventStatus::Completed),
            "skipped" => Ok(EventStatus::Skipped),
            "cancelled" => Ok(EventStatus::Cancelled),
            other => Err(RitmoError::Database(format!("unknown event status '{other}'"))),
        }
    }
}

/// Call priority, derived from the quote value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = RitmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HIGH" => Ok(Priority::High),
            "LOW" => Ok(Priority::Low),
            other => Err(RitmoError::Database(format!("unknown priority '{other}'"))),
        }
    }
}

/// Why an event was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Resent,
    StatusChanged,
    Manual,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Resent => "resent",
            CancelReason::StatusChanged => "status_changed",
            CancelReason::Manual => "manual",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancelReason {
    type Err = RitmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resent" => Ok(CancelReason::Resent),
            "status_changed" => Ok(CancelReason::StatusChanged),
            "manual" => Ok(CancelReason::Manual),
            other => Err(RitmoError::Database(format!("unknown cancel reason '{other}'"))),
        }
    }
}

/// What the salesperson is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Phone the contact (call_d7 step).
    Call,
    /// The contact has no email address; get in touch another way.
    NoEmail,
    /// Automatic sending kept failing; send the follow-up by hand.
    EmailFailed,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Call => "call",
            TaskKind::NoEmail => "no_email",
            TaskKind::EmailFailed => "email_failed",
        }
    }
}

impl FromStr for TaskKind {
    type Err = RitmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(TaskKind::Call),
            "no_email" => Ok(TaskKind::NoEmail),
            "email_failed" => Ok(TaskKind::EmailFailed),
            other => Err(RitmoError::Database(format!("unknown task kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = RitmoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(RitmoError::Database(format!("unknown task status '{other}'"))),
        }
    }
}

/// The subset of a quote the cadence engine reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub organization_id: String,
    /// Human-facing reference, e.g. "ORC-2024-0042".
    pub title: String,
    pub business_status: BusinessStatus,
    pub ritmo_stage: RitmoStage,
    /// Bumped on every send/resend; 0 before the first send.
    pub cadence_run_id: i64,
    /// Set once, on the very first send.
    pub first_sent_at: Option<DateTime<Utc>>,
    pub value: f64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Quote {
    /// A fresh draft quote.
    pub fn draft(id: &str, organization_id: &str, title: &str, value: f64) -> Self {
        Self {
            id: id.to_string(),
            organization_id: organization_id.to_string(),
            title: title.to_string(),
            business_status: BusinessStatus::Draft,
            ritmo_stage: RitmoStage::None,
            cadence_run_id: 0,
            first_sent_at: None,
            value,
            last_activity_at: None,
        }
    }
}

/// One scheduled follow-up action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CadenceEvent {
    pub id: String,
    pub quote_id: String,
    pub organization_id: String,
    pub cadence_run_id: i64,
    pub event_type: EventType,
    pub scheduled_for: DateTime<Utc>,
    pub status: EventStatus,
    /// Only set on call_d7.
    pub priority: Option<Priority>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<CancelReason>,
    /// Failed automatic delivery attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// A manual action surfaced to the salesperson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub id: String,
    pub quote_id: String,
    pub event_id: Option<String>,
    pub kind: TaskKind,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub due_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Contact attached to a quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Contact {
    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }
}

/// Local time-of-day range in which automatic emails may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SendWindow {
    /// Whole-day window.
    pub fn always() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
        }
    }

    /// Inclusive of both ends. A window whose end is before its start wraps
    /// past midnight.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}
