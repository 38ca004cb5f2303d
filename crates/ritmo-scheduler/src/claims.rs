//! Claim processor: one pass = reclaim orphans, claim due events, execute.
//!
//! Every claimed event is re-validated against its quote before acting: a
//! quote that left `sent` cancels its cadence, and an event from an older
//! run is cancelled as `resent`. Events are independent; one failure never
//! aborts the rest of the batch.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use ritmo_core::error::Result;
use ritmo_core::traits::{ContactDirectory, EmailTransport, OrgDirectory};
use ritmo_core::types::{
    CadenceEvent, CancelReason, Contact, EventType, Priority, Quote, RitmoStage, SendWindow,
    TaskKind,
};

use crate::calendar::BusinessCalendar;
use crate::persistence::{CadenceDb, FailureResolution, NewTask, Resolution};

/// Tries at recording a delivered email before leaving the claim held.
const RECORD_SENT_TRIES: u32 = 3;

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Abandoned claims found before claiming (requeued or cancelled).
    pub reclaimed: usize,
    pub claimed: usize,
    pub sent: usize,
    /// Events completed by creating a manual task (including downgrades).
    pub completed: usize,
    pub cancelled: usize,
    /// Events whose automatic send failed this pass.
    pub failed: usize,
    /// Emails held back because the organization's send window is closed.
    pub deferred: usize,
    pub lost_claims: usize,
}

impl PassSummary {
    fn record(&mut self, outcome: &EventOutcome) {
        match outcome {
            EventOutcome::Sent { .. } | EventOutcome::SentUnrecorded => self.sent += 1,
            EventOutcome::TaskCreated { .. } => self.completed += 1,
            EventOutcome::Cancelled(_) => self.cancelled += 1,
            EventOutcome::Retrying { .. } => self.failed += 1,
            EventOutcome::Downgraded { .. } => {
                self.failed += 1;
                self.completed += 1;
            }
            EventOutcome::Deferred { .. } => self.deferred += 1,
            EventOutcome::LostClaim => self.lost_claims += 1,
        }
    }
}

/// What happened to one claimed event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Sent {
        next_stage: Option<RitmoStage>,
    },
    /// Delivered, but the store refused the result; the claim stays held.
    SentUnrecorded,
    TaskCreated {
        kind: TaskKind,
        task_id: String,
        next_stage: Option<RitmoStage>,
    },
    Cancelled(CancelReason),
    /// Send failed; back to `scheduled` for another pass.
    Retrying { attempts: u32 },
    /// Send failed for the last time; a manual task replaces it.
    Downgraded { task_id: String },
    /// Send window closed; due time moved to the next opening.
    Deferred { until: DateTime<Utc> },
    LostClaim,
}

/// Runner identity written to `claimed_by`: `<hostname>:<pid>:<nonce>`.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}:{}:{}", std::process::id(), &nonce[..8])
}

/// Claims due events and executes them.
pub struct ClaimProcessor {
    db: Arc<CadenceDb>,
    calendar: BusinessCalendar,
    orgs: Arc<dyn OrgDirectory>,
    contacts: Arc<dyn ContactDirectory>,
    email: Arc<dyn EmailTransport>,
    worker_id: String,
    max_attempts: u32,
}

impl ClaimProcessor {
    pub fn new(
        db: Arc<CadenceDb>,
        calendar: BusinessCalendar,
        orgs: Arc<dyn OrgDirectory>,
        contacts: Arc<dyn ContactDirectory>,
        email: Arc<dyn EmailTransport>,
    ) -> Self {
        Self {
            db,
            calendar,
            orgs,
            contacts,
            email,
            worker_id: default_worker_id(),
            max_attempts: 3,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one pass against the current time.
    pub async fn run_claim_pass(
        &self,
        batch_size: u32,
        claim_timeout_minutes: u32,
    ) -> Result<PassSummary> {
        self.run_claim_pass_at(Utc::now(), batch_size, claim_timeout_minutes)
            .await
    }

    /// Run one pass as if the clock read `now`.
    pub async fn run_claim_pass_at(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
        claim_timeout_minutes: u32,
    ) -> Result<PassSummary> {
        let mut summary = PassSummary::default();

        let cutoff = now - Duration::minutes(i64::from(claim_timeout_minutes));
        let reclaimed = self.db.reclaim_orphans(cutoff)?;
        summary.reclaimed = reclaimed.total();
        summary.cancelled += reclaimed.cancelled_stale;
        if summary.reclaimed > 0 {
            tracing::warn!(
                "♻️ Reclaimed {} orphaned claim(s) older than {claim_timeout_minutes}m ({} from replaced runs cancelled)",
                summary.reclaimed,
                reclaimed.cancelled_stale
            );
        }

        let events = self.db.claim_due(now, &self.worker_id, batch_size)?;
        summary.claimed = events.len();
        if events.is_empty() {
            tracing::debug!("Claim pass: nothing due");
            return Ok(summary);
        }

        for event in &events {
            let outcome = match self.process_event(event, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Event {} ({}, quote {}) failed: {e}",
                        event.id,
                        event.event_type,
                        event.quote_id
                    );
                    match self.record_failure(event, None, &e.to_string(), now) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            // Claim stays held; reclaimed after the timeout.
                            tracing::error!("❌ Event {}: could not record failure: {e}", event.id);
                            summary.failed += 1;
                            continue;
                        }
                    }
                }
            };
            if outcome == EventOutcome::LostClaim {
                tracing::warn!("Event {}: lost claim, result discarded", event.id);
            }
            summary.record(&outcome);
        }

        tracing::info!(
            "✅ Claim pass: {} claimed, {} sent, {} completed, {} cancelled, {} failed, {} deferred",
            summary.claimed,
            summary.sent,
            summary.completed,
            summary.cancelled,
            summary.failed,
            summary.deferred
        );
        Ok(summary)
    }

    async fn process_event(&self, event: &CadenceEvent, now: DateTime<Utc>) -> Result<EventOutcome> {
        let quote = match self.db.find_quote(&event.quote_id)? {
            Some(q) if q.business_status.is_followable() => q,
            Some(q) => {
                let cancelled =
                    self.db
                        .cancel_for_status_change(&event.id, &self.worker_id, &q.id, now)?;
                if cancelled == 0 {
                    return Ok(EventOutcome::LostClaim);
                }
                tracing::info!(
                    "⏹️ Quote {} is {}: cadence stopped, {cancelled} event(s) cancelled",
                    q.id,
                    q.business_status
                );
                return Ok(EventOutcome::Cancelled(CancelReason::StatusChanged));
            }
            None => {
                return self.cancel(event, CancelReason::StatusChanged);
            }
        };

        if quote.cadence_run_id != event.cadence_run_id {
            tracing::debug!(
                "Event {} belongs to run {} (quote is on run {})",
                event.id,
                event.cadence_run_id,
                quote.cadence_run_id
            );
            return self.cancel(event, CancelReason::Resent);
        }

        if event.event_type == EventType::CallD7 {
            let contact = self.contacts.contact_for_quote(&quote.id).await.ok();
            let task = call_task(&quote, contact.as_ref(), event);
            return self.complete_with_task(event, &task, now);
        }

        let contact = self.contacts.contact_for_quote(&quote.id).await?;
        let Some(recipient) = contact
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        else {
            let task = no_email_task(&quote, &contact, event);
            return self.complete_with_task(event, &task, now);
        };

        let (window, tz) = self.send_window(&quote.organization_id).await?;
        if !window.contains(now.with_timezone(&tz).time()) {
            let until = self.calendar.next_window_opening(&window, now, tz);
            tracing::debug!("Event {}: outside send window, deferred to {until}", event.id);
            return Ok(if self.db.defer_claim(&event.id, &self.worker_id, until)? {
                EventOutcome::Deferred { until }
            } else {
                EventOutcome::LostClaim
            });
        }

        let variables = template_variables(&quote, &contact, event);
        match self
            .email
            .send_templated_email(event.event_type.template_code(), recipient, &variables)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "📧 Quote {}: {} sent to {recipient}",
                    quote.id,
                    event.event_type
                );
                Ok(self.record_sent(event, now).await)
            }
            Err(e) => {
                tracing::warn!("📧 Quote {}: {} not sent: {e}", quote.id, event.event_type);
                self.record_failure(event, Some(&quote), &e.to_string(), now)
            }
        }
    }

    /// Record a delivered email. Store errors are retried, then logged with
    /// the claim left held; they never count as a failed send.
    async fn record_sent(&self, event: &CadenceEvent, now: DateTime<Utc>) -> EventOutcome {
        let mut tries = 0;
        loop {
            tries += 1;
            match self.db.resolve_sent(&event.id, &self.worker_id, now) {
                Ok(Resolution::Applied { next_stage, .. }) => {
                    return EventOutcome::Sent { next_stage };
                }
                Ok(Resolution::LostClaim) => return EventOutcome::LostClaim,
                Err(e) if tries < RECORD_SENT_TRIES => {
                    tracing::warn!("Event {}: recording send failed ({e}), retrying", event.id);
                    tokio::time::sleep(std::time::Duration::from_millis(100 * u64::from(tries)))
                        .await;
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Event {} ({}, quote {}) was delivered but could not be recorded: {e}",
                        event.id,
                        event.event_type,
                        event.quote_id
                    );
                    return EventOutcome::SentUnrecorded;
                }
            }
        }
    }

    fn cancel(&self, event: &CadenceEvent, reason: CancelReason) -> Result<EventOutcome> {
        if self.db.cancel_claimed(&event.id, &self.worker_id, reason)? {
            tracing::info!("Event {} cancelled ({reason})", event.id);
            Ok(EventOutcome::Cancelled(reason))
        } else {
            Ok(EventOutcome::LostClaim)
        }
    }

    fn complete_with_task(
        &self,
        event: &CadenceEvent,
        task: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        match self
            .db
            .resolve_with_task(&event.id, &self.worker_id, task, now)?
        {
            Resolution::Applied {
                next_stage,
                task_id,
            } => {
                tracing::info!(
                    "📋 Quote {}: {} task created for {}",
                    event.quote_id,
                    task.kind.as_str(),
                    event.event_type
                );
                Ok(EventOutcome::TaskCreated {
                    kind: task.kind,
                    task_id: task_id.unwrap_or_default(),
                    next_stage,
                })
            }
            Resolution::LostClaim => Ok(EventOutcome::LostClaim),
        }
    }

    fn record_failure(
        &self,
        event: &CadenceEvent,
        quote: Option<&Quote>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let fallback = failure_task(quote, event, error, self.max_attempts);
        let outcome = self.db.record_send_failure(
            &event.id,
            &self.worker_id,
            error,
            self.max_attempts,
            &fallback,
            now,
        )?;
        Ok(match outcome {
            FailureResolution::Released { attempts } => {
                tracing::info!(
                    "Event {}: attempt {attempts}/{} failed, will retry",
                    event.id,
                    self.max_attempts
                );
                EventOutcome::Retrying { attempts }
            }
            FailureResolution::Downgraded { task_id, .. } => {
                tracing::warn!(
                    "📋 Event {}: giving up after {} attempts, manual task {task_id}",
                    event.id,
                    self.max_attempts
                );
                EventOutcome::Downgraded { task_id }
            }
            FailureResolution::LostClaim => EventOutcome::LostClaim,
        })
    }

    async fn send_window(&self, org_id: &str) -> Result<(SendWindow, Tz)> {
        let window = self.orgs.send_window(org_id).await?;
        let tz = self
            .calendar
            .resolve_timezone(&self.orgs.org_timezone(org_id).await?)?;
        Ok((window, tz))
    }

    // ─── Manual actions ──────────────────────────────────────

    /// Mark an event done by hand; returns the stage the quote moved to.
    pub fn complete_event(&self, event_id: &str) -> Result<Option<RitmoStage>> {
        let next = self.db.complete_event(event_id, Utc::now())?;
        tracing::info!("✅ Event {event_id} completed manually");
        Ok(next)
    }

    pub fn complete_task(&self, task_id: &str) -> Result<Option<RitmoStage>> {
        let next = self.db.complete_task(task_id, Utc::now())?;
        tracing::info!("✅ Task {task_id} completed");
        Ok(next)
    }

    pub fn skip_event(&self, event_id: &str) -> Result<()> {
        self.db.skip_event(event_id, Utc::now())?;
        tracing::info!("⏭️ Event {event_id} skipped");
        Ok(())
    }
}

/// Variables exposed to email templates.
pub fn template_variables(
    quote: &Quote,
    contact: &Contact,
    event: &CadenceEvent,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("quote_id".to_string(), quote.id.clone());
    vars.insert("quote_title".to_string(), quote.title.clone());
    vars.insert("quote_value".to_string(), format!("{:.2}", quote.value));
    vars.insert("contact_name".to_string(), contact.name.clone());
    vars.insert("follow_up".to_string(), event.event_type.as_str().to_string());
    if let Some(sent) = quote.first_sent_at {
        vars.insert("sent_date".to_string(), sent.format("%Y-%m-%d").to_string());
    }
    vars
}

fn task_priority(event: &CadenceEvent) -> Priority {
    event.priority.unwrap_or(Priority::Low)
}

fn contact_label(contact: Option<&Contact>) -> String {
    match contact {
        Some(c) if !c.name.trim().is_empty() => c.name.trim().to_string(),
        _ => "the client".to_string(),
    }
}

fn call_task(quote: &Quote, contact: Option<&Contact>, event: &CadenceEvent) -> NewTask {
    let phone = contact
        .and_then(|c| c.phone.as_deref())
        .filter(|p| !p.trim().is_empty())
        .unwrap_or("not on file");
    NewTask {
        kind: TaskKind::Call,
        title: format!("Call {} about {}", contact_label(contact), quote.title),
        description: format!(
            "Follow-up call for quote {} (value {:.2}). Phone: {phone}",
            quote.title, quote.value
        ),
        priority: task_priority(event),
        due_at: event.scheduled_for,
    }
}

fn no_email_task(quote: &Quote, contact: &Contact, event: &CadenceEvent) -> NewTask {
    NewTask {
        kind: TaskKind::NoEmail,
        title: format!("Contact {} about {}", contact_label(Some(contact)), quote.title),
        description: format!(
            "The {} follow-up could not be emailed: no email address on file.",
            event.event_type
        ),
        priority: task_priority(event),
        due_at: event.scheduled_for,
    }
}

fn failure_task(quote: Option<&Quote>, event: &CadenceEvent, error: &str, max_attempts: u32) -> NewTask {
    let title = quote.map(|q| q.title.as_str()).unwrap_or(event.quote_id.as_str());
    let kind = if event.event_type.is_email() {
        TaskKind::EmailFailed
    } else {
        TaskKind::Call
    };
    NewTask {
        kind,
        title: format!("Follow up on {title} manually"),
        description: format!(
            "Automatic {} failed {max_attempts} time(s). Last error: {error}",
            event.event_type
        ),
        priority: task_priority(event),
        due_at: event.scheduled_for,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadence::CadenceGenerator;
    use async_trait::async_trait;
    use chrono::{NaiveTime, TimeZone};
    use ritmo_core::config::CadenceConfig;
    use ritmo_core::error::RitmoError;
    use ritmo_core::types::{BusinessStatus, EventStatus, SendWindow, TaskStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingEmail {
        sent: Mutex<Vec<(String, String, BTreeMap<String, String>)>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl EmailTransport for RecordingEmail {
        async fn send_templated_email(
            &self,
            template_code: &str,
            recipient: &str,
            variables: &BTreeMap<String, String>,
        ) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RitmoError::Transport("smtp unavailable".into()));
            }
            self.sent.lock().unwrap().push((
                template_code.to_string(),
                recipient.to_string(),
                variables.clone(),
            ));
            Ok(())
        }
    }

    struct FixedOrgs(SendWindow);

    #[async_trait]
    impl OrgDirectory for FixedOrgs {
        async fn org_timezone(&self, _org_id: &str) -> Result<String> {
            Ok("Europe/Lisbon".into())
        }
        async fn send_window(&self, _org_id: &str) -> Result<SendWindow> {
            Ok(self.0)
        }
    }

    struct WindowByOrg(HashMap<String, SendWindow>);

    #[async_trait]
    impl OrgDirectory for WindowByOrg {
        async fn org_timezone(&self, _org_id: &str) -> Result<String> {
            Ok("Europe/Lisbon".into())
        }
        async fn send_window(&self, org_id: &str) -> Result<SendWindow> {
            Ok(self.0.get(org_id).copied().unwrap_or_else(SendWindow::always))
        }
    }

    /// The application closing a deal writes the quote row directly.
    fn set_status(db: &CadenceDb, quote_id: &str, status: BusinessStatus) {
        let mut quote = db.get_quote(quote_id).unwrap();
        quote.business_status = status;
        db.upsert_quote(&quote).unwrap();
    }

    struct Harness {
        db: Arc<CadenceDb>,
        generator: CadenceGenerator,
        email: Arc<RecordingEmail>,
        processor: ClaimProcessor,
    }

    fn harness_with_window(window: SendWindow) -> Harness {
        let db = Arc::new(CadenceDb::open_in_memory().unwrap());
        let email = Arc::new(RecordingEmail::default());
        let generator = CadenceGenerator::new(
            db.clone(),
            BusinessCalendar::default(),
            CadenceConfig::default(),
        );
        let processor = ClaimProcessor::new(
            db.clone(),
            BusinessCalendar::default(),
            Arc::new(FixedOrgs(window)),
            db.clone(),
            email.clone(),
        )
        .with_worker_id("runner-a")
        .with_max_attempts(2);
        Harness {
            db,
            generator,
            email,
            processor,
        }
    }

    fn harness() -> Harness {
        harness_with_window(SendWindow::always())
    }

    fn sent_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap()
    }

    /// 10:00 on the morning `email_d1` is due (Wed 3 Jan 2024).
    fn d1_due() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap()
    }

    fn send_quote(h: &Harness, value: f64, email: Option<&str>) {
        h.db.upsert_quote(&Quote::draft("q1", "org", "ORC-2024-0042", value))
            .unwrap();
        h.db.upsert_contact(
            "q1",
            &Contact {
                name: "Rita Sousa".into(),
                email: email.map(String::from),
                phone: Some("+351 910 000 000".into()),
            },
        )
        .unwrap();
        h.generator
            .generate_cadence_events_at("q1", "org", sent_at(), value, "Europe/Lisbon", sent_at())
            .unwrap();
    }

    #[tokio::test]
    async fn test_due_email_is_sent_and_stage_advances() {
        let h = harness();
        send_quote(&h, 500.0, Some("rita@example.com"));

        let summary = h.processor.run_claim_pass_at(d1_due(), 50, 15).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.sent, 1);

        let sent = h.email.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "followup_d1");
        assert_eq!(sent[0].1, "rita@example.com");
        assert_eq!(sent[0].2.get("quote_title").map(String::as_str), Some("ORC-2024-0042"));

        assert_eq!(h.db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::FupD3);

        // Nothing else due; a second pass is a no-op.
        let again = h.processor.run_claim_pass_at(d1_due(), 50, 15).await.unwrap();
        assert_eq!(again, PassSummary::default());
    }

    #[tokio::test]
    async fn test_missing_email_creates_task() {
        let h = harness();
        send_quote(&h, 500.0, Some("   "));

        let summary = h.processor.run_claim_pass_at(d1_due(), 50, 15).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(h.email.sent.lock().unwrap().is_empty());

        let tasks = h.db.tasks_for_quote("q1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::NoEmail);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(h.db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::FupD3);
    }

    #[tokio::test]
    async fn test_call_creates_high_priority_task() {
        let h = harness();
        send_quote(&h, 2500.0, Some("rita@example.com"));

        // Thu 11 Jan: d1, d3 and the call are all due.
        let now = Utc.with_ymd_and_hms(2024, 1, 11, 10, 0, 0).unwrap();
        let summary = h.processor.run_claim_pass_at(now, 50, 15).await.unwrap();
        assert_eq!(summary.claimed, 3);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.completed, 1);

        let tasks = h.db.tasks_for_quote("q1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::Call);
        assert_eq!(tasks[0].priority, Priority::High);
        assert!(tasks[0].description.contains("+351 910 000 000"));
        assert_eq!(h.db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::FupD14);
    }

    #[tokio::test]
    async fn test_won_quote_cancels_instead_of_sending() {
        let h = harness();
        send_quote(&h, 500.0, Some("rita@example.com"));
        set_status(&h.db, "q1", BusinessStatus::Won);

        let summary = h.processor.run_claim_pass_at(d1_due(), 50, 15).await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert!(h.email.sent.lock().unwrap().is_empty());

        let events = h.db.events_for_quote("q1").unwrap();
        assert!(events.iter().all(|e| e.status == EventStatus::Cancelled
            && e.cancel_reason == Some(CancelReason::StatusChanged)));
        assert_eq!(h.db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::Stopped);
    }

    #[tokio::test]
    async fn test_stale_run_claim_is_cancelled_as_resent() {
        let h = harness();
        send_quote(&h, 500.0, Some("rita@example.com"));

        // A runner that died while holding the run-1 email.
        let stale = h.db.claim_due(d1_due(), "runner-dead", 1).unwrap();
        assert_eq!(stale.len(), 1);
        h.generator
            .generate_cadence_events_at("q1", "org", d1_due(), 500.0, "Europe/Lisbon", d1_due())
            .unwrap();

        let later = d1_due() + Duration::minutes(30);
        let summary = h.processor.run_claim_pass_at(later, 50, 15).await.unwrap();
        assert_eq!(summary.reclaimed, 1);
        assert_eq!(summary.cancelled, 1);
        assert!(h.email.sent.lock().unwrap().is_empty());

        let old = h.db.get_event(&stale[0].id).unwrap();
        assert_eq!(old.status, EventStatus::Cancelled);
        assert_eq!(old.cancel_reason, Some(CancelReason::Resent));
        assert_eq!(h.db.live_run_ids("q1").unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_transport_failure_retries_then_downgrades() {
        let h = harness();
        send_quote(&h, 500.0, Some("rita@example.com"));
        h.email.failing.store(true, Ordering::SeqCst);

        let first = h.processor.run_claim_pass_at(d1_due(), 50, 15).await.unwrap();
        assert_eq!(first.failed, 1);
        let ev = h.db.events_for_quote("q1").unwrap().remove(0);
        assert_eq!(ev.status, EventStatus::Scheduled);
        assert_eq!(ev.attempts, 1);
        assert_eq!(h.db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::FupD1);

        let second = h
            .processor
            .run_claim_pass_at(d1_due() + Duration::minutes(5), 50, 15)
            .await
            .unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(second.completed, 1);
        let ev = h.db.get_event(&ev.id).unwrap();
        assert_eq!(ev.status, EventStatus::Completed);
        let task = h.db.task_for_event(&ev.id).unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::EmailFailed);
        assert!(task.description.contains("smtp unavailable"));
    }

    #[tokio::test]
    async fn test_closed_send_window_defers_without_attempt() {
        let h = harness_with_window(SendWindow {
            start: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        });
        send_quote(&h, 500.0, Some("rita@example.com"));

        let summary = h.processor.run_claim_pass_at(d1_due(), 50, 15).await.unwrap();
        assert_eq!(summary.deferred, 1);
        let ev = h.db.events_for_quote("q1").unwrap().remove(0);
        assert_eq!(ev.status, EventStatus::Scheduled);
        assert_eq!(ev.attempts, 0);
        assert_eq!(ev.scheduled_for, Utc.with_ymd_and_hms(2024, 1, 3, 14, 0, 0).unwrap());

        // Not due again before the window opens.
        let noon = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        assert_eq!(h.processor.run_claim_pass_at(noon, 50, 15).await.unwrap().claimed, 0);

        let afternoon = Utc.with_ymd_and_hms(2024, 1, 3, 15, 0, 0).unwrap();
        let summary = h.processor.run_claim_pass_at(afternoon, 50, 15).await.unwrap();
        assert_eq!(summary.sent, 1);
    }

    #[tokio::test]
    async fn test_closed_window_org_does_not_starve_others() {
        let db = Arc::new(CadenceDb::open_in_memory().unwrap());
        let email = Arc::new(RecordingEmail::default());
        let generator = CadenceGenerator::new(
            db.clone(),
            BusinessCalendar::default(),
            CadenceConfig::default(),
        );
        let mut windows = HashMap::new();
        windows.insert(
            "closed".to_string(),
            SendWindow {
                start: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            },
        );
        let processor = ClaimProcessor::new(
            db.clone(),
            BusinessCalendar::default(),
            Arc::new(WindowByOrg(windows)),
            db.clone(),
            email.clone(),
        )
        .with_worker_id("runner-a");

        for (quote_id, org, sent) in [
            // Sent on New Year's Day: email_d1 falls due a day earlier.
            ("qc", "closed", Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()),
            ("qo", "open", sent_at()),
        ] {
            db.upsert_contact(
                quote_id,
                &Contact {
                    name: "Rita".into(),
                    email: Some(format!("{quote_id}@example.com")),
                    phone: None,
                },
            )
            .unwrap();
            generator
                .generate_cadence_events_at(quote_id, org, sent, 100.0, "Europe/Lisbon", sent)
                .unwrap();
        }

        let mut now = d1_due();
        for _ in 0..3 {
            processor.run_claim_pass_at(now, 1, 15).await.unwrap();
            now += Duration::minutes(1);
        }

        let sent = email.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "qo@example.com");
        let held_back = db.events_for_quote("qc").unwrap().remove(0);
        assert_eq!(held_back.status, EventStatus::Scheduled);
        assert_eq!(
            held_back.scheduled_for,
            Utc.with_ymd_and_hms(2024, 1, 3, 20, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_store_error_after_delivery_does_not_resend() {
        let h = harness();
        send_quote(&h, 500.0, Some("rita@example.com"));
        h.db.execute_raw(
            "CREATE TRIGGER refuse_sent BEFORE UPDATE OF status ON cadence_events
             WHEN NEW.status = 'sent'
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();

        let first = h.processor.run_claim_pass_at(d1_due(), 50, 15).await.unwrap();
        assert_eq!(first.sent, 1);
        assert_eq!(first.failed, 0);

        let ev = h.db.events_for_quote("q1").unwrap().remove(0);
        assert_eq!(ev.status, EventStatus::Claimed);
        assert_eq!(ev.attempts, 0);
        assert!(ev.last_error.is_none());

        let second = h
            .processor
            .run_claim_pass_at(d1_due() + Duration::minutes(5), 50, 15)
            .await
            .unwrap();
        assert_eq!(second.claimed, 0);
        assert_eq!(h.email.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_won_quote_cancels_pending_call_without_task() {
        let h = harness();
        send_quote(&h, 2500.0, Some("rita@example.com"));

        // Fri 5 Jan: both emails go out.
        let friday = Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap();
        assert_eq!(h.processor.run_claim_pass_at(friday, 50, 15).await.unwrap().sent, 2);
        set_status(&h.db, "q1", BusinessStatus::Won);

        // Thu 11 Jan: the call is due but the deal is closed.
        let call_day = Utc.with_ymd_and_hms(2024, 1, 11, 10, 0, 0).unwrap();
        let summary = h.processor.run_claim_pass_at(call_day, 50, 15).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.completed, 0);

        let events = h.db.events_for_quote("q1").unwrap();
        for event_type in [EventType::CallD7, EventType::EmailD14] {
            let ev = events.iter().find(|e| e.event_type == event_type).unwrap();
            assert_eq!(ev.status, EventStatus::Cancelled);
            assert_eq!(ev.cancel_reason, Some(CancelReason::StatusChanged));
            assert!(h.db.task_for_event(&ev.id).unwrap().is_none());
        }
        assert!(h.db.tasks_for_quote("q1").unwrap().is_empty());
        assert_eq!(h.db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::Stopped);
    }

    #[tokio::test]
    async fn test_manual_complete_then_late_send_keeps_stage() {
        let h = harness();
        send_quote(&h, 500.0, Some("rita@example.com"));
        let events = h.db.events_for_quote("q1").unwrap();
        let d3 = events.iter().find(|e| e.event_type == EventType::EmailD3).unwrap();

        assert_eq!(h.processor.complete_event(&d3.id).unwrap(), Some(RitmoStage::FupD7));
        h.processor.run_claim_pass_at(d1_due(), 50, 15).await.unwrap();
        assert_eq!(h.db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::FupD7);
    }

    #[test]
    fn test_worker_id_shape() {
        let id = default_worker_id();
        let parts: Vec<&str> = id.rsplitn(3, ':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1], std::process::id().to_string());
    }
}
