//! Cadence generator: turns "quote sent" into the four follow-up events.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

use ritmo_core::config::CadenceConfig;
use ritmo_core::error::Result;
use ritmo_core::types::{BusinessStatus, CancelReason, EventType, Priority};

use crate::calendar::BusinessCalendar;
use crate::persistence::{CadenceDb, EventDraft, RunWrite};

/// Builds and cancels cadence runs.
pub struct CadenceGenerator {
    db: Arc<CadenceDb>,
    calendar: BusinessCalendar,
    config: CadenceConfig,
}

impl CadenceGenerator {
    pub fn new(db: Arc<CadenceDb>, calendar: BusinessCalendar, config: CadenceConfig) -> Self {
        Self {
            db,
            calendar,
            config,
        }
    }

    pub fn calendar(&self) -> &BusinessCalendar {
        &self.calendar
    }

    /// Due dates for one run. Pure; nothing is written.
    ///
    /// Offsets are counted in business days from `sent_at`'s local date, and
    /// only the call carries a priority.
    pub fn plan(&self, sent_at: DateTime<Utc>, value: f64, tz: Tz) -> Result<Vec<EventDraft>> {
        let offsets = &self.config.offsets;
        EventType::ALL
            .iter()
            .map(|&event_type| {
                let days = match event_type {
                    EventType::EmailD1 => offsets.email_d1,
                    EventType::EmailD3 => offsets.email_d3,
                    EventType::CallD7 => offsets.call_d7,
                    EventType::EmailD14 => offsets.email_d14,
                };
                let priority = (event_type == EventType::CallD7).then(|| {
                    if value >= self.config.high_value_threshold {
                        Priority::High
                    } else {
                        Priority::Low
                    }
                });
                Ok(EventDraft {
                    event_type,
                    scheduled_for: self.calendar.add_business_days(sent_at, days, tz)?,
                    priority,
                })
            })
            .collect()
    }

    /// Start a new cadence run for a quote that was just sent (or resent).
    ///
    /// Older still-scheduled events are cancelled as `resent`; the quote
    /// moves to `sent`/`fup_d1` under the new run id. A blank `timezone`
    /// falls back to the calendar default.
    pub fn generate_cadence_events(
        &self,
        quote_id: &str,
        organization_id: &str,
        sent_at: DateTime<Utc>,
        value: f64,
        timezone: &str,
    ) -> Result<RunWrite> {
        self.generate_cadence_events_at(quote_id, organization_id, sent_at, value, timezone, Utc::now())
    }

    pub fn generate_cadence_events_at(
        &self,
        quote_id: &str,
        organization_id: &str,
        sent_at: DateTime<Utc>,
        value: f64,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<RunWrite> {
        let tz = self.calendar.resolve_timezone(timezone)?;
        let drafts = self.plan(sent_at, value, tz)?;
        let run = self
            .db
            .write_cadence_run(quote_id, organization_id, value, sent_at, &drafts, now)?;
        if run.cancelled_previous > 0 {
            tracing::info!(
                "🔁 Quote {quote_id} resent: run {} replaces {} pending event(s)",
                run.run_id,
                run.cancelled_previous
            );
        } else {
            tracing::info!(
                "📅 Quote {quote_id}: cadence run {} scheduled ({} events, tz {tz})",
                run.run_id,
                run.events_created
            );
        }
        Ok(run)
    }

    /// Cancel every still-scheduled event of a quote and stop its cadence.
    pub fn cancel_pending_cadence(&self, quote_id: &str, reason: CancelReason) -> Result<usize> {
        let cancelled = self.db.cancel_pending(quote_id, reason, Utc::now())?;
        tracing::info!("⏹️ Quote {quote_id}: {cancelled} pending event(s) cancelled ({reason})");
        Ok(cancelled)
    }

    /// Record a business status change. Leaving `sent` ends the cadence.
    pub fn on_business_status_change(&self, quote_id: &str, status: BusinessStatus) -> Result<usize> {
        let cancelled = self
            .db
            .change_business_status(quote_id, status, Utc::now())?;
        if !status.is_followable() {
            tracing::info!(
                "⏹️ Quote {quote_id} is now {status}: {cancelled} pending event(s) cancelled"
            );
        }
        Ok(cancelled)
    }
}
