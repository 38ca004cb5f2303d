//! # Ritmo Scheduler
//!
//! Follow-up cadence engine for sent quotes.
//! SQLite persistence, claim-based processing, safe to run on several hosts
//! against the same database file.
//!
//! ## Architecture
//! ```text
//! quote sent ──► CadenceGenerator ──► 4 events (email_d1, email_d3, call_d7, email_d14)
//!                  └── BusinessCalendar: weekends + holidays, org timezone
//!
//! spawn_scheduler (tokio interval)
//!   └── ClaimProcessor::run_claim_pass
//!         ├── reclaim orphaned claims
//!         ├── claim due events (one atomic UPDATE ... RETURNING)
//!         ├── re-check quote: still sent? same run?
//!         ├── email ──► EmailTransport      call / no email ──► FollowUpTask
//!         └── stages::advance (fup_d1 → fup_d3 → fup_d7 → fup_d14 → completed)
//! ```

pub mod cadence;
pub mod calendar;
pub mod claims;
pub mod directory;
pub mod engine;
pub mod persistence;
pub mod stages;

pub use cadence::CadenceGenerator;
pub use calendar::{BusinessCalendar, HolidayTable};
pub use claims::{ClaimProcessor, EventOutcome, PassSummary};
pub use directory::ConfigOrgDirectory;
pub use engine::{LoopSettings, spawn_scheduler};
pub use persistence::CadenceDb;
