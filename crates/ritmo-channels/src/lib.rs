//! # Ritmo Channels
//! Outbound delivery for follow-up emails.

pub mod email;

pub use email::{EmailTemplate, LogEmailTransport, SmtpEmailTransport, TemplateSet};
