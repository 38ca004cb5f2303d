//! Collaborator traits: the narrow interfaces the cadence engine consumes
//! from the surrounding application.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{Contact, SendWindow};

/// Organization settings lookup.
#[async_trait]
pub trait OrgDirectory: Send + Sync {
    /// IANA timezone name, e.g. "Europe/Lisbon".
    async fn org_timezone(&self, org_id: &str) -> Result<String>;

    async fn send_window(&self, org_id: &str) -> Result<SendWindow>;
}

/// Contact lookup for a quote.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contact_for_quote(&self, quote_id: &str) -> Result<Contact>;
}

/// Outbound email delivery.
///
/// `Err(RitmoError::Transport(_))` means the send failed and may be retried.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_templated_email(
        &self,
        template_code: &str,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<()>;
}
