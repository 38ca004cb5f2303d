//! Organization settings read from the `[organizations.<id>]` config tables.

use async_trait::async_trait;
use std::collections::HashMap;

use ritmo_core::config::{parse_time_of_day, OrganizationConfig, RitmoConfig};
use ritmo_core::error::Result;
use ritmo_core::traits::OrgDirectory;
use ritmo_core::types::SendWindow;

/// Send window for organizations that do not configure one.
const DEFAULT_WINDOW_START: &str = "08:00";
const DEFAULT_WINDOW_END: &str = "20:00";

/// `OrgDirectory` backed by static configuration. Unknown organizations get
/// the calendar's default timezone and the default send window.
#[derive(Debug, Clone)]
pub struct ConfigOrgDirectory {
    default_timezone: String,
    organizations: HashMap<String, OrganizationConfig>,
}

impl ConfigOrgDirectory {
    pub fn from_config(config: &RitmoConfig) -> Self {
        Self {
            default_timezone: config.calendar.default_timezone.clone(),
            organizations: config.organizations.clone(),
        }
    }
}

#[async_trait]
impl OrgDirectory for ConfigOrgDirectory {
    async fn org_timezone(&self, org_id: &str) -> Result<String> {
        Ok(self
            .organizations
            .get(org_id)
            .and_then(|o| o.timezone.clone())
            .unwrap_or_else(|| self.default_timezone.clone()))
    }

    async fn send_window(&self, org_id: &str) -> Result<SendWindow> {
        let org = self.organizations.get(org_id);
        let start = org
            .and_then(|o| o.send_window_start.as_deref())
            .unwrap_or(DEFAULT_WINDOW_START);
        let end = org
            .and_then(|o| o.send_window_end.as_deref())
            .unwrap_or(DEFAULT_WINDOW_END);
        Ok(SendWindow {
            start: parse_time_of_day(start)?,
            end: parse_time_of_day(end)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn directory() -> ConfigOrgDirectory {
        let mut config = RitmoConfig::default();
        config.organizations.insert(
            "acme".into(),
            OrganizationConfig {
                timezone: Some("Asia/Tokyo".into()),
                send_window_start: Some("08:30".into()),
                send_window_end: Some("18:00".into()),
            },
        );
        ConfigOrgDirectory::from_config(&config)
    }

    #[tokio::test]
    async fn test_known_org() {
        let dir = directory();
        assert_eq!(dir.org_timezone("acme").await.unwrap(), "Asia/Tokyo");
        let window = dir.send_window("acme").await.unwrap();
        assert_eq!(window.start, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(window.end, NaiveTime::from_hms_opt(18, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_unknown_org_uses_defaults() {
        let dir = directory();
        assert_eq!(dir.org_timezone("other").await.unwrap(), "Europe/Lisbon");
        let window = dir.send_window("other").await.unwrap();
        assert_eq!(window.start, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(window.end, NaiveTime::from_hms_opt(20, 0, 0).unwrap());
    }
}
