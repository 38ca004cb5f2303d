//! Email channel: templated follow-up emails over SMTP (async lettre).

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use ritmo_core::config::EmailConfig;
use ritmo_core::error::{Result, RitmoError};
use ritmo_core::traits::EmailTransport;

/// Subject and body with `{{variable}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

impl EmailTemplate {
    pub fn new(subject: &str, body: &str) -> Self {
        Self {
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

/// Templates keyed by template code.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, EmailTemplate>,
}

impl TemplateSet {
    /// Built-in copy for the three follow-up emails.
    pub fn builtin() -> Self {
        let mut set = Self::default();
        set.insert(
            "followup_d1",
            EmailTemplate::new(
                "Quote {{quote_title}}",
                "Hello {{contact_name}},\n\n\
                 Just checking that quote {{quote_title}} reached you safely.\n\
                 If anything is unclear, reply to this email and we will sort it out.\n\n\
                 Best regards",
            ),
        );
        set.insert(
            "followup_d3",
            EmailTemplate::new(
                "Any questions about quote {{quote_title}}?",
                "Hello {{contact_name}},\n\n\
                 Have you had a chance to look at quote {{quote_title}} ({{quote_value}})?\n\
                 We are happy to adjust scope or terms if needed.\n\n\
                 Best regards",
            ),
        );
        set.insert(
            "followup_d14",
            EmailTemplate::new(
                "Quote {{quote_title}}: still of interest?",
                "Hello {{contact_name}},\n\n\
                 We sent you quote {{quote_title}} on {{sent_date}} and have not heard back.\n\
                 Should we keep it open, or close it for now?\n\n\
                 Best regards",
            ),
        );
        set
    }

    /// Built-ins overridden by the `[email.templates.<code>]` tables.
    pub fn from_config(config: &EmailConfig) -> Self {
        let mut set = Self::builtin();
        for (code, t) in &config.templates {
            set.insert(code, EmailTemplate::new(&t.subject, &t.body));
        }
        set
    }

    pub fn insert(&mut self, code: &str, template: EmailTemplate) {
        self.templates.insert(code.to_string(), template);
    }

    pub fn get(&self, code: &str) -> Option<&EmailTemplate> {
        self.templates.get(code)
    }

    /// Render `code` into (subject, body).
    pub fn render(
        &self,
        code: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<(String, String)> {
        let template = self
            .get(code)
            .ok_or_else(|| RitmoError::Config(format!("unknown email template '{code}'")))?;
        Ok((
            render_placeholders(&template.subject, variables),
            render_placeholders(&template.body, variables),
        ))
    }
}

/// Replace `{{ name }}` with its value; unknown names render empty.
pub fn render_placeholders(text: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = rest[start + 2..start + 2 + len].trim();
        match variables.get(name) {
            Some(value) => out.push_str(value),
            None => tracing::debug!("template variable '{name}' not provided"),
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

/// SMTP delivery. The transport is built once and pooled by lettre.
pub struct SmtpEmailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    templates: TemplateSet,
}

impl SmtpEmailTransport {
    pub fn new(config: &EmailConfig, templates: TemplateSet) -> Result<Self> {
        if config.smtp_host.trim().is_empty() {
            return Err(RitmoError::Config("email.smtp_host is not set".into()));
        }
        let from_name = config.from_name.as_deref().unwrap_or("Ritmo");
        let from: Mailbox = format!("{from_name} <{}>", config.from_address)
            .parse()
            .map_err(|e| RitmoError::Config(format!("Invalid from address: {e}")))?;

        // 465 is implicit TLS; anything else negotiates STARTTLS.
        let builder = if config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| RitmoError::Config(format!("SMTP relay: {e}")))?
        .port(config.smtp_port);

        let mailer = if config.username.is_empty() {
            builder.build()
        } else {
            builder
                .credentials(Credentials::new(
                    config.username.clone(),
                    config.password.clone(),
                ))
                .build()
        };

        Ok(Self {
            mailer,
            from,
            templates,
        })
    }

    pub fn from_config(config: &EmailConfig) -> Result<Self> {
        Self::new(config, TemplateSet::from_config(config))
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send_templated_email(
        &self,
        template_code: &str,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (subject, body) = self.templates.render(template_code, variables)?;
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| RitmoError::Transport(format!("Invalid recipient '{recipient}': {e}")))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| RitmoError::Transport(format!("Build email: {e}")))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| RitmoError::Transport(format!("SMTP send: {e}")))?;

        tracing::info!("📤 {template_code} sent to: {recipient}");
        Ok(())
    }
}

/// Renders and logs instead of sending. Used when no SMTP host is
/// configured and for `--dry-run`.
pub struct LogEmailTransport {
    templates: TemplateSet,
    outbox: Mutex<Vec<RenderedEmail>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl LogEmailTransport {
    pub fn new(templates: TemplateSet) -> Self {
        Self {
            templates,
            outbox: Mutex::new(Vec::new()),
        }
    }

    /// Everything "sent" so far.
    pub fn outbox(&self) -> Vec<RenderedEmail> {
        self.outbox.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmailTransport for LogEmailTransport {
    async fn send_templated_email(
        &self,
        template_code: &str,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (subject, body) = self.templates.render(template_code, variables)?;
        tracing::info!("📝 [dry-run] {template_code} → {recipient}: {subject}");
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.push(RenderedEmail {
                recipient: recipient.to_string(),
                subject,
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ritmo_core::config::EmailTemplateConfig;

    fn vars() -> BTreeMap<String, String> {
        let mut v = BTreeMap::new();
        v.insert("contact_name".into(), "Rita".into());
        v.insert("quote_title".into(), "ORC-42".into());
        v
    }

    #[test]
    fn test_render_placeholders() {
        assert_eq!(
            render_placeholders("Hi {{contact_name}}, re {{ quote_title }}", &vars()),
            "Hi Rita, re ORC-42"
        );
        assert_eq!(render_placeholders("{{missing}}!", &vars()), "!");
        assert_eq!(render_placeholders("open {{ brace", &vars()), "open {{ brace");
    }

    #[test]
    fn test_builtin_templates_cover_every_email_step() {
        let set = TemplateSet::builtin();
        for code in ["followup_d1", "followup_d3", "followup_d14"] {
            let (subject, body) = set.render(code, &vars()).unwrap();
            assert!(subject.contains("ORC-42"), "{code}");
            assert!(body.contains("Rita"), "{code}");
        }
        assert!(set.render("followup_call_d7", &vars()).is_err());
    }

    #[test]
    fn test_config_overrides_builtin() {
        let mut config = EmailConfig::default();
        config.templates.insert(
            "followup_d1".into(),
            EmailTemplateConfig {
                subject: "Olá {{contact_name}}".into(),
                body: "Orçamento {{quote_title}}".into(),
            },
        );
        let set = TemplateSet::from_config(&config);
        let (subject, body) = set.render("followup_d1", &vars()).unwrap();
        assert_eq!(subject, "Olá Rita");
        assert_eq!(body, "Orçamento ORC-42");
    }

    #[test]
    fn test_smtp_requires_host() {
        assert!(SmtpEmailTransport::from_config(&EmailConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_log_transport_records() {
        let transport = LogEmailTransport::new(TemplateSet::builtin());
        transport
            .send_templated_email("followup_d3", "rita@example.com", &vars())
            .await
            .unwrap();
        let outbox = transport.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].recipient, "rita@example.com");
        assert!(outbox[0].subject.contains("ORC-42"));
    }
}
