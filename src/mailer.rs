use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::MailConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, email: OutgoingEmail) -> Result<()>;
}

/// Picks the HTTP mailer when an API endpoint is configured, logging otherwise.
pub fn from_config(config: &MailConfig) -> Result<Arc<dyn Mailer>> {
    match &config.api_url {
        Some(endpoint) => Ok(Arc::new(HttpMailer::new(config, endpoint)?)),
        None => {
            tracing::warn!("MAIL_API_URL not set; outgoing email will only be logged");
            Ok(Arc::new(LogMailer))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailAddress {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendEmailBody<'a> {
    sender: EmailAddress,
    to: Vec<EmailAddress>,
    subject: &'a str,
    text_content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html_content: Option<&'a str>,
}

/// Delivers mail through a transactional email HTTP API.
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    sender_email: String,
    sender_name: String,
}

impl HttpMailer {
    pub fn new(config: &MailConfig, endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build mail HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: config.api_key.clone(),
            sender_email: config.sender_email.clone(),
            sender_name: config.sender_name.clone(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<()> {
        let body = SendEmailBody {
            sender: EmailAddress {
                email: self.sender_email.clone(),
                name: Some(self.sender_name.clone()),
            },
            to: vec![EmailAddress {
                email: email.to.clone(),
                name: None,
            }],
            subject: &email.subject,
            text_content: &email.text,
            html_content: email.html.as_deref(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }

        let response = request
            .send()
            .await
            .context("mail API request failed")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("mail API responded with {status}: {detail}");
        }
        Ok(())
    }
}

/// Writes messages to the log instead of sending them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<()> {
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            body = %email.text,
            "email not sent (no mail API configured)"
        );
        Ok(())
    }
}

pub fn invitation_email(
    to: &str,
    organization_name: &str,
    role: &str,
    inviter: &str,
    link: &str,
    expires_in_days: i64,
) -> OutgoingEmail {
    let subject = format!("You're invited to join {organization_name}");
    let text = format!(
        "{inviter} invited you to join {organization_name} as {role}.\n\n\
         Accept the invitation: {link}\n\n\
         The link expires in {expires_in_days} days. \
         If you were not expecting this email you can ignore it."
    );
    let html = format!(
        "<p>{inviter} invited you to join <strong>{organization_name}</strong> as {role}.</p>\
         <p><a href=\"{link}\">Accept the invitation</a></p>\
         <p>The link expires in {expires_in_days} days. \
         If you were not expecting this email you can ignore it.</p>",
        inviter = escape_html(inviter),
        organization_name = escape_html(organization_name),
        role = escape_html(role),
        link = escape_html(link),
    );
    OutgoingEmail {
        to: to.to_string(),
        subject,
        text,
        html: Some(html),
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::{escape_html, invitation_email};

    #[test]
    fn invitation_email_contains_the_link() {
        let email = invitation_email(
            "b@example.com",
            "Acme <HVAC>",
            "MANAGER",
            "a@example.com",
            "https://app.example.com/invitations/abc",
            7,
        );
        assert_eq!(email.to, "b@example.com");
        assert!(email.text.contains("https://app.example.com/invitations/abc"));
        assert!(email.text.contains("as MANAGER"));
        assert!(email.text.contains("expires in 7 days"));
        let html = email.html.unwrap();
        assert!(html.contains("Acme &lt;HVAC&gt;"));
        assert!(!html.contains("<HVAC>"));
    }

    #[test]
    fn escapes_quotes() {
        assert_eq!(escape_html("a\"b'c"), "a&quot;b&#39;c");
    }
}
