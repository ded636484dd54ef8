//! Send activation emails to users.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Mail;
use crate::error::{Result, ServerError};

const MAILTRAP_SANDBOX_URL: &str = "https://sandbox.api.mailtrap.io/api/send";
const MAILTRAP_URL: &str = "https://send.api.mailtrap.io/api/send";
const CATEGORY: &str = "User Activation";

/// Mail templates list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Invitation with the activation link.
    UserInvitation,
}

/// Variables rendered into a [`Template`].
#[derive(Debug, Clone, Serialize)]
pub struct TemplateVars {
    pub username: String,
    pub activation_url: String,
    pub activation_code: String,
}

impl Template {
    /// Render subject and HTML body.
    pub fn render(&self, vars: &TemplateVars) -> (String, String) {
        match self {
            Template::UserInvitation => (
                "Finish registration with Digitally".to_owned(),
                format!(
                    "<p>Hi {username},</p>\
                     <p>Thanks for signing up. Confirm your account by \
                     following <a href=\"{url}\">{url}</a>.</p>\
                     <p>Your activation code is <code>{code}</code>.</p>",
                    username = vars.username,
                    url = vars.activation_url,
                    code = vars.activation_code,
                ),
            ),
        }
    }
}

/// Notification collaborator.
///
/// Implementations retry on their own; callers only see the final outcome.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver `template` to `email`, returning the provider status code.
    async fn send(
        &self,
        template: Template,
        username: &str,
        email: &str,
        vars: &TemplateVars,
        sandbox: bool,
    ) -> Result<u16>;
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct Payload<'a> {
    from: Address<'a>,
    to: Vec<Address<'a>>,
    subject: String,
    html: String,
    category: &'static str,
}

/// Mailtrap HTTP API sender.
pub struct MailtrapMailer {
    client: reqwest::Client,
    config: Mail,
    backoff: Duration,
}

impl MailtrapMailer {
    /// Create a new [`MailtrapMailer`].
    pub fn new(config: Mail) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.attempt_timeout())
            .build()
            .map_err(|err| ServerError::internal("cannot build http client", err))?;

        Ok(Self {
            client,
            config,
            backoff: Duration::from_secs(1),
        })
    }

    fn endpoint(&self, sandbox: bool) -> String {
        if sandbox {
            format!("{MAILTRAP_SANDBOX_URL}/{}", self.config.inbox_id)
        } else {
            MAILTRAP_URL.to_owned()
        }
    }

    async fn attempt(&self, url: &str, payload: &Payload<'_>) -> Result<u16> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|err| ServerError::internal("failed to send email", err))?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ServerError::Internal {
                details: format!("failed to send email, status: {status}, body: {body}"),
                source: None,
            })
        }
    }
}

#[async_trait]
impl Mailer for MailtrapMailer {
    async fn send(
        &self,
        template: Template,
        username: &str,
        email: &str,
        vars: &TemplateVars,
        sandbox: bool,
    ) -> Result<u16> {
        let (subject, html) = template.render(vars);
        let payload = Payload {
            from: Address {
                email: &self.config.from_email,
                name: Some(&self.config.from_name),
            },
            to: vec![Address { email, name: Some(username) }],
            subject,
            html,
            category: CATEGORY,
        };
        let url = self.endpoint(sandbox);
        let attempts = self.config.max_retries.max(1);

        let mut attempt = 1;
        loop {
            match self.attempt(&url, &payload).await {
                Ok(status) => return Ok(status),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, ?template, "email delivery failed, retrying");
                    // linear backoff.
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                },
            }
        }
    }
}

/// Sender used when no mail provider is configured.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        template: Template,
        username: &str,
        _email: &str,
        _vars: &TemplateVars,
        sandbox: bool,
    ) -> Result<u16> {
        tracing::info!(?template, username, sandbox, "email not sent, no provider configured");
        Ok(200)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Records deliveries, optionally failing every one of them.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub fail: bool,
        pub delay: Option<Duration>,
        pub sent: tokio::sync::Mutex<Vec<(String, TemplateVars, bool)>>,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(
            &self,
            _template: Template,
            _username: &str,
            email: &str,
            vars: &TemplateVars,
            sandbox: bool,
        ) -> Result<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ServerError::Internal {
                    details: "smtp unreachable".into(),
                    source: None,
                });
            }
            self.sent
                .lock()
                .await
                .push((email.to_owned(), vars.clone(), sandbox));
            Ok(202)
        }
    }

    #[test]
    fn test_render_invitation() {
        let vars = TemplateVars {
            username: "ada".into(),
            activation_url: "https://shop.test/confirm/abc".into(),
            activation_code: "abc".into(),
        };
        let (subject, body) = Template::UserInvitation.render(&vars);

        assert!(!subject.is_empty());
        assert!(body.contains("Hi ada"));
        assert!(body.contains("https://shop.test/confirm/abc"));
    }

    #[test]
    fn test_endpoint() {
        let mailer = MailtrapMailer::new(Mail {
            inbox_id: "42".into(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(mailer.endpoint(true), format!("{MAILTRAP_SANDBOX_URL}/42"));
        assert_eq!(mailer.endpoint(false), MAILTRAP_URL);
    }
}
