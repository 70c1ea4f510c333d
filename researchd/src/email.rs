//! Notification delivery over e-mail: SMTP or file drop through lettre, or the Resend HTTP API.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use research_queue::{DeliveryError, Notification, Notifier};
use serde_json::json;
use url::Url;

use crate::config::{NotifierConfig, NotifierTransport};
use crate::errors::Error;

/// Build the notifier selected by configuration.
pub fn build_notifier(config: &NotifierConfig) -> Result<Arc<dyn Notifier>, Error> {
    match &config.transport {
        NotifierTransport::Resend { api_key, api_url } => Ok(Arc::new(ResendNotifier::new(
            api_url.clone(),
            api_key.clone(),
            config.from_email.clone(),
            config.from_name.clone(),
        ))),
        _ => Ok(Arc::new(EmailNotifier::new(config)?)),
    }
}

pub struct EmailNotifier {
    transport: EmailTransport,
    from: Mailbox,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

impl EmailNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self, Error> {
        let transport = match &config.transport {
            NotifierTransport::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| Error::Internal {
                    operation: format!("create SMTP transport: {e}"),
                })?
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                EmailTransport::Smtp(smtp_builder.build())
            }
            NotifierTransport::File { path } => {
                let emails_dir = Path::new(path);
                if !emails_dir.exists() {
                    std::fs::create_dir_all(emails_dir).map_err(|e| Error::Internal {
                        operation: format!("create emails directory: {e}"),
                    })?;
                }
                EmailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(emails_dir))
            }
            NotifierTransport::Resend { .. } => {
                return Err(Error::Internal {
                    operation: "create e-mail transport: resend is not an SMTP or file transport".to_string(),
                });
            }
        };

        let from = format!("{} <{}>", config.from_name, config.from_email)
            .parse::<Mailbox>()
            .map_err(|e| Error::Internal {
                operation: format!("parse from email: {e}"),
            })?;

        Ok(Self { transport, from })
    }

    fn build_message(&self, notification: &Notification) -> Result<Message, DeliveryError> {
        let to = notification
            .to
            .parse::<Mailbox>()
            .map_err(|e| DeliveryError(format!("invalid recipient {:?}: {e}", notification.to)))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(notification.html.clone())
            .map_err(|e| DeliveryError(format!("build email message: {e}")))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    #[tracing::instrument(skip_all)]
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let message = self.build_message(notification)?;

        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(message)
                    .await
                    .map_err(|e| DeliveryError(format!("send SMTP email: {e}")))?;
            }
            EmailTransport::File(file) => {
                file.send(message)
                    .await
                    .map_err(|e| DeliveryError(format!("send file email: {e}")))?;
            }
        }

        Ok(())
    }
}

/// Delivers notifications through the Resend HTTP API.
pub struct ResendNotifier {
    client: reqwest::Client,
    api_url: Url,
    api_key: String,
    from: String,
}

impl ResendNotifier {
    pub fn new(api_url: Url, api_key: String, from_email: String, from_name: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            from: format!("{from_name} <{from_email}>"),
        }
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    #[tracing::instrument(skip_all)]
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.api_url.clone())
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": notification.to,
                "subject": notification.subject,
                "html": notification.html,
            }))
            .send()
            .await
            .map_err(|e| DeliveryError(format!("resend request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError(format!("resend returned {status}: {body}")));
        }

        Ok(())
    }
}
