//! Email transport over SMTP

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::trace;

use super::{EmailMessage, EmailTransport};
use crate::config::SmtpConfig;

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .with_context(|| format!("invalid SMTP relay {}", config.host))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let mut builder = builder.port(config.port);
        if let (Some(login), Some(password)) = (&config.login, &config.password) {
            builder = builder.credentials(Credentials::new(login.clone(), password.clone()));
        }

        let from = config
            .from_addr
            .parse()
            .with_context(|| format!("invalid sender address {}", config.from_addr))?;

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl EmailTransport for SmtpTransport {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN);

        for recipient in &message.recipients {
            let mailbox: Mailbox = recipient
                .parse()
                .with_context(|| format!("invalid recipient address {recipient}"))?;
            builder = builder.to(mailbox);
        }

        let email = builder
            .body(message.body.clone())
            .context("failed to build email")?;

        trace!("sending email to {} recipients", message.recipients.len());
        self.mailer
            .send(email)
            .await
            .context("SMTP delivery failed")?;

        Ok(())
    }
}
