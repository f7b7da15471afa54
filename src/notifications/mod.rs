//! Notification dispatch for check state transitions
//!
//! The [`Notifier`] renders one message per transition and hands it to the
//! configured transports:
//!
//! - one email to every subscribed role with an email address
//! - one SMS to every subscribed role with a phone number
//!
//! Missing transports turn dispatch into a no-op. Transport failures are
//! logged and never reach the evaluator.

pub mod message;
pub mod sms;
pub mod smtp;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::NotificationsConfig;
use crate::storage::schema::{Check, NotificationTarget, StateChange};

pub use message::RenderedNotification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub recipients: Vec<String>,
    pub body: String,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, message: &SmsMessage) -> Result<()>;
}

/// Messages handed to the transports for one transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    pub emails: usize,
    pub sms: usize,
}

#[derive(Clone, Default)]
pub struct Notifier {
    email: Option<Arc<dyn EmailTransport>>,
    sms: Option<Arc<dyn SmsTransport>>,
}

impl Notifier {
    pub fn new(
        email: Option<Arc<dyn EmailTransport>>,
        sms: Option<Arc<dyn SmsTransport>>,
    ) -> Self {
        Self { email, sms }
    }

    /// Notifier without any transport
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build the transports present in the configuration
    pub fn from_config(config: &NotificationsConfig) -> Result<Self> {
        let email = match &config.smtp {
            Some(smtp) => {
                debug!("email notifications through {}:{}", smtp.host, smtp.port);
                Some(Arc::new(smtp::SmtpTransport::new(smtp)?) as Arc<dyn EmailTransport>)
            }
            None => None,
        };

        let sms = match &config.sms {
            Some(sms) => {
                debug!("SMS notifications through {}", sms.api_url);
                Some(Arc::new(sms::TwilioTransport::new(sms.clone())?) as Arc<dyn SmsTransport>)
            }
            None => None,
        };

        Ok(Self::new(email, sms))
    }

    pub fn is_enabled(&self) -> bool {
        self.email.is_some() || self.sms.is_some()
    }

    /// Send the notifications of one state transition
    #[instrument(skip_all, fields(check = %check.name, instance = %target.hostname))]
    pub async fn dispatch(
        &self,
        target: &NotificationTarget,
        check: &Check,
        change: &StateChange,
    ) -> Dispatched {
        let mut dispatched = Dispatched::default();

        if !target.notify {
            debug!("notifications are disabled for this instance");
            return dispatched;
        }
        if !self.is_enabled() {
            debug!("no notification transport configured");
            return dispatched;
        }

        let rendered = message::render(target, check, change);

        if let Some(transport) = &self.email {
            let recipients: Vec<String> = target
                .recipients
                .iter()
                .filter_map(|r| r.email.clone())
                .collect();

            if !recipients.is_empty() {
                let email = EmailMessage {
                    recipients,
                    subject: rendered.subject.clone(),
                    body: rendered.body.clone(),
                };
                match transport.send(&email).await {
                    Ok(()) => dispatched.emails += 1,
                    Err(e) => warn!("failed to send email notification: {e:#}"),
                }
            }
        }

        if let Some(transport) = &self.sms {
            let recipients: Vec<String> = target
                .recipients
                .iter()
                .filter_map(|r| r.phone.clone())
                .collect();

            if !recipients.is_empty() {
                let sms = SmsMessage {
                    recipients,
                    body: rendered.sms_body.clone(),
                };
                match transport.send(&sms).await {
                    Ok(()) => dispatched.sms += 1,
                    Err(e) => warn!("failed to send SMS notification: {e:#}"),
                }
            }
        }

        if dispatched != Dispatched::default() {
            info!("notified: {}", rendered.subject);
        }
        dispatched
    }
}
