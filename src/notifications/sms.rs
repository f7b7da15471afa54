//! SMS transport over the Twilio REST API

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{trace, warn};

use super::{SmsMessage, SmsTransport};
use crate::config::SmsConfig;

pub struct TwilioTransport {
    client: reqwest::Client,
    config: SmsConfig,
}

impl TwilioTransport {
    pub fn new(config: SmsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build SMS HTTP client")?;

        Ok(Self { client, config })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsTransport for TwilioTransport {
    /// One API call per recipient; every recipient is tried before failing
    async fn send(&self, message: &SmsMessage) -> Result<()> {
        let url = self.messages_url();
        let mut failures = 0;

        for recipient in &message.recipients {
            trace!("sending SMS to {recipient}");

            let params = [
                ("To", recipient.as_str()),
                ("From", self.config.from.as_str()),
                ("Body", message.body.as_str()),
            ];

            let result = self
                .client
                .post(&url)
                .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
                .form(&params)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!("SMS to {recipient} rejected with HTTP {}", response.status());
                    failures += 1;
                }
                Err(e) => {
                    warn!("SMS to {recipient} failed: {e}");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            bail!(
                "{failures} of {} SMS could not be sent",
                message.recipients.len()
            );
        }
        Ok(())
    }
}
