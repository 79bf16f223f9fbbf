use async_trait::async_trait;
use thiserror::Error;

pub mod mail_relay;
pub mod twilio;

use mail_relay::MailRelaySender;
use twilio::TwilioSmsSender;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Templating error: {0}")]
    TemplatingError(String),
}

/// Delivers operator alerts. Implementations only transport the message;
/// rendering happens in [`super::service::AlertService`].
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<(), SenderError>;
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), SenderError>;
}

/// Routes email to the mail relay and SMS to Twilio. A missing transport is
/// reported as a configuration error at send time.
#[derive(Default)]
pub struct ChannelSenders {
    email: Option<MailRelaySender>,
    sms: Option<TwilioSmsSender>,
}

impl ChannelSenders {
    pub fn new(email: Option<MailRelaySender>, sms: Option<TwilioSmsSender>) -> Self {
        Self { email, sms }
    }
}

#[async_trait]
impl AlertSender for ChannelSenders {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<(), SenderError> {
        match &self.email {
            Some(sender) => sender.send(to, subject, html).await,
            None => Err(SenderError::InvalidConfiguration(
                "No mail relay configured".to_string(),
            )),
        }
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), SenderError> {
        match &self.sms {
            Some(sender) => sender.send(to, body).await,
            None => Err(SenderError::InvalidConfiguration(
                "No Twilio account configured".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_transports_are_configuration_errors() {
        let senders = ChannelSenders::default();
        assert!(matches!(
            senders.send_email("ops@example.com", "s", "<p>b</p>").await,
            Err(SenderError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            senders.send_sms("+15550100", "b").await,
            Err(SenderError::InvalidConfiguration(_))
        ));
    }
}
