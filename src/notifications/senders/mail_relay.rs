use reqwest::Client;
use serde::Serialize;

use super::SenderError;

/// Sends HTML email by POSTing JSON to an HTTP mail relay.
pub struct MailRelaySender {
    client: Client,
    url: String,
    from: String,
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

impl MailRelaySender {
    pub fn new(client: Client, url: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            from: from.into(),
        }
    }

    pub async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), SenderError> {
        if to.trim().is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "Alert email recipient is empty".to_string(),
            ));
        }
        let payload = RelayMessage {
            from: &self.from,
            to,
            subject,
            html,
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "Mail relay returned non-success status: {status}. Body: {error_body}"
            )));
        }

        Ok(())
    }
}
