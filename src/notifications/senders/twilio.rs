use reqwest::Client;

use super::SenderError;

pub const TWILIO_API_BASE: &str = "https://api.twilio.com";

/// Sends SMS through the Twilio Messages API.
pub struct TwilioSmsSender {
    client: Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSmsSender {
    pub fn new(
        client: Client,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: TWILIO_API_BASE.to_string(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn send(&self, to: &str, body: &str) -> Result<(), SenderError> {
        if self.account_sid.is_empty() || self.auth_token.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "Twilio account sid and auth token are required".to_string(),
            ));
        }
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );
        let form = [("To", to), ("From", self.from_number.as_str()), ("Body", body)];

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "Twilio API returned non-success status: {status}. Body: {error_body}"
            )));
        }

        Ok(())
    }
}
