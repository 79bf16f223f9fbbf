use std::sync::Arc;

use tera::{Context, Tera};
use tracing::{info, warn};

use super::senders::{AlertSender, SenderError};
use crate::monitoring::transition::AlertChannel;

const EMAIL_TEMPLATE: &str = r#"<h3>{{ service_name }} on {{ host_name }} is {{ new_status }}</h3>
<p>Status changed from <strong>{{ old_status }}</strong> to <strong>{{ new_status }}</strong>.</p>
<p>{{ message }}</p>
<p><small>Checked at {{ checked_at }}</small></p>
"#;

/// What an operator is told about a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusAlert {
    pub service_name: String,
    pub host_name: String,
    pub old_status: String,
    pub new_status: String,
    pub message: String,
    pub checked_at: String,
}

impl StatusAlert {
    pub fn subject(&self) -> String {
        format!("{} on {} is {}", self.service_name, self.host_name, self.new_status)
    }

    pub fn sms_body(&self) -> String {
        format!(
            "{} on {} changed from {} to {}: {}",
            self.service_name, self.host_name, self.old_status, self.new_status, self.message
        )
    }

    pub fn render_html(&self) -> Result<String, SenderError> {
        let mut context = Context::new();
        context.insert("service_name", &self.service_name);
        context.insert("host_name", &self.host_name);
        context.insert("old_status", &self.old_status);
        context.insert("new_status", &self.new_status);
        context.insert("message", &self.message);
        context.insert("checked_at", &self.checked_at);
        Tera::one_off(EMAIL_TEMPLATE, &context, true)
            .map_err(|e| SenderError::TemplatingError(e.to_string()))
    }
}

/// Renders alerts and hands them to the configured transports.
pub struct AlertService {
    sender: Arc<dyn AlertSender>,
    email_to: Option<String>,
    sms_to: Option<String>,
}

impl AlertService {
    pub fn new(sender: Arc<dyn AlertSender>, email_to: Option<String>, sms_to: Option<String>) -> Self {
        Self {
            sender,
            email_to,
            sms_to,
        }
    }

    pub async fn dispatch(&self, channel: AlertChannel, alert: &StatusAlert) -> Result<(), SenderError> {
        match channel {
            AlertChannel::Email => {
                let to = self.email_to.as_deref().ok_or_else(|| {
                    SenderError::InvalidConfiguration("alert_email_to is not set".to_string())
                })?;
                let html = alert.render_html()?;
                self.sender.send_email(to, &alert.subject(), &html).await?;
            }
            AlertChannel::Sms => {
                let to = self.sms_to.as_deref().ok_or_else(|| {
                    SenderError::InvalidConfiguration("alert_sms_to is not set".to_string())
                })?;
                self.sender.send_sms(to, &alert.sms_body()).await?;
            }
        }
        info!(?channel, service = %alert.service_name, host = %alert.host_name, "Alert sent.");
        Ok(())
    }

    /// Delivery is best-effort: failures are logged and dropped.
    pub async fn dispatch_best_effort(&self, channel: AlertChannel, alert: &StatusAlert) {
        if let Err(e) = self.dispatch(channel, alert).await {
            warn!(?channel, service = %alert.service_name, host = %alert.host_name, error = %e, "Failed to deliver alert.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingAlertSender, SentAlert};

    fn alert() -> StatusAlert {
        StatusAlert {
            service_name: "HTTPS".to_string(),
            host_name: "shop <prod>".to_string(),
            old_status: "healthy".to_string(),
            new_status: "problem".to_string(),
            message: "503 Service Unavailable".to_string(),
            checked_at: "2024-05-01 10:00:00".to_string(),
        }
    }

    #[test]
    fn test_subject_and_sms_body() {
        let alert = alert();
        assert_eq!(alert.subject(), "HTTPS on shop <prod> is problem");
        assert_eq!(
            alert.sms_body(),
            "HTTPS on shop <prod> changed from healthy to problem: 503 Service Unavailable"
        );
    }

    #[test]
    fn test_html_body_is_escaped() {
        let html = alert().render_html().unwrap();
        assert!(html.contains("shop &lt;prod&gt;"));
        assert!(html.contains("503 Service Unavailable"));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_channel() {
        let sender = Arc::new(RecordingAlertSender::default());
        let service = AlertService::new(
            sender.clone(),
            Some("ops@example.com".to_string()),
            Some("+15551234".to_string()),
        );

        service.dispatch(AlertChannel::Email, &alert()).await.unwrap();
        service.dispatch(AlertChannel::Sms, &alert()).await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], SentAlert::Email { to, .. } if to == "ops@example.com"));
        assert!(matches!(&sent[1], SentAlert::Sms { to, .. } if to == "+15551234"));
    }

    #[tokio::test]
    async fn test_missing_recipient_is_configuration_error() {
        let sender = Arc::new(RecordingAlertSender::default());
        let service = AlertService::new(sender.clone(), None, None);
        assert!(matches!(
            service.dispatch(AlertChannel::Sms, &alert()).await,
            Err(SenderError::InvalidConfiguration(_))
        ));
        service.dispatch_best_effort(AlertChannel::Email, &alert()).await;
        assert!(sender.sent().is_empty());
    }
}
