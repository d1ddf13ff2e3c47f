//! Email fallback via the Resend HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::json;

use herald_common::types::Notification;

use super::{DeliveryError, EmailTransport};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// A rendered email ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl EmailMessage {
    /// Subject `[TYPE] title`; HTML body with title, message, type and send time.
    pub fn render(notification: &Notification, now: DateTime<Utc>) -> Self {
        let title = escape_html(&notification.title);
        let message = escape_html(&notification.message);
        let kind = escape_html(&notification.notification_type);

        let html = format!(
            r#"<html>
<body style="font-family: Arial, sans-serif; margin: 20px;">
  <div style="border: 1px solid #ddd; border-radius: 5px; padding: 20px; max-width: 600px;">
    <h2 style="color: #333; margin-top: 0;">{title}</h2>
    <div style="background-color: #f8f9fa; padding: 15px; border-radius: 3px; margin: 15px 0;">
      <p style="margin: 0; color: #555;">{message}</p>
    </div>
    <p style="color: #666; font-size: 12px; margin-bottom: 0;">
      Notification type: <strong>{kind}</strong><br>
      Sent at: {sent_at} UTC
    </p>
  </div>
</body>
</html>"#,
            sent_at = now.format("%Y-%m-%d %H:%M:%S"),
        );

        Self {
            to: notification.user_email.clone(),
            subject: format!(
                "[{}] {}",
                notification.notification_type.to_uppercase(),
                notification.title
            ),
            html,
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Sends through Resend (`POST /emails`).
#[derive(Clone)]
pub struct ResendEmailTransport {
    client: Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl ResendEmailTransport {
    pub fn new(api_key: String, from: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            api_key,
            from,
            endpoint: RESEND_ENDPOINT.to_string(),
        })
    }

    /// Point at a different API base (self-hosted relay, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// 4xx other than 429 is a rejection of the request itself; the rest are transport trouble.
fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
    let detail = format!("{} - {}", status, body);
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        DeliveryError::Rejected(detail)
    } else {
        DeliveryError::Transport(detail)
    }
}

#[async_trait]
impl EmailTransport for ResendEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        let body = json!({
            "from": self.from,
            "to": [message.to],
            "subject": message.subject,
            "html": message.html,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, to = %message.to, "Email send failed");
            return Err(classify_status(status, &text));
        }

        tracing::debug!(to = %message.to, "Email accepted by Resend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::NotificationStatus;
    use uuid::Uuid;

    fn notification(title: &str, message: &str) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            user_email: "u1@example.com".to_string(),
            title: title.to_string(),
            message: message.to_string(),
            notification_type: "friend_request".to_string(),
            aggregation_key: "k".to_string(),
            count: 1,
            last_message_content: message.to_string(),
            is_read: false,
            status: NotificationStatus::Processing,
            retry_count: 0,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            error_message: None,
            metadata: serde_json::json!({}),
            delivered_via: None,
            lease_token: None,
            last_change_id: None,
        }
    }

    #[test]
    fn test_render_subject_and_body() {
        let message = EmailMessage::render(&notification("Ada added you", "Say hi"), Utc::now());
        assert_eq!(message.to, "u1@example.com");
        assert_eq!(message.subject, "[FRIEND_REQUEST] Ada added you");
        assert!(message.html.contains("Ada added you"));
        assert!(message.html.contains("Say hi"));
        assert!(message.html.contains("friend_request"));
    }

    #[test]
    fn test_render_escapes_markup() {
        let message = EmailMessage::render(&notification("<b>x</b>", "a & b"), Utc::now());
        assert!(message.html.contains("&lt;b&gt;x&lt;/b&gt;"));
        assert!(message.html.contains("a &amp; b"));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            DeliveryError::Rejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "bad key"),
            DeliveryError::Rejected(detail) if detail.contains("bad key")
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            DeliveryError::Transport(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            DeliveryError::Transport(_)
        ));
    }
}
