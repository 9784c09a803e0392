//! SMS channel: HTTP gateway, one JSON POST per message.

use async_trait::async_trait;
use serde::Serialize;

use sgdea_core::config::SmsConfig;
use sgdea_core::error::{Result, SgdeaError};
use sgdea_core::traits::SmsSender;

/// Longest text sent in a single SMS segment.
pub const MAX_SMS_CHARS: usize = 160;

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    from: &'a str,
    message: &'a str,
}

/// Posts messages to a JSON SMS gateway with bearer authentication.
pub struct HttpSmsGateway {
    config: SmsConfig,
    client: reqwest::Client,
}

impl HttpSmsGateway {
    pub fn new(config: SmsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SgdeaError::Channel(format!("SMS client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SmsSender for HttpSmsGateway {
    async fn send_sms(&self, phone: &str, text: &str) -> Result<bool> {
        let to = normalize_phone(phone)?;
        let message = truncate(text, MAX_SMS_CHARS);
        let mut request = self.client.post(&self.config.gateway_url).json(&SmsRequest {
            to: &to,
            from: &self.config.sender_id,
            message: &message,
        });
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SgdeaError::Channel(format!("SMS send failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("⚠️ SMS gateway returned {status} for {to}: {body}");
            return Ok(false);
        }
        tracing::debug!("📱 SMS accepted for {to}");
        Ok(true)
    }
}

/// Strip formatting from a phone number: `+57 (300) 123-4567` → `+573001234567`.
pub fn normalize_phone(phone: &str) -> Result<String> {
    let trimmed = phone.trim();
    let plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    let only_separators = trimmed
        .chars()
        .skip(usize::from(plus))
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '.' | '(' | ')'));
    if !only_separators || !(7..=15).contains(&digits.len()) {
        return Err(SgdeaError::InvalidValue(format!("Invalid phone number: '{phone}'")));
    }
    Ok(if plus { format!("+{digits}") } else { digits })
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push('…');
    out
}
