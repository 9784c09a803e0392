//! Email channel: SMTP delivery of notifications (async lettre).

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use sgdea_core::config::EmailConfig;
use sgdea_core::error::{Result, SgdeaError};
use sgdea_core::traits::EmailSender;
use sgdea_core::types::{Notification, Priority};

/// Sends notifications over SMTP with STARTTLS.
pub struct SmtpMailer {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let from = from_mailbox(config)?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| SgdeaError::Channel(format!("SMTP relay: {e}")))?
            .port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        tracing::debug!("📧 SMTP relay {}:{}", config.smtp_host, config.smtp_port);
        Ok(Self {
            from,
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl EmailSender for SmtpMailer {
    async fn send_notification(&self, to: &str, notification: &Notification) -> Result<bool> {
        let email = build_message(&self.from, to, notification)?;
        let response = self
            .transport
            .send(email)
            .await
            .map_err(|e| SgdeaError::Channel(format!("SMTP send: {e}")))?;
        if !response.is_positive() {
            tracing::warn!("⚠️ SMTP declined mail to {to}: {}", response.code());
        }
        Ok(response.is_positive())
    }
}

fn from_mailbox(config: &EmailConfig) -> Result<Mailbox> {
    format!("{} <{}>", config.from_name, config.from_address)
        .parse()
        .map_err(|e| SgdeaError::Channel(format!("Invalid from: {e}")))
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "CRÍTICA",
        Priority::High => "ALTA",
        Priority::Medium => "MEDIA",
        Priority::Low => "BAJA",
    }
}

pub fn render_subject(n: &Notification) -> String {
    format!("[SGDEA][{}] {}", priority_label(n.priority), n.title)
}

pub fn render_body(n: &Notification) -> String {
    let mut body = format!("{}\n\n{}\n", n.title, n.message);
    if let Some(entity) = n.entity {
        body.push_str(&format!("\nRegistro: {entity}"));
    }
    body.push_str(&format!(
        "\nPrioridad: {}\nGenerada: {}\n\n-- \nMensaje automático del Sistema de Gestión Documental. No responda a este correo.\n",
        priority_label(n.priority),
        n.created_at.format("%Y-%m-%d %H:%M UTC")
    ));
    body
}

/// Build the plain-text message for `notification`.
pub fn build_message(from: &Mailbox, to: &str, notification: &Notification) -> Result<Message> {
    let to: Mailbox = to
        .parse()
        .map_err(|e| SgdeaError::Channel(format!("Invalid to: {e}")))?;
    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(render_subject(notification))
        .header(ContentType::TEXT_PLAIN)
        .body(render_body(notification))
        .map_err(|e| SgdeaError::Channel(format!("Build email: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sgdea_core::types::{EntityKind, EntityRef, NotificationStatus};

    fn notification() -> Notification {
        Notification {
            id: 7,
            user_id: 2,
            notification_type: "certificado_vencido".into(),
            title: "Certificado 5A:01 vencido".into(),
            message: "El certificado de Ana Pérez vence el 2026-10-18".into(),
            priority: Priority::Critical,
            status: NotificationStatus::Pending,
            is_automatic: true,
            entity: Some(EntityRef::new(EntityKind::Certificado, 3)),
            created_at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
            read_at: None,
            archived_at: None,
        }
    }

    fn config() -> EmailConfig {
        EmailConfig {
            enabled: true,
            smtp_host: "smtp.example.org".into(),
            from_address: "archivo@example.org".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_render() {
        let n = notification();
        assert_eq!(render_subject(&n), "[SGDEA][CRÍTICA] Certificado 5A:01 vencido");
        let body = render_body(&n);
        assert!(body.contains("vence el 2026-10-18"));
        assert!(body.contains("Registro: certificado#3"));
        assert!(body.contains("2026-10-19 09:00 UTC"));
    }

    #[test]
    fn test_build_message() {
        let from = from_mailbox(&config()).unwrap();
        let msg = build_message(&from, "ana@archivo.example", &notification()).unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("To: ana@archivo.example"));
        assert!(raw.contains("From: SGDEA <archivo@example.org>"));
    }

    #[test]
    fn test_invalid_recipient_fails_without_network() {
        let from = from_mailbox(&config()).unwrap();
        let err = build_message(&from, "not an address", &notification()).unwrap_err();
        assert!(matches!(err, SgdeaError::Channel(_)));
    }

    #[test]
    fn test_invalid_sender_rejected() {
        let config = EmailConfig {
            from_address: "archivo".into(),
            ..config()
        };
        assert!(from_mailbox(&config).is_err());
    }
}
