//! # SGDEA Channels
//! Outbound delivery channels for notifications: SMTP e-mail and an HTTP SMS gateway.

pub mod email;
pub mod sms;

pub use email::SmtpMailer;
pub use sms::HttpSmsGateway;

use sgdea_core::config::{EmailConfig, SmsConfig};
use sgdea_core::error::Result;
use sgdea_core::traits::{EmailSender, SmsSender};

/// The configured e-mail sender, or `None` when e-mail is disabled.
pub fn email_from_config(config: &EmailConfig) -> Result<Option<Box<dyn EmailSender>>> {
    if !config.enabled {
        return Ok(None);
    }
    Ok(Some(Box::new(SmtpMailer::new(config)?)))
}

/// The configured SMS sender, or `None` when SMS is disabled.
pub fn sms_from_config(config: &SmsConfig) -> Result<Option<Box<dyn SmsSender>>> {
    if !config.enabled {
        return Ok(None);
    }
    Ok(Some(Box::new(HttpSmsGateway::new(config.clone())?)))
}
