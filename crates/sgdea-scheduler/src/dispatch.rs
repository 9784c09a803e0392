//! Delivery dispatch. Sends recent urgent notifications through e-mail and SMS.
//!
//! At-most-once per window: nothing records that a notification was sent,
//! so a failed delivery is logged and counted, never retried.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use sgdea_core::error::Result;
use sgdea_core::traits::{EmailSender, NotificationStore, SmsSender, UserDirectory};
use sgdea_core::types::{Notification, Priority, User};

use crate::report::BatchSummary;

/// Priorities that go out by e-mail.
pub const EMAIL_PRIORITIES: [Priority; 2] = [Priority::Critical, Priority::High];

/// Outcome of one dispatch run, per channel.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub candidates: usize,
    pub email: BatchSummary,
    pub sms: BatchSummary,
}

/// Outbound channels. A channel left as `None` is disabled.
#[derive(Default)]
pub struct Dispatcher {
    email: Option<Box<dyn EmailSender>>,
    sms: Option<Box<dyn SmsSender>>,
}

impl Dispatcher {
    pub fn new(email: Option<Box<dyn EmailSender>>, sms: Option<Box<dyn SmsSender>>) -> Self {
        Self { email, sms }
    }

    pub fn has_email(&self) -> bool {
        self.email.is_some()
    }

    pub fn has_sms(&self) -> bool {
        self.sms.is_some()
    }

    /// Deliver pending critical/high notifications created in the last
    /// `window_minutes`.
    pub async fn dispatch(
        &self,
        store: &dyn NotificationStore,
        directory: &dyn UserDirectory,
        window_minutes: u32,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<DispatchReport> {
        let since = now - Duration::minutes(i64::from(window_minutes));
        let candidates = store.dispatch_candidates(&EMAIL_PRIORITIES, since)?;
        tracing::info!(
            "📤 {} notification(s) to dispatch since {}",
            candidates.len(),
            since.format("%H:%M:%S")
        );

        let mut email = BatchSummary::new("dispatch-email", dry_run, now);
        let mut sms = BatchSummary::new("dispatch-sms", dry_run, now);

        for n in &candidates {
            let user = match directory.user(n.user_id) {
                Ok(Some(user)) => user,
                Ok(None) => {
                    tracing::warn!("⚠️ Notification #{} targets unknown user {}", n.id, n.user_id);
                    if self.email.is_some() {
                        email.record(label(n), Ok::<bool, String>(false));
                    }
                    continue;
                }
                Err(e) => {
                    if self.email.is_some() {
                        email.record(label(n), Err::<bool, _>(e));
                    } else {
                        tracing::warn!("⚠️ Notification #{}: user lookup failed: {e}", n.id);
                    }
                    continue;
                }
            };

            if let Some(sender) = &self.email {
                let result = send_email(sender.as_ref(), &user, n, dry_run).await;
                email.record(label(n), result);
            }

            if n.priority == Priority::Critical
                && let Some(sender) = &self.sms
            {
                let result = send_sms(sender.as_ref(), &user, n, dry_run).await;
                sms.record(label(n), result);
            }
        }

        if self.email.is_none() {
            tracing::debug!("E-mail channel disabled");
        }
        if self.sms.is_none() {
            tracing::debug!("SMS channel disabled");
        }
        email.finish(now);
        sms.finish(now);
        Ok(DispatchReport {
            candidates: candidates.len(),
            email,
            sms,
        })
    }
}

fn label(n: &Notification) -> String {
    format!("notification#{} ({})", n.id, n.notification_type)
}

async fn send_email(
    sender: &dyn EmailSender,
    user: &User,
    n: &Notification,
    dry_run: bool,
) -> std::result::Result<bool, String> {
    let Some(address) = user.email.as_deref().filter(|a| !a.trim().is_empty()) else {
        tracing::debug!("User {} has no e-mail address", user.id);
        return Ok(false);
    };
    if dry_run {
        return Ok(true);
    }
    match sender.send_notification(address, n).await {
        Ok(true) => {
            tracing::info!("📧 Notification #{} e-mailed to {}", n.id, address);
            Ok(true)
        }
        Ok(false) => Err(format!("mail transport declined delivery to {address}")),
        Err(e) => Err(e.to_string()),
    }
}

async fn send_sms(
    sender: &dyn SmsSender,
    user: &User,
    n: &Notification,
    dry_run: bool,
) -> std::result::Result<bool, String> {
    let Some(phone) = user.phone.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Ok(false);
    };
    if dry_run {
        return Ok(true);
    }
    let text = format!("SGDEA: {}", n.title);
    match sender.send_sms(phone, &text).await {
        Ok(true) => {
            tracing::info!("📱 Notification #{} sent by SMS to {}", n.id, phone);
            Ok(true)
        }
        Ok(false) => Err(format!("SMS gateway declined delivery to {phone}")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SgdeaDb;
    use crate::persistence::tests::{add_user, notification, now, temp_db};
    use async_trait::async_trait;
    use sgdea_core::error::SgdeaError;
    use sgdea_core::types::NewUser;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMailer {
        sent: Mutex<Vec<String>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl EmailSender for FakeMailer {
        async fn send_notification(&self, to: &str, _n: &Notification) -> Result<bool> {
            if self.fail_for.as_deref() == Some(to) {
                return Err(SgdeaError::Channel(format!("SMTP rejected {to}")));
            }
            self.sent.lock().unwrap().push(to.to_string());
            Ok(true)
        }
    }

    struct SharedMailer(std::sync::Arc<FakeMailer>);

    #[async_trait]
    impl EmailSender for SharedMailer {
        async fn send_notification(&self, to: &str, n: &Notification) -> Result<bool> {
            self.0.send_notification(to, n).await
        }
    }

    #[derive(Default)]
    struct FakeSms {
        sent: Mutex<Vec<String>>,
    }

    struct SharedSms(std::sync::Arc<FakeSms>);

    #[async_trait]
    impl SmsSender for SharedSms {
        async fn send_sms(&self, phone: &str, _text: &str) -> Result<bool> {
            self.0.sent.lock().unwrap().push(phone.to_string());
            Ok(true)
        }
    }

    fn user_with_phone(db: &SgdeaDb, name: &str, phone: &str) -> i64 {
        db.create_user(
            &NewUser {
                name: name.into(),
                email: Some(format!("{name}@archivo.example")),
                phone: Some(phone.into()),
                role: "archivist".into(),
                supervisor_id: None,
            },
            now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_block_others() {
        let db = temp_db();
        let ana = add_user(&db, "ana", "archivist");
        let luis = add_user(&db, "luis", "archivist");
        db.insert_notification_at(&notification(ana, Priority::Critical), now())
            .unwrap();
        db.insert_notification_at(&notification(luis, Priority::High), now())
            .unwrap();

        let mailer = std::sync::Arc::new(FakeMailer {
            fail_for: Some("ana@archivo.example".into()),
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(Some(Box::new(SharedMailer(mailer.clone()))), None);
        let report = dispatcher
            .dispatch(&db, &db, 10, now() + Duration::minutes(1), false)
            .await
            .unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.email.succeeded, 1);
        assert_eq!(report.email.failed, 1);
        assert_eq!(*mailer.sent.lock().unwrap(), vec!["luis@archivo.example".to_string()]);
        assert_eq!(report.sms.processed, 0);
    }

    #[tokio::test]
    async fn test_window_and_priority_filter() {
        let db = temp_db();
        let ana = add_user(&db, "ana", "archivist");
        db.insert_notification_at(&notification(ana, Priority::Medium), now())
            .unwrap();
        db.insert_notification_at(
            &notification(ana, Priority::Critical),
            now() - Duration::minutes(30),
        )
        .unwrap();

        let mailer = std::sync::Arc::new(FakeMailer::default());
        let dispatcher = Dispatcher::new(Some(Box::new(SharedMailer(mailer.clone()))), None);
        let report = dispatcher.dispatch(&db, &db, 10, now(), false).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sms_only_for_critical_with_phone() {
        let db = temp_db();
        let ana = user_with_phone(&db, "ana", "+57 300 123 4567");
        let luis = user_with_phone(&db, "luis", "+57 301 765 4321");
        let eva = add_user(&db, "eva", "archivist");
        db.insert_notification_at(&notification(ana, Priority::Critical), now())
            .unwrap();
        db.insert_notification_at(&notification(luis, Priority::High), now())
            .unwrap();
        db.insert_notification_at(&notification(eva, Priority::Critical), now())
            .unwrap();

        let sms = std::sync::Arc::new(FakeSms::default());
        let dispatcher = Dispatcher::new(None, Some(Box::new(SharedSms(sms.clone()))));
        let report = dispatcher.dispatch(&db, &db, 10, now(), false).await.unwrap();

        assert_eq!(*sms.sent.lock().unwrap(), vec!["+57 300 123 4567".to_string()]);
        assert_eq!(report.sms.succeeded, 1);
        assert_eq!(report.sms.skipped, 1);
        assert_eq!(report.email.processed, 0);
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let db = temp_db();
        let ana = add_user(&db, "ana", "archivist");
        db.insert_notification_at(&notification(ana, Priority::High), now())
            .unwrap();
        let mailer = std::sync::Arc::new(FakeMailer::default());
        let dispatcher = Dispatcher::new(Some(Box::new(SharedMailer(mailer.clone()))), None);
        let report = dispatcher.dispatch(&db, &db, 10, now(), true).await.unwrap();
        assert_eq!(report.email.succeeded, 1);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_back_to_back_windows_send_once() {
        let db = temp_db();
        let ana = add_user(&db, "ana", "archivist");
        db.insert_notification_at(&notification(ana, Priority::Critical), now())
            .unwrap();

        let mailer = std::sync::Arc::new(FakeMailer::default());
        let dispatcher = Dispatcher::new(Some(Box::new(SharedMailer(mailer.clone()))), None);
        let first = dispatcher.dispatch(&db, &db, 10, now(), false).await.unwrap();
        let second = dispatcher
            .dispatch(&db, &db, 10, now() + Duration::minutes(10), false)
            .await
            .unwrap();

        assert_eq!(first.email.succeeded, 1);
        assert_eq!(second.candidates, 0);
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    /// Directory that knows nobody, or fails every lookup.
    struct BrokenDirectory {
        fail: bool,
    }

    impl UserDirectory for BrokenDirectory {
        fn user(&self, id: i64) -> Result<Option<User>> {
            if self.fail {
                return Err(SgdeaError::Database(format!("user {id}: disk I/O error")));
            }
            Ok(None)
        }

        fn users_with_role(&self, _role: &str) -> Result<Vec<User>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_unknown_user_is_skipped_and_lookup_error_counted() {
        let db = temp_db();
        let ana = add_user(&db, "ana", "archivist");
        db.insert_notification_at(&notification(ana, Priority::Critical), now())
            .unwrap();
        db.insert_notification_at(&notification(ana, Priority::High), now())
            .unwrap();
        let mailer = std::sync::Arc::new(FakeMailer::default());
        let dispatcher = Dispatcher::new(Some(Box::new(SharedMailer(mailer.clone()))), None);

        let unknown = BrokenDirectory { fail: false };
        let report = dispatcher.dispatch(&db, &unknown, 10, now(), false).await.unwrap();
        assert_eq!(report.email.processed, 2);
        assert_eq!(report.email.skipped, 2);

        let failing = BrokenDirectory { fail: true };
        let report = dispatcher.dispatch(&db, &failing, 10, now(), false).await.unwrap();
        assert_eq!(report.email.processed, 2);
        assert_eq!(report.email.failed, 2);
        assert_eq!(report.email.errors.len(), 2);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failures_not_counted_for_disabled_email() {
        let db = temp_db();
        let ana = add_user(&db, "ana", "archivist");
        db.insert_notification_at(&notification(ana, Priority::Critical), now())
            .unwrap();
        let sms = std::sync::Arc::new(FakeSms::default());
        let dispatcher = Dispatcher::new(None, Some(Box::new(SharedSms(sms.clone()))));

        let failing = BrokenDirectory { fail: true };
        let report = dispatcher.dispatch(&db, &failing, 10, now(), false).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.email.processed, 0);
        assert_eq!(report.email.failed, 0);
        assert!(sms.sent.lock().unwrap().is_empty());
    }
}
