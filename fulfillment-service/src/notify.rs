use crate::metrics::PipelineMetrics;
use async_trait::async_trait;
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info};

/// The single message a fulfillment produces: all units of the purchase
/// batched into one email.
#[derive(Debug, Clone)]
pub struct ConfirmationMessage {
    pub recipient: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &ConfirmationMessage) -> anyhow::Result<()>;
}

/// SMTP-backed notifier. A transport is built per send; the blocking lettre
/// send runs on the blocking pool so the request path is never held up.
pub struct SmtpNotifier {
    host: String,
    port: u16,
    credentials: Credentials,
    from: String,
}

impl SmtpNotifier {
    pub fn new(host: String, port: u16, username: String, password: String, from: String) -> Self {
        Self {
            host,
            port,
            credentials: Credentials::new(username, password),
            from,
        }
    }

    fn build_transport(&self) -> anyhow::Result<SmtpTransport> {
        Ok(SmtpTransport::relay(&self.host)?
            .port(self.port)
            .credentials(self.credentials.clone())
            .build())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, message: &ConfirmationMessage) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(self.from.parse()?)
            .to(message.recipient.parse()?)
            .subject(message.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                message.body_text.clone(),
                message.body_html.clone(),
            ))?;

        let mailer = self.build_transport()?;
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await??;
        Ok(())
    }
}

/// Best-effort dispatch: a committed fulfillment is final whether or not the
/// buyer is ever notified, so failures are counted and logged, never
/// propagated.
pub async fn dispatch(
    notifier: &dyn Notifier,
    metrics: &PipelineMetrics,
    message: Option<ConfirmationMessage>,
) {
    let Some(message) = message else {
        return;
    };
    match notifier.send(&message).await {
        Ok(()) => {
            info!(recipient = %message.recipient, subject = %message.subject, "confirmation sent");
        }
        Err(err) => {
            metrics.notification_failures_total.inc();
            error!(
                recipient = %message.recipient,
                error = %err,
                "confirmation send failed; fulfillment remains committed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _message: &ConfirmationMessage) -> anyhow::Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }

    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn send(&self, _message: &ConfirmationMessage) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message() -> ConfirmationMessage {
        ConfirmationMessage {
            recipient: "buyer@example.com".into(),
            subject: "Your tickets".into(),
            body_html: "<p>hi</p>".into(),
            body_text: "hi".into(),
        }
    }

    #[tokio::test]
    async fn dispatch_swallows_send_failures() {
        let metrics = PipelineMetrics::new();
        dispatch(&FailingNotifier, &metrics, Some(message())).await;
        assert_eq!(metrics.notification_failures_total.get(), 1);
    }

    #[tokio::test]
    async fn dispatch_skips_empty_message() {
        let metrics = PipelineMetrics::new();
        let notifier = CountingNotifier(AtomicUsize::new(0));
        dispatch(&notifier, &metrics, None).await;
        assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_sends_once_per_batch() {
        let metrics = PipelineMetrics::new();
        let notifier = CountingNotifier(AtomicUsize::new(0));
        dispatch(&notifier, &metrics, Some(message())).await;
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.notification_failures_total.get(), 0);
    }
}
