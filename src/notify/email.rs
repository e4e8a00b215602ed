//! Email notifications over SMTP with STARTTLS.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{NotifyError, SmtpSettings};

/// Send a plain-text email to all recipients in one message.
pub async fn send_email(
    settings: &SmtpSettings,
    recipients: &[String],
    subject: &str,
    body: &str,
) -> Result<(), NotifyError> {
    let from: Mailbox = settings
        .from
        .parse()
        .map_err(|_| NotifyError::InvalidAddress(settings.from.clone()))?;

    let mut builder = Message::builder().from(from).subject(subject);
    for recipient in recipients {
        let to: Mailbox = recipient
            .parse()
            .map_err(|_| NotifyError::InvalidAddress(recipient.clone()))?;
        builder = builder.to(to);
    }
    let message = builder
        .body(body.to_string())
        .map_err(|e| NotifyError::Smtp(e.to_string()))?;

    let mut transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        .map_err(|e| NotifyError::Smtp(e.to_string()))?
        .port(settings.port);
    if !settings.user.is_empty() {
        transport = transport.credentials(Credentials::new(
            settings.user.clone(),
            settings.password.clone(),
        ));
    }

    transport
        .build()
        .send(message)
        .await
        .map_err(|e| NotifyError::Smtp(e.to_string()))?;
    Ok(())
}
