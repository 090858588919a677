//! Mail dispatch — sends one forwarded message over SMTP via lettre.
//!
//! The dispatcher executes exactly one attempt and classifies the failure;
//! retrying is the queue's job, never done here.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::ForwarderConfig;
use crate::error::DispatchError;
use crate::queue::ForwardJob;

/// Executes a single forward job against the mail transport.
#[async_trait]
pub trait MailDispatcher: Send + Sync {
    /// One dispatch attempt. Success means the message was accepted by the
    /// server; any failure is classified for the retry policy.
    async fn send(&self, job: &ForwardJob, config: &ForwarderConfig)
    -> Result<(), DispatchError>;
}

/// Production dispatcher: STARTTLS SMTP with PLAIN/LOGIN auth.
pub struct SmtpDispatcher;

#[async_trait]
impl MailDispatcher for SmtpDispatcher {
    async fn send(
        &self,
        job: &ForwardJob,
        config: &ForwarderConfig,
    ) -> Result<(), DispatchError> {
        let missing = config.missing_fields();
        if !missing.is_empty() {
            let e = DispatchError::IncompleteConfig(missing.join(", "));
            tracing::error!(error = %e, "Mail dispatch rejected");
            return Err(e);
        }

        let host = config.smtp_host.clone();
        let port = config.smtp_port;
        let username = config.username.clone();
        let password = config.password.expose_secret().to_string();
        let target = config.target_email.clone();
        let subject = subject_for(job);
        let body = body_for(job);

        // lettre's SmtpTransport is blocking.
        let result = tokio::task::spawn_blocking(move || {
            send_blocking(&host, port, &username, &password, &target, &subject, &body)
        })
        .await
        .map_err(|e| DispatchError::Unknown(format!("Send task panicked: {e}")))?;

        match &result {
            Ok(()) => tracing::info!(to = %config.target_email, "Email sent"),
            Err(e) => tracing::error!(error = %e, "Email send failed"),
        }
        result
    }
}

fn send_blocking(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    target: &str,
    subject: &str,
    body: &str,
) -> Result<(), DispatchError> {
    let from: Mailbox = username
        .parse()
        .map_err(|e| DispatchError::Protocol(format!("Invalid from address: {e}")))?;
    let to: Mailbox = target
        .parse()
        .map_err(|e| DispatchError::Protocol(format!("Invalid target address: {e}")))?;

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| DispatchError::Protocol(format!("Failed to build message: {e}")))?;

    let transport = SmtpTransport::starttls_relay(host)
        .map_err(classify_smtp)?
        .port(port)
        .credentials(Credentials::new(username.to_string(), password.to_string()))
        .build();

    transport.send(&message).map_err(classify_smtp)?;
    Ok(())
}

/// Map a lettre SMTP error onto the retry taxonomy.
fn classify_smtp(e: lettre::transport::smtp::Error) -> DispatchError {
    if let Some(code) = e.status() {
        let code: u16 = code.to_string().parse().unwrap_or(0);
        // 530/534/535/538: authentication family.
        if matches!(code, 530 | 534 | 535 | 538) {
            return DispatchError::Auth(e.to_string());
        }
        return DispatchError::Protocol(e.to_string());
    }
    // No server reply: connection, DNS, timeout or TLS failure.
    DispatchError::Connection(e.to_string())
}

/// Subject line for a forwarded message.
pub fn subject_for(job: &ForwardJob) -> String {
    format!("New SMS from {}", job.sender)
}

/// Mail body: sender, human-readable receive time, then the message text.
pub fn body_for(job: &ForwardJob) -> String {
    format!(
        "From: {}\nTime: {}\n\n{}",
        job.sender,
        format_timestamp(job.timestamp),
        job.body
    )
}

/// Epoch millis to a readable UTC stamp; falls back to the raw number for
/// out-of-range values.
pub fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}
