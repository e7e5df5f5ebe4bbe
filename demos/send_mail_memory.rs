//! Single-process send_mail round trip on the in-memory broker.
//!
//! One full-duplex node both issues the request and serves it with a
//! `LogMailer`.
//!
//! Run with: RUST_LOG=info cargo run --example send_mail_memory

use std::sync::Arc;
use std::time::Duration;

use mailbus::{LogMailer, Mail, MessagingCoreBuilder, Result, TransportBuilder};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let transport = TransportBuilder::new()
        .uri("memory://")
        .transport_id("demo")
        .build()
        .await?;

    let core = MessagingCoreBuilder::new(transport)
        .full_duplex()
        .mailer(Arc::new(LogMailer))
        .request_timeout(Duration::from_secs(2))
        .start()
        .await?;

    let mail = Mail {
        to: "user@example.com".into(),
        from: "noreply@example.com".into(),
        subject: "Reset your password".into(),
        body: "Follow the link below to choose a new password.".into(),
        email: "accounts@example.com".into(),
    };

    core.client()?.send_mail(&mail).await?;
    println!("mail to {} delivered", mail.to);

    core.shutdown().await
}
