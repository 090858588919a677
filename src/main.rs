use std::sync::Arc;
use std::time::Duration;

use sms_forwarder::dispatch::SmtpDispatcher;
use sms_forwarder::events::LogBus;
use sms_forwarder::inbox::{MessageInbox, SqlInbox};
use sms_forwarder::pipeline::Pipeline;
use sms_forwarder::queue::RetryPolicy;
use sms_forwarder::store::{LibSqlStore, Store, keys};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let store_path = std::env::var("SMS_FORWARDER_DB")
        .unwrap_or_else(|_| "./data/forwarder.db".to_string());
    let inbox_path = std::env::var("SMS_FORWARDER_INBOX")
        .unwrap_or_else(|_| "./data/inbox.db".to_string());
    let poll_interval_secs: u64 = std::env::var("SMS_FORWARDER_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);

    eprintln!("📨 SMS Forwarder v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Store: {store_path}");
    eprintln!("   Inbox: {inbox_path}");

    let store: Arc<dyn Store> =
        Arc::new(LibSqlStore::new_local(std::path::Path::new(&store_path)).await?);
    let inbox: Arc<dyn MessageInbox> =
        Arc::new(SqlInbox::open(std::path::Path::new(&inbox_path)).await?);

    // Settings come from the out-of-scope control surface; environment
    // variables stand in for it here.
    seed_settings_from_env(&store).await?;

    let events = LogBus::default();

    // Mirror the event feed to stderr (the UI's log pane).
    let mut feed = events.subscribe();
    tokio::spawn(async move {
        while let Ok(line) = feed.recv().await {
            eprintln!("{line}");
        }
    });

    let pipeline = Pipeline::build(
        Arc::clone(&store),
        Arc::clone(&inbox),
        Arc::new(SmtpDispatcher),
        events,
        RetryPolicy::default(),
    );

    if std::env::var("SMS_FORWARDER_AUTOSTART").as_deref() == Ok("1") {
        pipeline.control.start().await?;
    }

    // Restart hook: resume if the flag survived the last process life.
    pipeline.resume_if_running().await?;

    let _watcher = pipeline.spawn_watcher(inbox, Duration::from_secs(poll_interval_secs));

    tokio::signal::ctrl_c().await?;
    eprintln!("Shutting down");
    // The run flag stays persisted: the next start resumes automatically.
    pipeline.shutdown();
    Ok(())
}

/// Copy mail settings from the environment into the persisted store.
async fn seed_settings_from_env(store: &Arc<dyn Store>) -> anyhow::Result<()> {
    let vars = [
        ("SMS_FORWARDER_TARGET_EMAIL", keys::TARGET_EMAIL),
        ("SMS_FORWARDER_SMTP_HOST", keys::SMTP_HOST),
        ("SMS_FORWARDER_SMTP_PORT", keys::SMTP_PORT),
        ("SMS_FORWARDER_USERNAME", keys::USERNAME),
        ("SMS_FORWARDER_PASSWORD", keys::PASSWORD),
    ];
    for (var, key) in vars {
        if let Ok(value) = std::env::var(var) {
            store.set(key, &value).await?;
        }
    }
    Ok(())
}
