use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Receives confirmed newsletter subscriptions. Called off the request path;
/// errors are logged and never reach the subscriber.
#[async_trait]
pub trait SubscriptionNotifier: Send + Sync {
    async fn subscribed(&self, email: &str) -> Result<()>;
}

/// Records subscriptions in the log. Stand-in for a mail sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl SubscriptionNotifier for LogNotifier {
    async fn subscribed(&self, email: &str) -> Result<()> {
        info!(email, "subscription confirmed, mail delivery not configured");
        Ok(())
    }
}
