use async_trait::async_trait;
use time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Message handed to the outbound notification channel.
#[derive(Clone)]
pub struct Notification {
    pub recipient: String,
    pub template: &'static str,
    pub user_id: Uuid,
    pub username: String,
    pub activation_token: String,
    pub token_ttl: Duration,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
            .field("recipient", &self.recipient)
            .field("template", &self.template)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &Notification) -> anyhow::Result<()> {
        info!(
            recipient = %message.recipient,
            template = message.template,
            user_id = %message.user_id,
            username = %message.username,
            "notification dispatched"
        );
        // development only: lets a local user activate without an SMTP relay
        debug!(
            user_id = %message.user_id,
            activation_token = %message.activation_token,
            ttl_hours = message.token_ttl.whole_hours(),
            "activation token"
        );
        Ok(())
    }
}
