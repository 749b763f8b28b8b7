use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::Job;
use tracing::{debug, info, warn};

use crate::memory::ConversationStore;

/// Every five minutes, on the minute
pub const PURGE_SCHEDULE: &str = "0 */5 * * * *";

/// Cron job that drops expired thread mappings on each tick
pub fn purge_job(conversations: Arc<dyn ConversationStore>, schedule: &str) -> Result<Job> {
    Job::new_async(schedule, move |_uuid, _lock| {
        let conversations = conversations.clone();
        Box::pin(async move {
            debug!("Running conversation purge");
            purge_conversations(conversations.as_ref()).await;
        })
    })
    .with_context(|| format!("Invalid purge schedule: {}", schedule))
}

/// Drop expired thread mappings; failures are logged and retried next run
pub async fn purge_conversations(conversations: &dyn ConversationStore) -> usize {
    match conversations.purge_expired().await {
        Ok(0) => 0,
        Ok(n) => {
            info!("Purged {} expired conversation mappings", n);
            n
        }
        Err(e) => {
            warn!("Failed to purge conversations: {:#}", e);
            0
        }
    }
}
