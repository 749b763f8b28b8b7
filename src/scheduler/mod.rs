pub mod tasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

use crate::memory::ConversationStore;

/// Background housekeeping for the conversation store.
///
/// Runs the expiry purge on a cron schedule until shut down.
pub struct Housekeeping {
    inner: JobScheduler,
}

impl Housekeeping {
    /// Register the purge job on `schedule` and start running it.
    pub async fn start(conversations: Arc<dyn ConversationStore>, schedule: &str) -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;

        inner
            .add(tasks::purge_job(conversations, schedule)?)
            .await
            .context("Failed to add conversation purge job")?;
        inner
            .start()
            .await
            .context("Failed to start housekeeping")?;

        info!("Conversation purge scheduled with cron: {}", schedule);
        Ok(Self { inner })
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to stop housekeeping")?;
        info!("Housekeeping stopped");
        Ok(())
    }
}
