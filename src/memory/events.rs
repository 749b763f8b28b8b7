use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Slack redelivers an unacknowledged event for a few minutes at most
pub const SEEN_EVENT_TTL: Duration = Duration::from_secs(600);

/// Recently delivered event ids, so a redelivery of an event already being
/// handled is not answered twice.
pub struct SeenEvents {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl SeenEvents {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record `event_id`, returning false if it was already seen within the TTL.
    pub async fn first_sighting(&self, event_id: &str) -> bool {
        let mut seen = self.seen.lock().await;
        let ttl = self.ttl;
        seen.retain(|_, at| at.elapsed() <= ttl);
        if seen.contains_key(event_id) {
            return false;
        }
        seen.insert(event_id.to_string(), Instant::now());
        true
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}
