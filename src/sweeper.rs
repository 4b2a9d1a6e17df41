use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::registry::Registry;
use crate::room::{RoomCommand, SweepPolicy};

/// How long a room task gets to answer a sweep before it is skipped this pass.
const SWEEP_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically drop abandoned rooms. Stops on its own once the registry is gone.
pub fn spawn(registry: &Arc<Registry>, every: Duration, policy: SweepPolicy) -> JoinHandle<()> {
    let weak = Arc::downgrade(registry);
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(registry) = weak.upgrade() else {
                break;
            };

            let evicted = sweep_once(&registry, Instant::now(), policy).await;
            if evicted > 0 {
                info!(evicted, remaining = registry.len(), "cleaned up idle rooms");
            } else {
                debug!(rooms = registry.len(), "sweep found nothing to evict");
            }
        }
    })
}

/// One pass: filter on published summaries, then let each candidate decide for itself.
pub async fn sweep_once(registry: &Registry, now: Instant, policy: SweepPolicy) -> usize {
    let threshold = policy.idle_timeout + policy.buffer;
    let mut evicted = 0;

    for (code, handle) in registry.entries() {
        let summary = handle.summary();
        if summary.connected_players > 0
            || summary.has_display
            || now.saturating_duration_since(summary.last_activity) <= threshold
        {
            continue;
        }

        let outcome = handle
            .request(SWEEP_REPLY_TIMEOUT, |reply| RoomCommand::Sweep { now, policy, reply })
            .await;
        match outcome {
            Ok(true) => evicted += 1,
            Ok(false) => debug!(room = %code, "room became active; kept"),
            Err(err) => debug!(room = %code, ?err, "room did not answer sweep"),
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use crate::room::GameSettings;
    use crate::validation::RoomCode;

    const LATER: Duration = Duration::from_secs(2 * 60 * 60);

    fn setup() -> Arc<Registry> {
        Registry::new(GameSettings::default(), Archive::disabled())
    }

    #[tokio::test]
    async fn abandoned_rooms_are_removed() {
        let registry = setup();
        let empty = registry.get_or_create(&RoomCode::parse("ABCD").unwrap());
        let busy = registry.get_or_create(&RoomCode::parse("WXYZ").unwrap());
        busy.request(Duration::from_secs(1), |reply| RoomCommand::JoinPlayer {
            connection_id: "c1".into(),
            name: "Alice".into(),
            reply,
        })
        .await
        .unwrap();

        let evicted = sweep_once(&registry, Instant::now() + LATER, SweepPolicy::default()).await;
        assert_eq!(evicted, 1);
        assert!(registry.get(&empty.code).is_none());
        assert!(registry.get(&busy.code).is_some());
    }

    #[tokio::test]
    async fn recent_rooms_survive() {
        let registry = setup();
        registry.get_or_create(&RoomCode::parse("ABCD").unwrap());

        // Past the timeout but still inside the buffer.
        let policy = SweepPolicy {
            idle_timeout: Duration::from_secs(60),
            buffer: Duration::from_secs(60),
        };
        let evicted = sweep_once(&registry, Instant::now() + Duration::from_secs(90), policy).await;
        assert_eq!(evicted, 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn background_task_runs_on_interval() {
        let registry = setup();
        let policy = SweepPolicy {
            idle_timeout: Duration::ZERO,
            buffer: Duration::ZERO,
        };
        registry.get_or_create(&RoomCode::parse("ABCD").unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let task = spawn(&registry, Duration::from_millis(20), policy);
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registry.is_empty());
        task.abort();
    }
}
