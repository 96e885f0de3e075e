use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::peer::PeerConnectionCoordinator;
use crate::session_store::PersistedParticipant;

const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAttempt {
    pub peer_id: String,
    pub delay: Duration,
}

/// One attempt per remembered remote peer, each delayed by a random amount
/// in `0..=jitter`. Local entries and `self_id` are skipped.
pub fn plan<R: Rng>(
    persisted: &[PersistedParticipant],
    self_id: &str,
    jitter: Duration,
    rng: &mut R,
) -> Vec<ScheduledAttempt> {
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    let mut seen = HashSet::new();
    persisted
        .iter()
        .filter(|p| !p.is_local && p.id != self_id)
        .filter(|p| seen.insert(p.id.as_str()))
        .map(|p| ScheduledAttempt {
            peer_id: p.id.clone(),
            delay: Duration::from_millis(rng.gen_range(0..=jitter_ms)),
        })
        .collect()
}

/// Runs every attempt on its own task. Each waits out its delay, then polls
/// the coordinator every `retry_interval` until it is ready and connects
/// exactly once. Setting `cancel` to `true` abandons whatever is still pending.
pub fn spawn(
    attempts: Vec<ScheduledAttempt>,
    coordinator: Arc<PeerConnectionCoordinator>,
    retry_interval: Duration,
    cancel: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    if !attempts.is_empty() {
        info!(peers = attempts.len(), "scheduling reconnection to remembered peers");
    }
    attempts
        .into_iter()
        .map(|attempt| {
            let coordinator = Arc::clone(&coordinator);
            let mut cancel = cancel.clone();
            tokio::spawn(async move {
                let peer_id = attempt.peer_id.clone();
                tokio::select! {
                    _ = cancelled(&mut cancel) => {
                        debug!(%peer_id, "reconnection cancelled");
                    }
                    _ = run(attempt, coordinator, retry_interval) => {}
                }
            })
        })
        .collect()
}

async fn run(
    attempt: ScheduledAttempt,
    coordinator: Arc<PeerConnectionCoordinator>,
    retry_interval: Duration,
) {
    tokio::time::sleep(attempt.delay).await;

    let mut ticker = tokio::time::interval(retry_interval.max(MIN_RETRY_INTERVAL));
    loop {
        ticker.tick().await;
        if coordinator.is_ready() {
            break;
        }
        trace!(peer_id = %attempt.peer_id, "coordinator not ready, retrying");
    }

    match coordinator.create_connection_with(&attempt.peer_id).await {
        Ok(()) => info!(peer_id = %attempt.peer_id, "reconnection attempted"),
        Err(e) => warn!(peer_id = %attempt.peer_id, error = %e, "reconnection failed"),
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
