//! Helpers for timing-sensitive mesh tests
//!
//! Mesh tests wait on broadcast events rather than sleeping; these helpers
//! bound the waits and stretch them on CI machines.

use std::time::Duration;

use tokio::sync::broadcast;
use weft_mesh::NodeEvent;

/// Base wait for one mesh event
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Check if running in a CI environment
///
/// Checks common CI environment variables.
pub fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
}

/// Get CI-adjusted timeout duration
///
/// Returns a timeout that's longer in CI environments to account for
/// resource contention and slower machines.
pub fn ci_timeout(base_timeout: Duration) -> Duration {
    if is_ci_environment() {
        base_timeout.mul_f32(3.0)
    } else {
        base_timeout
    }
}

/// Wait for the first event `pick` maps to `Some`.
///
/// Returns `None` on timeout or once the node has stopped. Lagged
/// subscribers skip ahead.
pub async fn wait_for<T>(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut pick: impl FnMut(&NodeEvent) -> Option<T>,
) -> Option<T> {
    tokio::time::timeout(ci_timeout(EVENT_WAIT), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return Some(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::PeerId;

    #[test]
    fn test_ci_timeout() {
        let base = Duration::from_secs(10);
        let adjusted = ci_timeout(base);

        if is_ci_environment() {
            assert_eq!(adjusted, Duration::from_secs(30));
        } else {
            assert_eq!(adjusted, base);
        }
    }

    #[tokio::test]
    async fn test_wait_for_skips_unrelated_events() {
        let (tx, mut rx) = broadcast::channel(8);
        let wanted = PeerId::random();
        tx.send(NodeEvent::PeerConnected {
            peer: PeerId::random(),
        })
        .unwrap();
        tx.send(NodeEvent::PeerClosed { peer: wanted }).unwrap();

        let found = wait_for(&mut rx, |e| match e {
            NodeEvent::PeerClosed { peer } => Some(*peer),
            _ => None,
        })
        .await;
        assert_eq!(found, Some(wanted));
    }

    #[tokio::test]
    async fn test_wait_for_ends_when_sender_drops() {
        let (tx, mut rx) = broadcast::channel::<NodeEvent>(8);
        drop(tx);
        assert_eq!(wait_for(&mut rx, |_| Some(())).await, None);
    }
}
