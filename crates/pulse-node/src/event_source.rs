//! Forwards everything the local store persists into the session.

use pulse_protocol::LogEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::session_task::SessionHandle;

/// Spawn the forwarder. It stops when the store's channel closes or the
/// session loop goes away.
pub fn spawn_event_forwarder(
    events: broadcast::Receiver<LogEvent>,
    session: SessionHandle,
) -> JoinHandle<()> {
    tokio::spawn(run_event_forwarder(events, session))
}

pub async fn run_event_forwarder(mut events: broadcast::Receiver<LogEvent>, session: SessionHandle) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if !session.record(event) {
                    tracing::debug!("events: session gone, forwarder stopping");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "events: forwarder lagged, events not forwarded");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("events: store channel closed");
                return;
            }
        }
    }
}
