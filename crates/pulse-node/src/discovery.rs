//! Viewer discovery.
//!
//! `Browser` is the seam a platform service browser (mDNS for `_pulse._tcp`)
//! plugs into. `StaticBrowser` browses a configured list of named viewers,
//! re-resolving them on a fixed refresh interval.

use std::net::SocketAddr;
use std::time::Duration;

use pulse_session::PeerDescriptor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PeerEntry;
use crate::session_task::SessionInput;

#[derive(Debug, Clone, PartialEq)]
pub enum BrowserEvent {
    /// The complete current set of viewers.
    PeersChanged(Vec<PeerDescriptor>),
    /// Browsing stopped. The session decides whether to retry.
    Failed(String),
}

/// Where a browser reports. Tagged with the browse generation so reports
/// from a cancelled browse are discarded.
#[derive(Clone)]
pub struct BrowserSink {
    generation: u64,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl BrowserSink {
    pub fn new(generation: u64, inputs: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { generation, inputs }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session loop is gone.
    pub fn report(&self, event: BrowserEvent) -> bool {
        self.inputs
            .send(SessionInput::Browser {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

pub trait Browser: Send {
    /// Begin browsing. Called again after `cancel` to restart.
    fn start(&mut self, sink: BrowserSink);
    /// Stop browsing. Idempotent.
    fn cancel(&mut self);
}

/// Browses a fixed list of `name = host:port` viewers.
pub struct StaticBrowser {
    entries: Vec<PeerEntry>,
    refresh: Duration,
    task: Option<JoinHandle<()>>,
}

impl StaticBrowser {
    pub fn new(entries: Vec<PeerEntry>, refresh: Duration) -> Self {
        Self {
            entries,
            refresh,
            task: None,
        }
    }
}

impl Browser for StaticBrowser {
    fn start(&mut self, sink: BrowserSink) {
        self.cancel();
        let entries = self.entries.clone();
        let refresh = self.refresh;
        tracing::debug!(
            generation = sink.generation(),
            entries = entries.len(),
            "discovery: browsing"
        );
        self.task = Some(tokio::spawn(browse(entries, refresh, sink)));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for StaticBrowser {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn browse(entries: Vec<PeerEntry>, refresh: Duration, sink: BrowserSink) {
    let mut last: Option<Vec<PeerDescriptor>> = None;

    loop {
        let peers = resolve_all(&entries).await;

        if !entries.is_empty() && peers.is_empty() {
            sink.report(BrowserEvent::Failed("no configured viewer resolved".into()));
            return;
        }

        if last.as_ref() != Some(&peers) {
            tracing::debug!(count = peers.len(), "discovery: peer set changed");
            if !sink.report(BrowserEvent::PeersChanged(peers.clone())) {
                return;
            }
            last = Some(peers);
        }

        tokio::time::sleep(refresh).await;
    }
}

async fn resolve_all(entries: &[PeerEntry]) -> Vec<PeerDescriptor> {
    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        match resolve(&entry.addr).await {
            Some(endpoint) => peers.push(PeerDescriptor::new(entry.name.clone(), endpoint)),
            None => tracing::debug!(peer = %entry.name, addr = %entry.addr, "discovery: unresolved"),
        }
    }
    peers
}

async fn resolve(addr: &str) -> Option<SocketAddr> {
    match tokio::net::lookup_host(addr).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            tracing::trace!(addr, "discovery: lookup failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, addr: &str) -> PeerEntry {
        PeerEntry {
            name: name.into(),
            addr: addr.into(),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<SessionInput>) -> (u64, BrowserEvent) {
        let input = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match input {
            SessionInput::Browser { generation, event } => (generation, event),
            _ => panic!("unexpected input"),
        }
    }

    #[tokio::test]
    async fn test_reports_resolved_peers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut browser = StaticBrowser::new(
            vec![entry("Desk", "127.0.0.1:9481"), entry("Bad", "missing-port")],
            Duration::from_secs(60),
        );
        browser.start(BrowserSink::new(4, tx));

        let (generation, event) = next(&mut rx).await;
        assert_eq!(generation, 4);
        match event {
            BrowserEvent::PeersChanged(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].name, "Desk");
                assert_eq!(peers[0].endpoint.port(), 9481);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        browser.cancel();
    }

    #[tokio::test]
    async fn test_unchanged_set_not_rereported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut browser = StaticBrowser::new(
            vec![entry("Desk", "127.0.0.1:9481")],
            Duration::from_millis(10),
        );
        browser.start(BrowserSink::new(1, tx));
        next(&mut rx).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_all_unresolved_fails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut browser = StaticBrowser::new(
            vec![entry("Bad", "missing-port")],
            Duration::from_secs(60),
        );
        browser.start(BrowserSink::new(2, tx));
        let (_, event) = next(&mut rx).await;
        assert!(matches!(event, BrowserEvent::Failed(_)));
    }

    #[tokio::test]
    async fn test_empty_list_reports_empty_set() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut browser = StaticBrowser::new(Vec::new(), Duration::from_secs(60));
        browser.start(BrowserSink::new(1, tx));
        let (_, event) = next(&mut rx).await;
        assert_eq!(event, BrowserEvent::PeersChanged(Vec::new()));
    }
}
