//! Recovery after the viewer goes away.

use pulse_session::ConnectionState;

use crate::harness::{TestProducer, TestViewer};

#[tokio::test]
async fn test_reconnects_after_viewer_restart() {
    let first = TestViewer::start(false).await.unwrap();
    let addr = first.handle.local_addr();
    let producer = TestProducer::start(addr);

    producer.wait_streaming().await.unwrap();
    producer.log("to first");
    first.wait_texts(&["to first"]).await.unwrap();

    first.shutdown().await;
    producer.wait_state(ConnectionState::Connecting).await.unwrap();
    // The selection survives the outage
    assert_eq!(producer.snapshot().selected_peer.as_deref(), Some(crate::harness::VIEWER_NAME));

    let second = TestViewer::start_on(&addr.to_string(), false).await.unwrap();
    producer.wait_streaming().await.unwrap();
    producer.log("to second");
    second.wait_texts(&["to second"]).await.unwrap();

    producer.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_keeps_retrying_while_viewer_absent() {
    let viewer = TestViewer::start(false).await.unwrap();
    let addr = viewer.handle.local_addr();
    viewer.shutdown().await;

    let producer = TestProducer::start(addr);
    producer.wait_state(ConnectionState::Connecting).await.unwrap();

    let retry = crate::harness::timing().connection_retry;
    tokio::time::sleep(retry * 4).await;
    assert_eq!(producer.snapshot().state, ConnectionState::Connecting);

    let viewer = TestViewer::start_on(&addr.to_string(), false).await.unwrap();
    producer.wait_streaming().await.unwrap();
    viewer.wait_clients(1).await.unwrap();

    producer.shutdown().await;
    viewer.shutdown().await;
}
