//! End-to-end sessions over TLS against a running server.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{Recorded, RecordingSink};
use tls_echo_server::config::PipelineMode;
use tls_echo_server::observability::{ClientEvent, ErrorStage, ServerEvent};
use tls_echo_server::TlsServer;

const SETTLE: Duration = Duration::from_secs(5);

#[test]
fn aggregate_session_flushes_once_after_half_close() {
    let tls = common::tls_material();
    let sink = Arc::new(RecordingSink::default());
    let mut server = TlsServer::with_sink(
        common::server_config(&tls, PipelineMode::Aggregate),
        sink.clone(),
    );
    let addr = server.start().unwrap();
    let connector = common::connector(&tls);

    let received = common::client_runtime().block_on(async {
        let mut stream = common::connect(addr, &connector).await.unwrap();
        stream.write_all(b"xyz").await.unwrap();
        stream.shutdown().await.unwrap();
        common::read_until_closed(&mut stream).await
    });
    assert_eq!(received, b"xyz");

    let ids = sink.accepted_ids();
    assert_eq!(ids.len(), 1);
    let id = ids[0];
    assert!(common::wait_for(SETTLE, || {
        sink.count_client_events(id, &ClientEvent::Closed) == 1
    }));

    let registry = Arc::clone(server.registry());
    assert_eq!(registry.active_ids(), 0);
    assert_eq!(registry.active_connections(), 0);
    assert_eq!(sink.writes_to(id), vec![b"xyz".to_vec()]);
    assert_eq!(sink.count_client_events(id, &ClientEvent::HandshakeSucceeded), 1);
    assert!(registry.pending_message(id).is_empty());
}

#[test]
fn echo_session_answers_every_message() {
    let tls = common::tls_material();
    let mut server = TlsServer::new(common::server_config(&tls, PipelineMode::Echo));
    let addr = server.start().unwrap();
    let connector = common::connector(&tls);

    common::client_runtime().block_on(async {
        let mut stream = common::connect(addr, &connector).await.unwrap();
        for message in [&b"ping"[..], b"second message", b"x"] {
            stream.write_all(message).await.unwrap();
            let mut reply = vec![0u8; message.len()];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, message);
        }
        stream.shutdown().await.unwrap();
        assert!(common::read_until_closed(&mut stream).await.is_empty());
    });

    let registry = Arc::clone(server.registry());
    assert!(common::wait_for(SETTLE, || registry.active_ids() == 0));
}

#[test]
fn concurrent_clients_get_distinct_ids() {
    const CLIENTS: usize = 32;

    let tls = common::tls_material();
    let sink = Arc::new(RecordingSink::default());
    let mut server = TlsServer::with_sink(
        common::server_config(&tls, PipelineMode::Aggregate),
        sink.clone(),
    );
    let addr = server.start().unwrap();
    let connector = common::connector(&tls);

    common::client_runtime().block_on(async {
        let mut tasks = Vec::new();
        for i in 0..CLIENTS {
            let connector = connector.clone();
            tasks.push(tokio::spawn(async move {
                let payload = format!("client-{i}").into_bytes();
                let mut stream = common::connect(addr, &connector).await.unwrap();
                stream.write_all(&payload).await.unwrap();
                stream.shutdown().await.unwrap();
                assert_eq!(common::read_until_closed(&mut stream).await, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    });

    let ids = sink.accepted_ids();
    assert_eq!(ids.len(), CLIENTS);
    let distinct: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), CLIENTS);
    assert!(common::wait_for(SETTLE, || {
        ids.iter()
            .all(|id| sink.count_client_events(*id, &ClientEvent::Closed) == 1)
    }));

    let registry = Arc::clone(server.registry());
    assert_eq!(registry.active_ids(), 0);
    assert_eq!(registry.active_connections(), 0);
    for id in ids {
        assert_eq!(sink.writes_to(id).len(), 1);
    }
}

#[test]
fn failed_handshake_releases_id_without_counting() {
    let tls = common::tls_material();
    let sink = Arc::new(RecordingSink::default());
    let mut server = TlsServer::with_sink(
        common::server_config(&tls, PipelineMode::Aggregate),
        sink.clone(),
    );
    let addr = server.start().unwrap();

    common::client_runtime().block_on(async {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        common::read_until_closed(&mut stream).await;
    });

    let ids = sink.accepted_ids();
    assert_eq!(ids.len(), 1);
    let id = ids[0];
    assert!(common::wait_for(SETTLE, || {
        sink.count_client_events(id, &ClientEvent::Closed) == 1
    }));

    let registry = Arc::clone(server.registry());
    assert_eq!(registry.active_ids(), 0);
    assert_eq!(registry.active_connections(), 0);
    assert_eq!(sink.count_client_events(id, &ClientEvent::HandshakeSucceeded), 0);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        Recorded::Error(err) if err.stage == ErrorStage::Handshake && err.client == Some(id)
    )));
}

#[test]
fn silent_client_is_cut_off_by_handshake_timeout() {
    let tls = common::tls_material();
    let mut config = common::server_config(&tls, PipelineMode::Aggregate);
    config.timeouts.handshake_secs = 1;
    let sink = Arc::new(RecordingSink::default());
    let mut server = TlsServer::with_sink(config, sink.clone());
    let addr = server.start().unwrap();

    common::client_runtime().block_on(async {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let closed = tokio::time::timeout(SETTLE, common::read_until_closed(&mut stream)).await;
        assert!(closed.is_ok(), "server kept a silent connection open");
    });

    let registry = Arc::clone(server.registry());
    assert!(common::wait_for(SETTLE, || registry.active_ids() == 0));
    assert_eq!(registry.active_connections(), 0);
}

#[test]
fn open_sessions_are_closed_by_shutdown() {
    let tls = common::tls_material();
    let sink = Arc::new(RecordingSink::default());
    let mut server = TlsServer::with_sink(
        common::server_config(&tls, PipelineMode::Aggregate),
        sink.clone(),
    );
    let addr = server.start().unwrap();
    let connector = common::connector(&tls);
    let client = common::client_runtime();

    let mut stream = client.block_on(async {
        let mut stream = common::connect(addr, &connector).await.unwrap();
        stream.write_all(b"pending").await.unwrap();
        stream
    });
    let registry = Arc::clone(server.registry());
    assert!(common::wait_for(SETTLE, || registry.active_connections() == 1));

    server.shutdown();

    assert!(!server.is_running());
    assert_eq!(registry.active_ids(), 0);
    assert_eq!(registry.active_connections(), 0);
    assert!(sink.has_server_event(|e| matches!(e, ServerEvent::Stopped { .. })));

    let leftover = client.block_on(common::read_until_closed(&mut stream));
    assert!(leftover.is_empty());
}

#[test]
fn worker_count_is_floored() {
    let tls = common::tls_material();
    let mut config = common::server_config(&tls, PipelineMode::Echo);
    config.server.worker_threads = 0;
    assert_eq!(config.server.effective_worker_threads(), 2);

    let mut server = TlsServer::new(config);
    let addr = server.start().unwrap();
    let connector = common::connector(&tls);
    let echoed = common::client_runtime().block_on(async {
        let mut stream = common::connect(addr, &connector).await.unwrap();
        stream.write_all(b"floor").await.unwrap();
        stream.shutdown().await.unwrap();
        common::read_until_closed(&mut stream).await
    });
    assert_eq!(echoed, b"floor");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_running_server_inside_a_runtime_stops_it() {
    let tls = common::tls_material();
    let sink = Arc::new(RecordingSink::default());
    let mut server = TlsServer::with_sink(
        common::server_config(&tls, PipelineMode::Aggregate),
        sink.clone(),
    );
    let addr = server.start().unwrap();
    let registry = Arc::clone(server.registry());

    drop(server);

    assert!(sink.has_server_event(|e| matches!(e, ServerEvent::Stopped { .. })));
    assert_eq!(registry.active_ids(), 0);

    let mut refused = false;
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "listener still open after drop");
}
