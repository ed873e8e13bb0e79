//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tls_echo_server::config::{PipelineMode, ServerConfig, TlsConfig};
use tls_echo_server::net::ClientId;
use tls_echo_server::observability::{ClientEvent, ErrorEvent, EventSink, ServerEvent};

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Self-signed certificate for `localhost`, written to a scratch directory.
pub struct TlsMaterial {
    pub config: TlsConfig,
    pub cert: CertificateDer<'static>,
    dir: PathBuf,
}

impl Drop for TlsMaterial {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn tls_material() -> TlsMaterial {
    let dir = std::env::temp_dir().join(format!(
        "tls-echo-it-{}-{}",
        std::process::id(),
        SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("server.crt");
    let key_path = dir.join("server.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    TlsMaterial {
        config: TlsConfig {
            cert_path: cert_path.display().to_string(),
            key_path: key_path.display().to_string(),
            client_ca_path: None,
            require_client_cert: false,
        },
        cert: cert.der().clone(),
        dir,
    }
}

/// Loopback config on an ephemeral port.
pub fn server_config(tls: &TlsMaterial, pipeline: PipelineMode) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.bind_ip = "127.0.0.1".into();
    config.server.port = 0;
    config.server.worker_threads = 2;
    config.server.pipeline = pipeline;
    config.tls = tls.config.clone();
    config.timeouts.handshake_secs = 5;
    config.timeouts.shutdown_grace_secs = 2;
    config
}

/// Runtime for the client side; the server brings its own.
pub fn client_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

pub fn connector(tls: &TlsMaterial) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(tls.cert.clone()).unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub async fn connect(addr: SocketAddr, connector: &TlsConnector) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let domain = ServerName::try_from("localhost").unwrap();
    connector.connect(domain, tcp).await
}

/// Read until the server closes, tolerating a missing close_notify.
pub async fn read_until_closed<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Server(ServerEvent),
    Client(ClientId, ClientEvent),
    Error(ErrorEvent),
    Received(ClientId, Vec<u8>),
    Sent(ClientId, Vec<u8>),
}

/// Sink that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn accepted_ids(&self) -> Vec<ClientId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Client(id, ClientEvent::Accepted { .. }) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn count_client_events(&self, id: ClientId, wanted: &ClientEvent) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Recorded::Client(i, ev) if *i == id && ev == wanted))
            .count()
    }

    pub fn writes_to(&self, id: ClientId) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Sent(i, bytes) if i == id => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn has_server_event(&self, predicate: impl Fn(&ServerEvent) -> bool) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, Recorded::Server(ev) if predicate(ev)))
    }
}

impl EventSink for RecordingSink {
    fn server_event(&self, event: ServerEvent) {
        self.push(Recorded::Server(event));
    }

    fn client_event(&self, client: ClientId, event: ClientEvent) {
        self.push(Recorded::Client(client, event));
    }

    fn error_event(&self, event: ErrorEvent) {
        self.push(Recorded::Error(event));
    }

    fn received(&self, client: ClientId, content: &[u8]) {
        self.push(Recorded::Received(client, content.to_vec()));
    }

    fn sent(&self, client: ClientId, content: &[u8]) {
        self.push(Recorded::Sent(client, content.to_vec()));
    }
}
