//! Common test utilities for `OpPush` integration tests.
//!
//! Provides a scripted in-process OBEX peer, a connector that hands out
//! in-memory transports, and a listener that records every callback.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use oppush_core::obex::{
    header_id, read_request, write_packet, ConnectFields, HeaderSet, Opcode, Packet, ResponseCode,
};
use oppush_core::share::{ShareHandle, ShareStatus};
use oppush_core::transfer::{ConnectOutcome, DisconnectReason, TransferListener};
use oppush_core::transport::{ConnectTarget, ObexTransport, TransportConnector};
use oppush_core::{Error, Result};

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// How the fake peer answers.
#[derive(Debug, Clone, Copy)]
pub enum PeerScript {
    /// Accept every object
    AcceptAll,
    /// Answer the first PUT packet with this code, then accept everything
    RefuseFirstPut(ResponseCode),
    /// Answer the n-th PUT packet (1-based) with this code, then accept everything
    RefuseNthPut(usize, ResponseCode),
    /// Accept every body packet but answer the final one with this code
    FinalCode(ResponseCode),
    /// Stop answering after this many body packets
    StallAfterBodies(usize),
}

/// One object as the peer received it.
#[derive(Debug, Clone, Default)]
pub struct ReceivedObject {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub length: Option<u32>,
    pub body: Vec<u8>,
    pub complete: bool,
}

/// Everything the peer saw.
#[derive(Debug, Clone, Default)]
pub struct PeerLog {
    pub count_hint: Option<u32>,
    pub objects: Vec<ReceivedObject>,
    pub aborts: usize,
    pub disconnected: bool,
}

/// A scripted OBEX server on the far end of a duplex stream.
pub struct FakePeer {
    pub max_packet_size: u16,
    pub script: PeerScript,
    pub stalled: Arc<Notify>,
}

impl FakePeer {
    pub fn new(script: PeerScript) -> Self {
        Self {
            max_packet_size: 0xFFFE,
            script,
            stalled: Arc::new(Notify::new()),
        }
    }

    pub fn with_max_packet_size(mut self, max: u16) -> Self {
        self.max_packet_size = max;
        self
    }

    /// Open an in-memory channel: the client transport and the running peer.
    pub fn spawn(self) -> (ObexTransport, JoinHandle<PeerLog>) {
        let (client_io, server_io) = tokio::io::duplex(1 << 18);
        let task = tokio::spawn(self.serve(server_io));
        (ObexTransport::new(client_io, "fake-peer"), task)
    }

    /// Serve until the client goes away.
    pub async fn serve(self, mut io: DuplexStream) -> PeerLog {
        let mut log = PeerLog::default();
        let mut current: Option<ReceivedObject> = None;
        let mut refused = false;
        let mut bodies = 0usize;
        let mut puts = 0usize;
        let mut stalled = false;

        while let Ok(request) = read_request(&mut io).await {
            if stalled {
                continue;
            }

            let has_body = request.headers.get(header_id::BODY).is_some()
                || request.headers.get(header_id::END_OF_BODY).is_some();

            let code = match request.opcode() {
                Some(Opcode::Connect) => {
                    log.count_hint = request.headers.count();
                    let response = Packet {
                        code: ResponseCode::Ok.to_byte(),
                        connect: Some(ConnectFields::new(self.max_packet_size)),
                        headers: HeaderSet::new(),
                    };
                    if write_packet(&mut io, &response).await.is_err() {
                        break;
                    }
                    continue;
                }
                Some(Opcode::Disconnect) => {
                    log.disconnected = true;
                    ResponseCode::Ok
                }
                Some(Opcode::Abort) => {
                    log.aborts += 1;
                    current = None;
                    ResponseCode::Ok
                }
                Some(opcode @ (Opcode::Put | Opcode::PutFinal)) => {
                    let object = current.get_or_insert_with(ReceivedObject::default);
                    if let Some(name) = request.headers.name() {
                        object.name = Some(name.to_string());
                    }
                    if let Some(mime) = request.headers.mime_type() {
                        object.mime_type = Some(mime.to_string());
                    }
                    if let Some(length) = request.headers.length() {
                        object.length = Some(length);
                    }
                    object.body.extend(request.headers.body());

                    if has_body {
                        bodies += 1;
                    }
                    puts += 1;

                    match self.script {
                        PeerScript::RefuseFirstPut(code) if !refused => {
                            refused = true;
                            current = None;
                            code
                        }
                        PeerScript::RefuseNthPut(n, code) if !refused && puts == n => {
                            refused = true;
                            if let Some(object) = current.take() {
                                log.objects.push(object);
                            }
                            code
                        }
                        PeerScript::FinalCode(code) if opcode == Opcode::PutFinal => {
                            if let Some(object) = current.take() {
                                log.objects.push(object);
                            }
                            code
                        }
                        PeerScript::StallAfterBodies(n) if has_body && bodies >= n => {
                            stalled = true;
                            self.stalled.notify_one();
                            continue;
                        }
                        _ if opcode == Opcode::PutFinal => {
                            if let Some(mut object) = current.take() {
                                object.complete = true;
                                log.objects.push(object);
                            }
                            ResponseCode::Ok
                        }
                        _ => ResponseCode::Continue,
                    }
                }
                None => ResponseCode::Other(ResponseCode::BAD_REQUEST),
            };

            if write_packet(&mut io, &Packet::response(code, HeaderSet::new()))
                .await
                .is_err()
            {
                break;
            }
        }

        if let Some(object) = current {
            log.objects.push(object);
        }
        log
    }
}

/// Hands out in-memory transports, optionally failing first.
pub struct MockConnector {
    failures: Mutex<VecDeque<String>>,
    script: PeerScript,
    max_packet_size: u16,
    pub attempts: AtomicUsize,
    pub stalled: Arc<Notify>,
    peer: Mutex<Option<JoinHandle<PeerLog>>>,
    hang: bool,
}

impl MockConnector {
    pub fn new(script: PeerScript) -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            script,
            max_packet_size: 0xFFFE,
            attempts: AtomicUsize::new(0),
            stalled: Arc::new(Notify::new()),
            peer: Mutex::new(None),
            hang: false,
        }
    }

    /// Fail the next attempts with these messages, in order.
    pub fn failing_with(self, messages: &[&str]) -> Self {
        *self.failures.lock().unwrap() = messages.iter().map(ToString::to_string).collect();
        self
    }

    /// Never complete a connect.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn with_max_packet_size(mut self, max: u16) -> Self {
        self.max_packet_size = max;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the peer to see the client go away and return its log.
    pub async fn peer_log(&self) -> PeerLog {
        let task = self.peer.lock().unwrap().take().expect("no peer was started");
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("peer did not finish")
            .expect("peer panicked")
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, _target: &ConnectTarget) -> Result<ObexTransport> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(message) = self.failures.lock().unwrap().pop_front() {
            return Err(Error::Connect(message));
        }

        let peer = FakePeer {
            max_packet_size: self.max_packet_size,
            script: self.script,
            stalled: Arc::clone(&self.stalled),
        };
        let (transport, task) = peer.spawn();
        *self.peer.lock().unwrap() = Some(task);
        Ok(transport)
    }
}

/// A recorded listener callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(ConnectOutcome),
    Disconnect(DisconnectReason),
    Start(Uuid, u64),
    Progress(Uuid, u64),
    Timeout(Uuid),
    Failed(Option<Uuid>, ShareStatus),
    Success(Uuid),
}

impl Call {
    /// Whether this is a terminal callback for `id`.
    pub fn is_terminal_for(&self, id: Uuid) -> bool {
        match self {
            Self::Timeout(share) | Self::Success(share) => *share == id,
            Self::Failed(share, _) => *share == Some(id),
            _ => false,
        }
    }
}

/// Records every callback in order.
#[derive(Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<Call>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    /// Poll until `predicate` holds for the recorded calls.
    pub async fn wait_for(&self, predicate: impl Fn(&[Call]) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            while !predicate(&self.calls()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out, calls: {:?}", self.calls());
    }

    pub fn terminal_count(&self, id: Uuid) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.is_terminal_for(id))
            .count()
    }
}

impl TransferListener for RecordingListener {
    fn on_connect(&self, outcome: &ConnectOutcome) {
        self.record(Call::Connect(outcome.clone()));
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        self.record(Call::Disconnect(reason));
    }

    fn on_transfer_start(&self, share: &ShareHandle, total: u64) {
        self.record(Call::Start(share.id(), total));
    }

    fn on_transfer_progress(&self, share: &ShareHandle, sent: u64) {
        self.record(Call::Progress(share.id(), sent));
    }

    fn on_share_timeout(&self, share: &ShareHandle) {
        self.record(Call::Timeout(share.id()));
    }

    fn on_share_failed(&self, share: Option<&ShareHandle>, reason: ShareStatus) {
        self.record(Call::Failed(share.map(|s| s.id()), reason));
    }

    fn on_share_success(&self, share: &ShareHandle) {
        self.record(Call::Success(share.id()));
    }
}
