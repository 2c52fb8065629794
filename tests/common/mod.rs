//! Shared utilities for integration testing.
#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use stream_server::net::{IoStream, SocketLike, Transport};
use stream_server::server::{RequestError, ServerContext, ServerState, StreamHandler};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Await `future`, failing the test if it takes longer than [`WAIT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting")
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// In-memory transport. Clones share state, so a test can keep one handle
/// while the server owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    incoming_tx: mpsc::UnboundedSender<(DuplexStream, SocketAddr)>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>>,
    bound: Mutex<Option<SocketAddr>>,
    closed: watch::Sender<bool>,
    next_port: AtomicU16,
    binds: AtomicUsize,
    listens: AtomicUsize,
    closes: AtomicUsize,
    accepted: AtomicUsize,
    last_backlog: AtomicU32,
    last_reuse: AtomicBool,
    fail_bind: AtomicBool,
    fail_listen: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(MockInner {
                incoming_tx,
                incoming_rx: tokio::sync::Mutex::new(incoming_rx),
                bound: Mutex::new(None),
                closed,
                next_port: AtomicU16::new(40001),
                binds: AtomicUsize::new(0),
                listens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                accepted: AtomicUsize::new(0),
                last_backlog: AtomicU32::new(0),
                last_reuse: AtomicBool::new(false),
                fail_bind: AtomicBool::new(false),
                fail_listen: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a new client connection. Returns the client half and the peer
    /// address the server will see.
    pub fn connect(&self) -> (DuplexStream, SocketAddr) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let peer: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));
        self.inner
            .incoming_tx
            .send((server, peer))
            .expect("mock transport receiver dropped");
        (client, peer)
    }

    pub fn fail_bind(&self, fail: bool) {
        self.inner.fail_bind.store(fail, Ordering::SeqCst);
    }

    pub fn fail_listen(&self, fail: bool) {
        self.inner.fail_listen.store(fail, Ordering::SeqCst);
    }

    pub fn binds(&self) -> usize {
        self.inner.binds.load(Ordering::SeqCst)
    }

    pub fn listens(&self) -> usize {
        self.inner.listens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.inner.accepted.load(Ordering::SeqCst)
    }

    pub fn last_backlog(&self) -> u32 {
        self.inner.last_backlog.load(Ordering::SeqCst)
    }

    pub fn last_reuse(&self) -> bool {
        self.inner.last_reuse.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Stream = DuplexStream;

    fn bind(&self, addr: SocketAddr, reuse_address: bool) -> io::Result<()> {
        self.inner.binds.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_bind.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        }
        self.inner.last_reuse.store(reuse_address, Ordering::SeqCst);
        *self.inner.bound.lock().unwrap() = Some(addr);
        self.inner.closed.send_replace(false);
        Ok(())
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        self.inner.listens.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_listen.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "listen refused"));
        }
        self.inner.last_backlog.store(backlog, Ordering::SeqCst);
        Ok(())
    }

    async fn accept(&self) -> io::Result<(DuplexStream, SocketAddr)> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }

        let mut incoming = self.inner.incoming_rx.lock().await;
        tokio::select! {
            next = incoming.recv() => match next {
                Some(accepted) => {
                    self.inner.accepted.fetch_add(1, Ordering::SeqCst);
                    Ok(accepted)
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "no more connections")),
            },
            _ = closed.wait_for(|closed| *closed) => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
            }
        }
    }

    fn close(&self) {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        *self.inner.bound.lock().unwrap() = None;
        self.inner.closed.send_replace(true);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock().unwrap()
    }
}

/// Hook calls observed by [`RecordingHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Verify,
    Process,
    Error,
    Shutdown,
    Close,
}

/// Shared record of what the server did with each connection.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(SocketAddr, Hook)>>,
    reject: AtomicBool,
    panic_on_verify: AtomicBool,
    hang_on_shutdown: AtomicBool,
    stop_after: AtomicUsize,
    service_calls: AtomicUsize,
    saw_running: AtomicBool,
    saw_secure: AtomicBool,
}

impl Recorder {
    fn record(&self, peer: SocketAddr, hook: Hook) {
        self.events.lock().unwrap().push((peer, hook));
    }

    /// Hooks called for `peer`, in order.
    pub fn hooks(&self, peer: SocketAddr) -> Vec<Hook> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, hook)| *hook)
            .collect()
    }

    pub fn count(&self, hook: Hook) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, h)| *h == hook)
            .count()
    }

    /// Reject every connection from now on.
    pub fn reject_all(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Make `verify_request` panic.
    pub fn panic_on_verify(&self, panic: bool) {
        self.panic_on_verify.store(panic, Ordering::SeqCst);
    }

    /// Make `shutdown_request` never return.
    pub fn hang_on_shutdown(&self, hang: bool) {
        self.hang_on_shutdown.store(hang, Ordering::SeqCst);
    }

    /// Make `service_actions` ask the loop to stop after `n` iterations.
    pub fn stop_after(&self, n: usize) {
        self.stop_after.store(n, Ordering::SeqCst);
    }

    /// Whether `process_request` ever ran while the server reported itself running.
    pub fn saw_running(&self) -> bool {
        self.saw_running.load(Ordering::SeqCst)
    }

    pub fn saw_secure(&self) -> bool {
        self.saw_secure.load(Ordering::SeqCst)
    }
}

/// Handler driven by the first byte the client sends:
///
/// - `e`: fail
/// - `p`: panic
/// - `h`: hang until cancelled
/// - anything else: echo that byte and finish
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub recorder: Arc<Recorder>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S: IoStream> StreamHandler<S> for RecordingHandler {
    fn verify_request(&self, request: &SocketLike<S>) -> bool {
        self.recorder.record(request.peer_addr(), Hook::Verify);
        if self.recorder.panic_on_verify.load(Ordering::SeqCst) {
            panic!("verify_request panicked");
        }
        !self.recorder.reject.load(Ordering::SeqCst)
    }

    async fn process_request(
        &self,
        request: &mut SocketLike<S>,
        server: &ServerContext,
    ) -> Result<(), RequestError> {
        self.recorder.record(request.peer_addr(), Hook::Process);
        if server.lifecycle().started().is_set() && server.state() == ServerState::Running {
            self.recorder.saw_running.store(true, Ordering::SeqCst);
        }
        if server.is_secure() && request.is_secure() {
            self.recorder.saw_secure.store(true, Ordering::SeqCst);
        }

        let mut first = [0u8; 1];
        if request.read(&mut first).await? == 0 {
            return Ok(());
        }
        match first[0] {
            b'e' => Err(RequestError::failed("client asked for a failure")),
            b'p' => panic!("client asked for a panic"),
            b'h' => {
                std::future::pending::<()>().await;
                Ok(())
            }
            byte => {
                request.write_all(&[byte]).await?;
                request.flush().await?;
                Ok(())
            }
        }
    }

    async fn handle_error(&self, request: &mut SocketLike<S>, _error: &RequestError) {
        self.recorder.record(request.peer_addr(), Hook::Error);
    }

    async fn shutdown_request(&self, request: &mut SocketLike<S>) {
        self.recorder.record(request.peer_addr(), Hook::Shutdown);
        if self.recorder.hang_on_shutdown.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    async fn close_request(&self, request: &mut SocketLike<S>) {
        self.recorder.record(request.peer_addr(), Hook::Close);
        let _ = request.close().await;
    }

    fn service_actions(&self) -> bool {
        let calls = self.recorder.service_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.recorder.stop_after.load(Ordering::SeqCst);
        limit == 0 || calls < limit
    }
}

/// Send one byte and return what comes back before EOF.
pub async fn exchange<S>(client: &mut S, byte: u8) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    client.write_all(&[byte]).await.unwrap();
    client.flush().await.unwrap();
    let mut received = Vec::new();
    within(client.read_to_end(&mut received)).await.unwrap();
    received
}
