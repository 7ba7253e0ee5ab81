//! Push, pull, request and reply sockets over TCP.
//!
//! Frames are newline-delimited JSON. Bound sockets accept any number of
//! peers on a background thread and release their port on drop.

use super::endpoint::Endpoint;
use crate::error::{FarmError, Result};
use crate::ipc::{LineReader, LineWriter, decode_frame, encode_frame};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a bound socket polls for new peers.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Pause between connection attempts to a peer that is not listening yet.
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// How long connecting sockets keep retrying.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

enum Frame {
    Line(String),
    Closed,
}

fn bind_listener(endpoint: &Endpoint) -> Result<(TcpListener, Endpoint)> {
    let listener = TcpListener::bind(endpoint.socket_addr()?)
        .map_err(|e| FarmError::Transport(format!("cannot bind {}: {}", endpoint, e)))?;
    listener.set_nonblocking(true)?;
    let local = endpoint.with_port(listener.local_addr()?.port());
    Ok((listener, local))
}

fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)
}

/// Connect, retrying while the peer refuses until `timeout` elapses.
fn connect_with_retry(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    let addr = endpoint.socket_addr()?;
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect_timeout(&addr, timeout.max(CONNECT_RETRY)) {
            Ok(stream) => {
                prepare_stream(&stream)?;
                return Ok(stream);
            }
            Err(e) if Instant::now() < deadline => {
                tracing::trace!(endpoint = %endpoint, error = %e, "peer not ready, retrying");
                thread::sleep(CONNECT_RETRY);
            }
            Err(e) => {
                return Err(FarmError::Transport(format!(
                    "cannot connect to {}: {}",
                    endpoint, e
                )));
            }
        }
    }
}

fn spawn_acceptor<F>(
    name: &str,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    mut on_peer: F,
) -> Result<JoinHandle<()>>
where
    F: FnMut(TcpStream) + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(e) = prepare_stream(&stream) {
                            tracing::warn!(peer = %addr, error = %e, "dropping peer");
                            continue;
                        }
                        tracing::debug!(peer = %addr, "accepted connection");
                        on_peer(stream);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        })?;
    Ok(handle)
}

/// Forward every line of `stream` into `tx`; post `Closed` at EOF if asked.
fn spawn_reader(stream: TcpStream, tx: Sender<Frame>, eof_closes: bool) -> io::Result<()> {
    thread::Builder::new()
        .name("pull-reader".to_string())
        .spawn(move || {
            let mut reader = LineReader::new(stream);
            loop {
                match reader.read_line() {
                    Ok(Some(line)) => {
                        if tx.send(Frame::Line(line.to_owned())).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "peer read failed");
                        break;
                    }
                }
            }
            if eof_closes {
                let _ = tx.send(Frame::Closed);
            }
        })?;
    Ok(())
}

/// Interrupts a blocked [`PullSocket::recv`] from another thread.
#[derive(Clone)]
pub struct SocketCloser {
    tx: Sender<Frame>,
    shutdown: Arc<AtomicBool>,
}

impl SocketCloser {
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.tx.send(Frame::Closed);
    }
}

/// Receiving end of a pipeline.
///
/// A bound pull fans in from any number of peers; a connected pull reads a
/// single upstream and closes when it goes away.
pub struct PullSocket {
    rx: Receiver<Frame>,
    tx: Sender<Frame>,
    shutdown: Arc<AtomicBool>,
    peers: Arc<Mutex<Vec<TcpStream>>>,
    acceptor: Option<JoinHandle<()>>,
    local: Option<Endpoint>,
}

impl PullSocket {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let (listener, local) = bind_listener(endpoint)?;
        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let peers = Arc::new(Mutex::new(Vec::new()));

        let peer_tx = tx.clone();
        let peer_list = Arc::clone(&peers);
        let acceptor = spawn_acceptor("pull-acceptor", listener, shutdown.clone(), move |stream| {
            match stream.try_clone() {
                Ok(clone) => peer_list
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(clone),
                Err(e) => tracing::warn!(error = %e, "cannot track peer"),
            }
            if let Err(e) = spawn_reader(stream, peer_tx.clone(), false) {
                tracing::warn!(error = %e, "cannot spawn peer reader");
            }
        })?;

        tracing::debug!(endpoint = %local, "pull socket bound");
        Ok(Self {
            rx,
            tx,
            shutdown,
            peers,
            acceptor: Some(acceptor),
            local: Some(local),
        })
    }

    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_timeout(endpoint, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Connect, retrying for at most `timeout` while the peer is not up.
    pub fn connect_timeout(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let stream = connect_with_retry(endpoint, timeout)?;
        let (tx, rx) = unbounded();
        let peers = Arc::new(Mutex::new(vec![stream.try_clone()?]));
        spawn_reader(stream, tx.clone(), true)?;
        tracing::debug!(endpoint = %endpoint, "pull socket connected");
        Ok(Self {
            rx,
            tx,
            shutdown: Arc::new(AtomicBool::new(false)),
            peers,
            acceptor: None,
            local: None,
        })
    }

    /// The address peers connect to, for a bound socket.
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.local.as_ref()
    }

    pub fn closer(&self) -> SocketCloser {
        SocketCloser {
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Next raw frame; `None` once the socket is closed or interrupted.
    pub fn recv_line(&self) -> Option<String> {
        match self.rx.recv() {
            Ok(Frame::Line(line)) => Some(line),
            Ok(Frame::Closed) => {
                // keep later calls returning None
                let _ = self.tx.send(Frame::Closed);
                None
            }
            Err(_) => None,
        }
    }

    /// Next decoded message; `Ok(None)` once closed or interrupted.
    pub fn recv<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        Ok(self.recv_sized()?.map(|(value, _)| value))
    }

    /// Like [`recv`](Self::recv), also returning the frame size in bytes.
    pub fn recv_sized<T: DeserializeOwned>(&self) -> Result<Option<(T, usize)>> {
        match self.recv_line() {
            Some(line) => {
                let size = line.len() + 1;
                Ok(Some((decode_frame(&line)?, size)))
            }
            None => Ok(None),
        }
    }

    /// Blocking iterator over decoded messages until the socket closes.
    pub fn iter<T: DeserializeOwned>(&self) -> impl Iterator<Item = Result<T>> + '_ {
        std::iter::from_fn(move || self.recv().transpose())
    }
}

impl Drop for PullSocket {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for stream in self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

#[derive(Default)]
struct PeerRing {
    peers: Vec<LineWriter<TcpStream>>,
    next: usize,
}

type SharedRing = Arc<(Mutex<PeerRing>, Condvar)>;

enum PushInner {
    Connected(LineWriter<TcpStream>),
    Bound {
        ring: SharedRing,
        shutdown: Arc<AtomicBool>,
        acceptor: Option<JoinHandle<()>>,
        local: Endpoint,
    },
}

/// Sending end of a pipeline.
///
/// A bound push distributes frames round-robin over its connected peers and
/// blocks while none is connected.
pub struct PushSocket {
    inner: PushInner,
    peer_timeout: Option<Duration>,
}

impl PushSocket {
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_timeout(endpoint, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Connect, retrying for at most `timeout` while the peer is not up.
    pub fn connect_timeout(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let stream = connect_with_retry(endpoint, timeout)?;
        tracing::debug!(endpoint = %endpoint, "push socket connected");
        Ok(Self {
            inner: PushInner::Connected(LineWriter::new(stream)),
            peer_timeout: None,
        })
    }

    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let (listener, local) = bind_listener(endpoint)?;
        let ring: SharedRing = Arc::new((Mutex::new(PeerRing::default()), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let peer_ring = Arc::clone(&ring);
        let acceptor = spawn_acceptor("push-acceptor", listener, shutdown.clone(), move |stream| {
            let (lock, available) = &*peer_ring;
            lock.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .peers
                .push(LineWriter::new(stream));
            available.notify_all();
        })?;

        tracing::debug!(endpoint = %local, "push socket bound");
        Ok(Self {
            inner: PushInner::Bound {
                ring,
                shutdown,
                acceptor: Some(acceptor),
                local,
            },
            peer_timeout: None,
        })
    }

    /// Fail a send on a bound socket if no peer shows up within `timeout`.
    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = Some(timeout);
        self
    }

    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        match &self.inner {
            PushInner::Connected(_) => None,
            PushInner::Bound { local, .. } => Some(local),
        }
    }

    /// Number of connected peers (1 for a connected socket).
    pub fn num_peers(&self) -> usize {
        match &self.inner {
            PushInner::Connected(_) => 1,
            PushInner::Bound { ring, .. } => {
                ring.0
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .peers
                    .len()
            }
        }
    }

    /// Send one message, returning the encoded size in bytes.
    pub fn send<T: Serialize>(&mut self, value: &T) -> Result<usize> {
        let frame = encode_frame(value)?;
        self.send_line(&frame)
    }

    /// Send one already-encoded frame.
    pub fn send_line(&mut self, line: &str) -> Result<usize> {
        let size = line.len() + usize::from(!line.ends_with('\n'));
        match &mut self.inner {
            PushInner::Connected(writer) => {
                writer
                    .write_line(line)
                    .map_err(|e| FarmError::Transport(format!("send failed: {}", e)))?;
                Ok(size)
            }
            PushInner::Bound { ring, local, .. } => {
                send_round_robin(ring, line, self.peer_timeout, local)?;
                Ok(size)
            }
        }
    }
}

/// Whether a pull peer has shut its end. Pull peers never write, so any
/// readable state other than EOF means the peer is still there.
fn peer_closed(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let closed = match stream.peek(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    let _ = stream.set_nonblocking(false);
    closed
}

fn send_round_robin(
    ring: &SharedRing,
    line: &str,
    peer_timeout: Option<Duration>,
    local: &Endpoint,
) -> Result<()> {
    let (lock, available) = &**ring;
    let deadline = peer_timeout.map(|t| Instant::now() + t);
    let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        while guard.peers.is_empty() {
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FarmError::Transport(format!(
                            "no peer connected to {} within {:?}",
                            local,
                            peer_timeout.unwrap_or_default()
                        )));
                    }
                    available
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => available
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        let idx = guard.next % guard.peers.len();
        // a write to a peer that already hung up still succeeds once
        if peer_closed(guard.peers[idx].get_ref()) {
            tracing::debug!("dropping departed peer");
            guard.peers.remove(idx);
            continue;
        }
        match guard.peers[idx].write_line(line) {
            Ok(()) => {
                guard.next = idx + 1;
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping disconnected peer");
                guard.peers.remove(idx);
            }
        }
    }
}

impl Drop for PushSocket {
    fn drop(&mut self) {
        if let PushInner::Bound {
            ring,
            shutdown,
            acceptor,
            ..
        } = &mut self.inner
        {
            shutdown.store(true, Ordering::Relaxed);
            if let Some(acceptor) = acceptor.take() {
                let _ = acceptor.join();
            }
            for peer in ring
                .0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .peers
                .iter()
            {
                let _ = peer.get_ref().shutdown(Shutdown::Write);
            }
        }
    }
}

/// Client side of a request/reply exchange; one request in flight.
pub struct RequestSocket {
    endpoint: Endpoint,
    reader: LineReader<TcpStream>,
    writer: LineWriter<TcpStream>,
}

impl RequestSocket {
    /// Connect once; with a timeout, both the connect and every reply wait
    /// are bounded.
    pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self> {
        let addr = endpoint.socket_addr()?;
        let stream = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        }
        .map_err(|e| FarmError::Transport(format!("cannot connect to {}: {}", endpoint, e)))?;
        prepare_stream(&stream)?;
        stream.set_read_timeout(timeout)?;
        Ok(Self {
            endpoint: endpoint.clone(),
            reader: LineReader::new(stream.try_clone()?),
            writer: LineWriter::new(stream),
        })
    }

    pub fn request<T: Serialize, R: DeserializeOwned>(&mut self, message: &T) -> Result<R> {
        self.writer.write_line(&encode_frame(message)?)?;
        match self.reader.read_line()? {
            Some(line) => decode_frame(line),
            None => Err(FarmError::Transport(format!(
                "{} closed the connection without replying",
                self.endpoint
            ))),
        }
    }
}

/// Server side of a request/reply exchange, serving one peer at a time.
pub struct ReplySocket {
    listener: TcpListener,
    local: Endpoint,
    conn: Option<(LineReader<TcpStream>, LineWriter<TcpStream>)>,
}

impl ReplySocket {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let (listener, local) = bind_listener(endpoint)?;
        listener.set_nonblocking(false)?;
        tracing::debug!(endpoint = %local, "reply socket bound");
        Ok(Self {
            listener,
            local,
            conn: None,
        })
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Block until some peer sends a request.
    ///
    /// Peers that disconnect without sending anything (liveness probes) are
    /// skipped.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if self.conn.is_none() {
                let (stream, addr) = self.listener.accept()?;
                prepare_stream(&stream)?;
                tracing::trace!(peer = %addr, "control connection");
                self.conn = Some((LineReader::new(stream.try_clone()?), LineWriter::new(stream)));
            }
            let Some((reader, _)) = self.conn.as_mut() else {
                continue;
            };
            match reader.read_line() {
                Ok(Some(line)) => return decode_frame(line),
                Ok(None) => self.conn = None,
                Err(e) => {
                    tracing::debug!(error = %e, "control peer failed");
                    self.conn = None;
                }
            }
        }
    }

    /// Answer the request last returned by [`recv`](Self::recv).
    pub fn reply<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let (_, writer) = self
            .conn
            .as_mut()
            .ok_or_else(|| FarmError::Transport("no request to reply to".into()))?;
        if let Err(e) = writer.write_line(&encode_frame(message)?) {
            self.conn = None;
            return Err(FarmError::Transport(format!("reply failed: {}", e)));
        }
        Ok(())
    }
}

/// Relay every frame from `pull` to `push` until `pull` is closed.
///
/// Returns the number of frames relayed.
pub fn proxy(pull: &PullSocket, push: &mut PushSocket) -> Result<u64> {
    let mut relayed = 0;
    while let Some(line) = pull.recv_line() {
        push.send_line(&line)?;
        relayed += 1;
    }
    Ok(relayed)
}
