use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use qbus_frame::{encode_frame, Frame};
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::handle::{ConnectionId, Handle, HandleKind, HandleSocket};
use crate::net;
use crate::wake::{WakePipe, WakeSignal};

/// Fixed worker poll timeout. Reconnect attempts are paced by this tick:
/// a queued endpoint is retried at most once per timeout, with no jitter
/// or backoff.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Sink for transport events.
///
/// All three callbacks run synchronously on the provider's worker thread;
/// implementations must be safe to call concurrently with application
/// threads and may call back into the provider (`send`, `connect`).
pub trait TransportEvents: Send + Sync + 'static {
    /// A connection became live: an accepted inbound peer, or an outbound
    /// connect that completed. Fires exactly once per connection.
    fn on_connect(&self, conn: ConnectionId, peer: &str, inbound: bool);

    /// A complete frame arrived on a live connection.
    fn on_frame(&self, conn: ConnectionId, frame: Frame);

    /// A live connection went away. `reconnecting` reports whether the
    /// peer's endpoint was re-queued for another attempt.
    fn on_disconnect(&self, conn: ConnectionId, reconnecting: bool);
}

enum Event {
    Connected {
        conn: ConnectionId,
        peer: String,
        inbound: bool,
    },
    FrameReceived {
        conn: ConnectionId,
        frame: Frame,
    },
    Disconnected {
        conn: ConnectionId,
        reconnecting: bool,
    },
}

struct State {
    handles: Vec<Handle>,
    reconnect: VecDeque<Arc<Endpoint>>,
}

struct Shared {
    wake: WakePipe,
    state: Mutex<State>,
    events: Arc<dyn TransportEvents>,
    next_id: AtomicU64,
    closed: AtomicBool,
    poll_timeout: Duration,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// TCP transport provider.
///
/// Owns one background thread that multiplexes every socket of a bus
/// context: it accepts inbound connections, completes outbound connects,
/// feeds received bytes through each handle's frame decoder, and retries
/// queued reconnects on the poll tick. Event callbacks are dispatched
/// outside the state lock, so they may call back into the provider.
pub struct TcpProvider {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TcpProvider {
    /// Start a provider with the default 10-second poll timeout.
    pub fn start(events: Arc<dyn TransportEvents>) -> Result<Self> {
        Self::start_with_poll_timeout(events, POLL_TIMEOUT)
    }

    /// Start a provider with an explicit poll timeout (reconnect pacing).
    pub fn start_with_poll_timeout(
        events: Arc<dyn TransportEvents>,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            wake: WakePipe::new()?,
            state: Mutex::new(State {
                handles: Vec::new(),
                reconnect: VecDeque::new(),
            }),
            events,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            poll_timeout,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("qbus-transport".to_string())
            .spawn(move || worker_loop(&worker_shared))
            .map_err(TransportError::Io)?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Bind a listening socket. Returns the bound port (useful with an
    /// ephemeral port request). A bind failure drops the endpoint; there
    /// is no listener retry.
    pub fn listen(&self, host: &str, port: u16) -> Result<u16> {
        self.check_open()?;
        let listener = net::bind_listener(host, port)?;
        let bound = listener.local_addr().map_err(TransportError::Io)?.port();

        let endpoint = Arc::new(Endpoint::new(host, bound, false));
        let id = self.shared.next_id();
        {
            let mut state = self.shared.lock_state();
            state.handles.push(Handle::new(
                id,
                HandleKind::Listen,
                HandleSocket::Listener(listener),
                endpoint,
            ));
        }
        let _ = self.shared.wake.signal(WakeSignal::Refresh);
        info!(host, port = bound, "listener registered");
        Ok(bound)
    }

    /// Start an outbound connection. A connect still in progress is not a
    /// failure. An immediately failing connect is queued for reconnect
    /// when `reconnect` is set, otherwise the error is returned and the
    /// endpoint is dropped.
    pub fn connect(&self, host: &str, port: u16, reconnect: bool) -> Result<()> {
        self.check_open()?;
        let endpoint = Arc::new(Endpoint::new(host, port, reconnect));

        match net::connect_nonblocking(host, port) {
            Ok(stream) => {
                let id = self.shared.next_id();
                {
                    let mut state = self.shared.lock_state();
                    state.handles.push(Handle::new(
                        id,
                        HandleKind::Connect,
                        HandleSocket::Stream(stream),
                        endpoint,
                    ));
                }
                let _ = self.shared.wake.signal(WakeSignal::Refresh);
                Ok(())
            }
            Err(err) if reconnect => {
                warn!(addr = %endpoint.addr(), %err, "connect failed, queueing for reconnect");
                self.shared.lock_state().reconnect.push_back(endpoint);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Encode and send one frame on an established connection.
    ///
    /// The write loop retries `Interrupted`, yields the thread on
    /// `WouldBlock`, and treats any other error or a zero-byte write as
    /// fatal for this send; bytes already written are not rolled back.
    pub fn send(&self, conn: ConnectionId, frame: &Frame) -> Result<()> {
        self.check_open()?;

        let stream = {
            let state = self.shared.lock_state();
            let handle = state
                .handles
                .iter()
                .find(|handle| handle.id == conn)
                .ok_or(TransportError::NotConnected(conn))?;
            if !matches!(handle.kind, HandleKind::Client | HandleKind::Remote) {
                return Err(TransportError::NotConnected(conn));
            }
            handle
                .stream()
                .ok_or(TransportError::NotConnected(conn))?
                .try_clone()
                .map_err(TransportError::Io)?
        };

        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf)?;
        write_all(stream, &buf).inspect_err(|err| {
            error!(conn, %err, "send failed");
        })
    }

    /// Queued reconnect candidates (diagnostic).
    pub fn pending_reconnects(&self) -> usize {
        self.shared.lock_state().reconnect.len()
    }

    /// Tear the provider down: disable every handle and endpoint, signal
    /// the worker to terminate, join it, then drop the guarded lists.
    /// Disabled endpoints are never re-queued, so no connect attempt can
    /// happen after this returns. Idempotent; safe from any thread.
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };
        self.shared.closed.store(true, Ordering::Release);

        {
            let mut state = self.shared.lock_state();
            for handle in &mut state.handles {
                handle.endpoint.disable();
                handle.kind = HandleKind::Disabled;
            }
            for endpoint in &state.reconnect {
                endpoint.disable();
            }
            state.reconnect.clear();
        }

        while self.shared.wake.signal(WakeSignal::Terminate).is_err() {
            std::thread::yield_now();
        }
        if worker.thread().id() == std::thread::current().id() {
            // Teardown initiated from a transport callback: the worker exits
            // on the terminate signal; joining here would deadlock on
            // ourselves.
            return;
        }
        if worker.join().is_err() {
            error!("transport worker panicked");
        }
        self.shared.lock_state().handles.clear();
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        Ok(())
    }
}

impl Drop for TcpProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_all(mut stream: std::net::TcpStream, bytes: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match stream.write(&bytes[offset..]) {
            Ok(0) => {
                return Err(TransportError::Io(std::io::Error::from(
                    ErrorKind::WriteZero,
                )))
            }
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::yield_now();
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    Ok(())
}

fn worker_loop(shared: &Shared) {
    loop {
        let (mut pollfds, ids) = snapshot(shared);

        // SAFETY: pollfds is a valid, initialized slice for the given length.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                shared.poll_timeout.as_millis() as libc::c_int,
            )
        };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!(%err, "poll failed");
            continue;
        }

        if rc == 0 {
            reconnect_tick(shared);
            continue;
        }

        if pollfds[0].revents != 0 && shared.wake.drain() == Some(WakeSignal::Terminate) {
            break;
        }

        let mut events = Vec::new();
        {
            let mut state = shared.lock_state();
            for (pfd, id) in pollfds[1..].iter().zip(&ids) {
                if pfd.revents != 0 {
                    service_handle(shared, &mut state, *id, &mut events);
                }
            }
        }
        dispatch(shared, events);
    }
    debug!("transport worker exiting");
}

/// Snapshot pollable fds from the handle list. Index 0 is always the wake
/// pipe; `ids[i]` corresponds to `pollfds[i + 1]`.
fn snapshot(shared: &Shared) -> (Vec<libc::pollfd>, Vec<ConnectionId>) {
    let state = shared.lock_state();
    let mut pollfds = Vec::with_capacity(state.handles.len() + 1);
    let mut ids = Vec::with_capacity(state.handles.len());

    pollfds.push(libc::pollfd {
        fd: shared.wake.poll_fd(),
        events: libc::POLLIN,
        revents: 0,
    });

    for handle in &state.handles {
        let events = match handle.kind {
            HandleKind::Disabled => continue,
            // An in-progress connect resolves via writability.
            HandleKind::Connect => libc::POLLOUT,
            _ => libc::POLLIN,
        };
        pollfds.push(libc::pollfd {
            fd: handle.raw_fd(),
            events,
            revents: 0,
        });
        ids.push(handle.id);
    }

    (pollfds, ids)
}

fn service_handle(shared: &Shared, state: &mut State, id: ConnectionId, events: &mut Vec<Event>) {
    let Some(idx) = state.handles.iter().position(|handle| handle.id == id) else {
        return;
    };
    match state.handles[idx].kind {
        HandleKind::Listen => accept_ready(shared, state, idx, events),
        HandleKind::Connect => connect_ready(state, idx, events),
        HandleKind::Client | HandleKind::Remote => read_ready(state, idx, events),
        HandleKind::Disabled => {}
    }
}

fn accept_ready(shared: &Shared, state: &mut State, idx: usize, events: &mut Vec<Event>) {
    let HandleSocket::Listener(listener) = &state.handles[idx].socket else {
        return;
    };
    match listener.accept() {
        Ok((stream, peer)) => {
            if let Err(err) = stream.set_nonblocking(true) {
                warn!(%peer, %err, "failed to set accepted socket non-blocking");
                return;
            }
            let endpoint = Arc::new(Endpoint::new(peer.ip().to_string(), peer.port(), false));
            let peer_addr = endpoint.addr();
            let id = shared.next_id();
            state.handles.push(Handle::new(
                id,
                HandleKind::Remote,
                HandleSocket::Stream(stream),
                endpoint,
            ));
            debug!(conn = id, peer = %peer_addr, "accepted connection");
            events.push(Event::Connected {
                conn: id,
                peer: peer_addr,
                inbound: true,
            });
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => {}
        Err(err) => warn!(%err, "accept failed"),
    }
}

fn connect_ready(state: &mut State, idx: usize, events: &mut Vec<Event>) {
    let outcome = match state.handles[idx].stream() {
        Some(stream) => net::finish_connect(stream),
        None => return,
    };
    match outcome {
        Ok(()) => {
            let handle = &mut state.handles[idx];
            handle.kind = HandleKind::Client;
            debug!(conn = handle.id, peer = %handle.endpoint.addr(), "connected");
            events.push(Event::Connected {
                conn: handle.id,
                peer: handle.endpoint.addr(),
                inbound: false,
            });
        }
        Err(err) => {
            let handle = state.handles.swap_remove(idx);
            debug!(peer = %handle.endpoint.addr(), %err, "connect failed");
            // Never fired on_connect, so no disconnect event either; only
            // the reconnect policy applies.
            if handle.endpoint.wants_reconnect() && handle.endpoint.is_enabled() {
                state.reconnect.push_back(handle.endpoint);
            }
        }
    }
}

fn read_ready(state: &mut State, idx: usize, events: &mut Vec<Event>) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    let handle = &mut state.handles[idx];
    let HandleSocket::Stream(stream) = &mut handle.socket else {
        return;
    };

    let read = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(err)
            if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted =>
        {
            return;
        }
        Err(err) => {
            debug!(conn = handle.id, %err, "read failed");
            remove_handle(state, idx, events);
            return;
        }
    };

    if read == 0 {
        debug!(conn = handle.id, "peer closed connection");
        remove_handle(state, idx, events);
        return;
    }

    let mut rest = &buf[..read];
    while !rest.is_empty() {
        match handle.decoder.feed(rest) {
            Ok(result) => {
                rest = &rest[result.consumed..];
                if let Some(frame) = result.frame {
                    events.push(Event::FrameReceived {
                        conn: handle.id,
                        frame,
                    });
                }
            }
            Err(err) => {
                warn!(conn = handle.id, %err, "frame decode failed, dropping connection");
                remove_handle(state, idx, events);
                return;
            }
        }
    }
}

/// Remove a live handle and run the disconnect path: re-queue the
/// endpoint when its kind still allows reconnecting, its policy asks for
/// it, and it was not disabled by shutdown.
fn remove_handle(state: &mut State, idx: usize, events: &mut Vec<Event>) {
    let handle = state.handles.swap_remove(idx);
    let reconnecting = handle.kind.allows_reconnect()
        && handle.endpoint.wants_reconnect()
        && handle.endpoint.is_enabled();
    if reconnecting {
        state.reconnect.push_back(Arc::clone(&handle.endpoint));
    }
    events.push(Event::Disconnected {
        conn: handle.id,
        reconnecting,
    });
}

/// Runs on the poll tick: attempt every queued endpoint once. A started
/// attempt joins the handle list as an in-progress connect and a refresh
/// is signalled so the next poll round includes the new socket.
fn reconnect_tick(shared: &Shared) {
    let pending: Vec<Arc<Endpoint>> = {
        let mut state = shared.lock_state();
        state.reconnect.drain(..).collect()
    };
    if pending.is_empty() {
        return;
    }

    let mut still_pending = VecDeque::new();
    for endpoint in pending {
        if !endpoint.is_enabled() {
            continue;
        }
        match net::connect_nonblocking(endpoint.host(), endpoint.port()) {
            Ok(stream) => {
                info!(peer = %endpoint.addr(), "reconnect attempt started");
                let id = shared.next_id();
                shared.lock_state().handles.push(Handle::new(
                    id,
                    HandleKind::Connect,
                    HandleSocket::Stream(stream),
                    endpoint,
                ));
                let _ = shared.wake.signal(WakeSignal::Refresh);
            }
            Err(err) => {
                debug!(peer = %endpoint.addr(), %err, "reconnect attempt failed");
                still_pending.push_back(endpoint);
            }
        }
    }

    shared.lock_state().reconnect.append(&mut still_pending);
}

fn dispatch(shared: &Shared, events: Vec<Event>) {
    for event in events {
        match event {
            Event::Connected {
                conn,
                peer,
                inbound,
            } => shared.events.on_connect(conn, &peer, inbound),
            Event::FrameReceived { conn, frame } => shared.events.on_frame(conn, frame),
            Event::Disconnected { conn, reconnecting } => {
                shared.events.on_disconnect(conn, reconnecting);
            }
        }
    }
}
