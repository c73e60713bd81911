use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use qbus_frame::{Frame, FrameKind};
use qbus_transport::{ConnectionId, TcpProvider, TransportEvents};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ProviderConfig, ProviderKind, ProviderMode};
use crate::error::{Result, RouterError};
use crate::message::{err_code, Message};
use crate::payload::{from_wire, to_wire, PayloadFilter};

/// A registered method handler.
///
/// Handlers run on the transport worker thread. The [`Responder`] is the
/// completion token for the inbound request: it is consumed exactly once,
/// either by [`Responder::respond`] or by moving it into
/// [`Bus::continue_with`].
pub type Handler = Arc<dyn Fn(&Bus, Message, Responder) + Send + Sync>;

type ResponseFn = Box<dyn FnOnce(&Bus, Message) + Send>;
type ContinueFn = Box<dyn FnOnce(&Bus, Message, Responder) + Send>;
type MethodsFn = Box<dyn FnOnce(&Bus, Vec<String>) + Send>;
type SubscribeFn = Arc<dyn Fn(&Bus, Value) + Send + Sync>;

const KEY_MODULES: &str = "modules";
const KEY_METHODS: &str = "methods";

enum Pending {
    /// A plain call awaiting its response.
    Response(ResponseFn),
    /// A continuation: the nested call's response hands the original
    /// request's completion token back to the callback.
    Continuation {
        callback: ContinueFn,
        responder: Responder,
    },
    /// A method-listing request.
    Methods(MethodsFn),
    /// A request relayed towards its target module; the response frame
    /// is passed back to the originating connection untouched.
    Relay { conn: ConnectionId },
}

enum ReplyRoute {
    /// Respond over a connection with a response frame.
    Connection {
        conn: ConnectionId,
        chain_key: String,
        requester: String,
    },
    /// Respond by invoking a local caller's callback.
    Local {
        chain_key: String,
        callback: ResponseFn,
    },
}

/// Completion token for one inbound request.
///
/// Not cloneable and consumed by value: the type system guarantees that
/// exactly one response is produced per request, no matter how many
/// continuation hops the request passes through.
pub struct Responder {
    route: ReplyRoute,
}

impl Responder {
    fn connection(conn: ConnectionId, chain_key: String, requester: String) -> Self {
        Self {
            route: ReplyRoute::Connection {
                conn,
                chain_key,
                requester,
            },
        }
    }

    fn local(chain_key: String, callback: ResponseFn) -> Self {
        Self {
            route: ReplyRoute::Local {
                chain_key,
                callback,
            },
        }
    }

    /// The correlation id of the request this token completes.
    pub fn chain_key(&self) -> &str {
        match &self.route {
            ReplyRoute::Connection { chain_key, .. } | ReplyRoute::Local { chain_key, .. } => {
                chain_key
            }
        }
    }

    /// Complete the request with `msg` (success or error envelope).
    pub fn respond(self, bus: &Bus, mut msg: Message) {
        match self.route {
            ReplyRoute::Connection {
                conn,
                chain_key,
                requester,
            } => {
                msg.chain_key = chain_key.clone();
                msg.sender = bus.module().to_string();
                if let Err(err) = bus.send_response(conn, &requester, msg) {
                    warn!(conn, chain_key = %chain_key, %err, "response send failed");
                }
            }
            ReplyRoute::Local {
                chain_key,
                callback,
            } => {
                msg.chain_key = chain_key;
                callback(bus, msg);
            }
        }
    }
}

struct BusInner {
    module: String,
    module_key: String,
    filter: PayloadFilter,
    methods: Mutex<HashMap<String, Handler>>,
    pending: Mutex<HashMap<String, Pending>>,
    routes: Mutex<HashMap<String, ConnectionId>>,
    conns: Mutex<HashSet<ConnectionId>>,
    subs: Mutex<HashMap<(String, String), Vec<SubscribeFn>>>,
    observers: Mutex<HashMap<String, HashSet<ConnectionId>>>,
    provider: OnceLock<TcpProvider>,
}

/// Forwards transport events into the bus without creating an ownership
/// cycle: the provider holds this relay, the relay holds only a weak
/// reference back.
struct Relay {
    bus: Weak<BusInner>,
}

impl Relay {
    fn bus(&self) -> Option<Bus> {
        self.bus.upgrade().map(|inner| Bus { inner })
    }
}

impl TransportEvents for Relay {
    fn on_connect(&self, conn: ConnectionId, peer: &str, inbound: bool) {
        if let Some(bus) = self.bus() {
            bus.handle_connect(conn, peer, inbound);
        }
    }

    fn on_frame(&self, conn: ConnectionId, frame: Frame) {
        if let Some(bus) = self.bus() {
            bus.handle_frame(conn, frame);
        }
    }

    fn on_disconnect(&self, conn: ConnectionId, reconnecting: bool) {
        if let Some(bus) = self.bus() {
            bus.handle_disconnect(conn, reconnecting);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The message router: maps envelopes to local handlers or outbound
/// frames, correlates responses by chain key, and implements the
/// continuation model that collapses arbitrarily deep call chains into
/// one externally visible request/response pair.
///
/// Fully thread-safe; handlers and callbacks run on the transport worker
/// thread and may freely call back into the bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus for one module with a plain payload filter.
    pub fn new(module: impl Into<String>) -> Result<Self> {
        Self::with_options(module, PayloadFilter::Plain, qbus_transport::POLL_TIMEOUT)
    }

    /// Create a bus with an explicit payload filter and reconnect pacing.
    pub fn with_options(
        module: impl Into<String>,
        filter: PayloadFilter,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let module = module.into();
        let inner = Arc::new(BusInner {
            module_key: module.to_uppercase(),
            module,
            filter,
            methods: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashSet::new()),
            subs: Mutex::new(HashMap::new()),
            observers: Mutex::new(HashMap::new()),
            provider: OnceLock::new(),
        });

        let relay = Arc::new(Relay {
            bus: Arc::downgrade(&inner),
        });
        let provider = TcpProvider::start_with_poll_timeout(relay, poll_timeout)?;
        let _ = inner.provider.set(provider);

        Ok(Self { inner })
    }

    /// This bus's module name.
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Wire the bus according to one provider configuration entry.
    pub fn apply(&self, config: &ProviderConfig) -> Result<()> {
        match config.kind {
            ProviderKind::Tcp => {}
        }
        match config.mode {
            ProviderMode::Listen => {
                self.listen(&config.host, config.port)?;
                Ok(())
            }
            ProviderMode::Client => self.connect_with(&config.host, config.port, config.reconnect),
        }
    }

    /// Accept peers on `host:port`; returns the bound port.
    pub fn listen(&self, host: &str, port: u16) -> Result<u16> {
        Ok(self.provider()?.listen(host, port)?)
    }

    /// Dial a peer, re-dialing on loss.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.connect_with(host, port, true)
    }

    /// Dial a peer with an explicit reconnect policy.
    pub fn connect_with(&self, host: &str, port: u16, reconnect: bool) -> Result<()> {
        Ok(self.provider()?.connect(host, port, reconnect)?)
    }

    /// Expose a method under this bus's module name.
    pub fn register<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&Bus, Message, Responder) + Send + Sync + 'static,
    {
        let name = method.into();
        debug!(module = %self.module(), method = %name, "method registered");
        lock(&self.inner.methods).insert(name, Arc::new(handler));
    }

    /// Call `module.method`, delivering the response envelope to
    /// `callback`.
    ///
    /// A local target runs in-process; a remote target is serialized into
    /// a request frame and the callback is parked in the pending-call
    /// table under the envelope's chain key until the matching response
    /// arrives. There is no per-call timeout: the callback fires when a
    /// response arrives, or never if the peer is lost first.
    pub fn send<F>(&self, module: &str, method: &str, mut msg: Message, callback: F) -> Result<()>
    where
        F: FnOnce(&Bus, Message) + Send + 'static,
    {
        if msg.chain_key.is_empty() {
            msg.chain_key = Uuid::new_v4().to_string();
        }
        msg.sender = self.module().to_string();
        let chain_key = msg.chain_key.clone();

        if self.is_local(module) {
            self.invoke_local(method, msg, Responder::local(chain_key, Box::new(callback)));
            return Ok(());
        }

        let conn = self.route_to(module)?;
        lock(&self.inner.pending)
            .insert(chain_key.clone(), Pending::Response(Box::new(callback)));
        if let Err(err) = self.send_request(conn, module, method, msg) {
            lock(&self.inner.pending).remove(&chain_key);
            return Err(err);
        }
        Ok(())
    }

    /// From inside a handler: delegate to another call before completing
    /// the original request.
    ///
    /// The nested call reuses the in-flight chain key and takes ownership
    /// of the original request's completion token; `callback` receives
    /// the nested response together with that token and decides whether
    /// to respond or chain again. Failures to reach the nested target are
    /// delivered to `callback` as an error envelope, exactly like a
    /// remote error response.
    pub fn continue_with<F>(
        &self,
        module: &str,
        method: &str,
        mut msg: Message,
        responder: Responder,
        callback: F,
    ) where
        F: FnOnce(&Bus, Message, Responder) + Send + 'static,
    {
        let chain_key = responder.chain_key().to_string();
        msg.chain_key = chain_key.clone();
        msg.sender = self.module().to_string();

        if self.is_local(module) {
            let next = Responder::local(
                chain_key,
                Box::new(move |bus: &Bus, reply: Message| callback(bus, reply, responder)),
            );
            self.invoke_local(method, msg, next);
            return;
        }

        let conn = match self.route_to(module) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(module, %err, "continuation target unreachable");
                let failure = error_reply(&chain_key, err_code::NO_ROUTE, err.to_string());
                callback(self, failure, responder);
                return;
            }
        };

        lock(&self.inner.pending).insert(
            chain_key.clone(),
            Pending::Continuation {
                callback: Box::new(callback),
                responder,
            },
        );
        if let Err(err) = self.send_request(conn, module, method, msg) {
            let entry = lock(&self.inner.pending).remove(&chain_key);
            if let Some(Pending::Continuation {
                callback,
                responder,
            }) = entry
            {
                let failure = error_reply(&chain_key, err_code::SEND_FAILED, err.to_string());
                callback(self, failure, responder);
            }
        }
    }

    /// List a module's registered method names.
    pub fn methods<F>(&self, module: &str, callback: F) -> Result<()>
    where
        F: FnOnce(&Bus, Vec<String>) + Send + 'static,
    {
        if self.is_local(module) {
            let names = self.local_method_names();
            callback(self, names);
            return Ok(());
        }

        let conn = self.route_to(module)?;
        let chain_key = Uuid::new_v4().to_string();
        lock(&self.inner.pending).insert(chain_key.clone(), Pending::Methods(Box::new(callback)));

        let frame = Frame::new(FrameKind::Methods, chain_key.clone())
            .with_target(module, "")
            .with_sender(self.module());
        if let Err(err) = self.provider()?.send(conn, &frame) {
            lock(&self.inner.pending).remove(&chain_key);
            return Err(err.into());
        }
        Ok(())
    }

    /// Subscribe to a value a module emits. Local subscriptions fire on
    /// [`Bus::emit`]; remote ones register this bus with the peer.
    pub fn subscribe<F>(&self, module: &str, value_name: &str, callback: F) -> Result<()>
    where
        F: Fn(&Bus, Value) + Send + Sync + 'static,
    {
        let conn = if self.is_local(module) {
            None
        } else {
            Some(self.route_to(module)?)
        };

        let key = (module.to_uppercase(), value_name.to_string());
        lock(&self.inner.subs)
            .entry(key)
            .or_default()
            .push(Arc::new(callback));

        if let Some(conn) = conn {
            let frame = Frame::new(FrameKind::ObservableReq, Uuid::new_v4().to_string())
                .with_target(module, value_name)
                .with_sender(self.module());
            self.provider()?.send(conn, &frame)?;
        }
        Ok(())
    }

    /// Broadcast a value to every subscriber of `value_name`.
    /// One-directional: no response is correlated.
    pub fn emit(&self, value_name: &str, value: Value) -> Result<()> {
        let local_key = (self.inner.module_key.clone(), value_name.to_string());
        let local_subs = lock(&self.inner.subs)
            .get(&local_key)
            .cloned()
            .unwrap_or_default();
        for sub in &local_subs {
            sub(self, value.clone());
        }

        let conns: Vec<ConnectionId> = lock(&self.inner.observers)
            .get(value_name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if conns.is_empty() {
            return Ok(());
        }

        let mut msg = Message::new().with_cdata(value);
        let (kind, payload) = to_wire(&mut msg, self.inner.filter)?;
        let frame = Frame::new(FrameKind::ObservableRes, String::new())
            .with_target("", value_name)
            .with_sender(self.module())
            .with_payload(kind, payload);
        for conn in conns {
            if let Err(err) = self.provider()?.send(conn, &frame) {
                warn!(conn, value_name, %err, "observable broadcast failed");
            }
        }
        Ok(())
    }

    /// Module names currently resolvable through this bus.
    pub fn known_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.routes).keys().cloned().collect();
        names.sort();
        names
    }

    /// Tear the bus down: shut the provider's worker down and drop every
    /// parked call. Pending callbacks never fire after this.
    pub fn shutdown(&self) {
        if let Some(provider) = self.inner.provider.get() {
            provider.shutdown();
        }
        lock(&self.inner.pending).clear();
        lock(&self.inner.routes).clear();
        lock(&self.inner.conns).clear();
        lock(&self.inner.observers).clear();
    }

    fn provider(&self) -> Result<&TcpProvider> {
        self.inner.provider.get().ok_or(RouterError::Shutdown)
    }

    fn is_local(&self, module: &str) -> bool {
        module.eq_ignore_ascii_case(&self.inner.module)
    }

    fn route_to(&self, module: &str) -> Result<ConnectionId> {
        lock(&self.inner.routes)
            .get(&module.to_uppercase())
            .copied()
            .ok_or_else(|| RouterError::NoRoute(module.to_string()))
    }

    fn local_method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.methods).keys().cloned().collect();
        names.sort();
        names
    }

    fn invoke_local(&self, method: &str, msg: Message, responder: Responder) {
        let handler = lock(&self.inner.methods).get(method).cloned();
        match handler {
            Some(handler) => handler(self, msg, responder),
            None => {
                let failure = Message::from_error(
                    err_code::METHOD_NOT_FOUND,
                    format!("module `{}` has no method `{method}`", self.module()),
                );
                responder.respond(self, failure);
            }
        }
    }

    fn send_request(
        &self,
        conn: ConnectionId,
        module: &str,
        method: &str,
        mut msg: Message,
    ) -> Result<()> {
        let chain_key = msg.chain_key.clone();
        let (kind, payload) = to_wire(&mut msg, self.inner.filter)?;
        let frame = Frame::new(FrameKind::MsgReq, chain_key)
            .with_target(module, method)
            .with_sender(self.module())
            .with_payload(kind, payload);
        self.provider()?.send(conn, &frame)?;
        Ok(())
    }

    fn send_response(&self, conn: ConnectionId, requester: &str, mut msg: Message) -> Result<()> {
        let chain_key = msg.chain_key.clone();
        let (kind, payload) = to_wire(&mut msg, self.inner.filter)?;
        let frame = Frame::new(FrameKind::MsgRes, chain_key)
            .with_target(requester, "")
            .with_sender(self.module())
            .with_payload(kind, payload);
        self.provider()?.send(conn, &frame)?;
        Ok(())
    }

    fn handle_connect(&self, conn: ConnectionId, peer: &str, inbound: bool) {
        info!(module = %self.module(), conn, peer, inbound, "connection up");
        lock(&self.inner.conns).insert(conn);
        if !inbound {
            // Announce ourselves; the peer answers with its own table.
            self.send_route_frame(FrameKind::RouteReq, conn);
        }
    }

    fn handle_disconnect(&self, conn: ConnectionId, reconnecting: bool) {
        info!(module = %self.module(), conn, reconnecting, "connection down");
        lock(&self.inner.conns).remove(&conn);
        lock(&self.inner.routes).retain(|_, route| *route != conn);
        for observers in lock(&self.inner.observers).values_mut() {
            observers.remove(&conn);
        }
        // Calls parked on this connection stay pending: there is no
        // per-call timeout, and a reconnect is a fresh connection with no
        // replay of in-flight requests.
    }

    fn handle_frame(&self, conn: ConnectionId, frame: Frame) {
        match frame.kind {
            FrameKind::MsgReq => self.handle_request(conn, frame),
            FrameKind::MsgRes => self.handle_response(frame),
            FrameKind::RouteReq => {
                self.learn_routes(conn, &frame);
                self.send_route_frame(FrameKind::RouteRes, conn);
            }
            FrameKind::RouteRes | FrameKind::RouteUpd => self.learn_routes(conn, &frame),
            FrameKind::Methods => self.handle_methods(conn, frame),
            FrameKind::ObservableReq => {
                debug!(conn, value_name = %frame.method, subscriber = %frame.sender, "observer registered");
                lock(&self.inner.observers)
                    .entry(frame.method)
                    .or_default()
                    .insert(conn);
            }
            FrameKind::ObservableRes => self.handle_observable(frame),
            FrameKind::None => warn!(conn, "ignoring frame without a kind"),
        }
    }

    fn handle_request(&self, conn: ConnectionId, frame: Frame) {
        if !frame.module.is_empty() && !self.is_local(&frame.module) {
            self.relay_request(conn, frame);
            return;
        }

        let responder =
            Responder::connection(conn, frame.chain_key.clone(), frame.sender.clone());
        match from_wire(frame.payload_kind, &frame.payload, self.inner.filter) {
            Ok(mut msg) => {
                msg.chain_key = frame.chain_key;
                msg.sender = frame.sender;
                self.invoke_local(&frame.method, msg, responder);
            }
            Err(err) => {
                warn!(conn, method = %frame.method, %err, "malformed request payload");
                responder.respond(self, Message::from_error(err_code::GENERAL, err.to_string()));
            }
        }
    }

    /// Forward a request addressed to another module along its route,
    /// keeping a relay entry so the response travels back the same way.
    /// Frame fields are passed through untouched, so the chain key stays
    /// the same across every hop.
    fn relay_request(&self, origin: ConnectionId, frame: Frame) {
        let responder =
            Responder::connection(origin, frame.chain_key.clone(), frame.sender.clone());
        let next = match self.route_to(&frame.module) {
            Ok(next) if next != origin => next,
            _ => {
                warn!(module = %frame.module, "no onward route for relayed request");
                responder.respond(
                    self,
                    Message::from_error(
                        err_code::NO_ROUTE,
                        format!("no route to module `{}`", frame.module),
                    ),
                );
                return;
            }
        };

        lock(&self.inner.pending)
            .insert(frame.chain_key.clone(), Pending::Relay { conn: origin });
        let outcome = self.provider().and_then(|p| Ok(p.send(next, &frame)?));
        if let Err(err) = outcome {
            lock(&self.inner.pending).remove(&frame.chain_key);
            warn!(module = %frame.module, %err, "relay failed");
            responder.respond(
                self,
                Message::from_error(err_code::SEND_FAILED, err.to_string()),
            );
        }
    }

    fn handle_response(&self, frame: Frame) {
        let Some(pending) = lock(&self.inner.pending).remove(&frame.chain_key) else {
            warn!(chain_key = %frame.chain_key, "unmatched response");
            return;
        };

        if let Pending::Relay { conn } = &pending {
            let conn = *conn;
            if let Err(err) = self.provider().and_then(|p| Ok(p.send(conn, &frame)?)) {
                warn!(conn, chain_key = %frame.chain_key, %err, "relayed response lost");
            }
            return;
        }

        let mut msg = match from_wire(frame.payload_kind, &frame.payload, self.inner.filter) {
            Ok(msg) => msg,
            Err(err) => Message::from_error(err_code::GENERAL, err.to_string()),
        };
        msg.chain_key = frame.chain_key;
        msg.sender = frame.sender;

        match pending {
            Pending::Response(callback) => callback(self, msg),
            Pending::Continuation {
                callback,
                responder,
            } => callback(self, msg, responder),
            Pending::Methods(_) => {
                warn!(chain_key = %msg.chain_key, "method listing answered with a call response");
            }
            Pending::Relay { .. } => {}
        }
    }

    fn handle_methods(&self, conn: ConnectionId, frame: Frame) {
        let entry = lock(&self.inner.pending).remove(&frame.chain_key);
        match entry {
            Some(Pending::Methods(callback)) => {
                let names = serde_json::from_slice::<Value>(&frame.payload)
                    .ok()
                    .and_then(|value| {
                        value.get(KEY_METHODS).and_then(Value::as_array).map(|list| {
                            list.iter()
                                .filter_map(|name| name.as_str().map(str::to_string))
                                .collect()
                        })
                    })
                    .unwrap_or_default();
                callback(self, names);
            }
            Some(Pending::Relay { conn }) => {
                if let Err(err) = self.provider().and_then(|p| Ok(p.send(conn, &frame)?)) {
                    warn!(conn, chain_key = %frame.chain_key, %err, "relayed method listing lost");
                }
            }
            Some(other) => {
                warn!(chain_key = %frame.chain_key, "call answered with a method listing");
                lock(&self.inner.pending).insert(frame.chain_key, other);
            }
            None if !frame.module.is_empty() && !self.is_local(&frame.module) => {
                // A listing request for a module reachable through us.
                match self.route_to(&frame.module) {
                    Ok(next) if next != conn => {
                        lock(&self.inner.pending)
                            .insert(frame.chain_key.clone(), Pending::Relay { conn });
                        if let Err(err) = self.provider().and_then(|p| Ok(p.send(next, &frame)?)) {
                            lock(&self.inner.pending).remove(&frame.chain_key);
                            warn!(module = %frame.module, %err, "method listing relay failed");
                        }
                    }
                    _ => warn!(module = %frame.module, "no onward route for method listing"),
                }
            }
            None => {
                // No pending entry: this is a request for our listing.
                let names = self.local_method_names();
                match serde_json::to_vec(&json!({ KEY_METHODS: names })) {
                    Ok(payload) => {
                        let reply = Frame::new(FrameKind::Methods, frame.chain_key)
                            .with_target(&frame.sender, "")
                            .with_sender(self.module())
                            .with_json(payload);
                        if let Err(err) = self.provider().and_then(|p| Ok(p.send(conn, &reply)?)) {
                            warn!(conn, %err, "method listing reply failed");
                        }
                    }
                    Err(err) => warn!(%err, "method listing serialization failed"),
                }
            }
        }
    }

    fn handle_observable(&self, frame: Frame) {
        let key = (frame.sender.to_uppercase(), frame.method.clone());
        let subs = lock(&self.inner.subs).get(&key).cloned().unwrap_or_default();
        if subs.is_empty() {
            return;
        }
        match from_wire(frame.payload_kind, &frame.payload, self.inner.filter) {
            Ok(mut msg) => {
                let value = msg.take_cdata().unwrap_or(Value::Null);
                for sub in &subs {
                    sub(self, value.clone());
                }
            }
            Err(err) => {
                warn!(sender = %frame.sender, value_name = %frame.method, %err, "malformed observable payload");
            }
        }
    }

    /// Record the sender and its announced modules as reachable through
    /// `conn`; newly learned names are re-broadcast to the other peers.
    fn learn_routes(&self, conn: ConnectionId, frame: &Frame) {
        let mut added = Vec::new();
        {
            let mut routes = lock(&self.inner.routes);
            let mut record = |name: &str, routes: &mut HashMap<String, ConnectionId>| {
                let key = name.to_uppercase();
                if name.is_empty() || key == self.inner.module_key || routes.contains_key(&key) {
                    return;
                }
                routes.insert(key, conn);
                added.push(name.to_string());
            };

            record(&frame.sender, &mut routes);
            if let Ok(value) = serde_json::from_slice::<Value>(&frame.payload) {
                if let Some(list) = value.get(KEY_MODULES).and_then(Value::as_array) {
                    for name in list.iter().filter_map(Value::as_str) {
                        record(name, &mut routes);
                    }
                }
            }
        }

        if added.is_empty() {
            return;
        }
        debug!(module = %self.module(), conn, modules = ?added, "routes learned");
        let peers: Vec<ConnectionId> = lock(&self.inner.conns)
            .iter()
            .copied()
            .filter(|peer| *peer != conn)
            .collect();
        for peer in peers {
            self.send_route_frame(FrameKind::RouteUpd, peer);
        }
    }

    fn send_route_frame(&self, kind: FrameKind, conn: ConnectionId) {
        let payload = match serde_json::to_vec(&json!({ KEY_MODULES: self.known_modules() })) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "route table serialization failed");
                return;
            }
        };
        let frame = Frame::new(kind, String::new())
            .with_sender(self.module())
            .with_json(payload);
        if let Err(err) = self.provider().and_then(|p| Ok(p.send(conn, &frame)?)) {
            warn!(conn, ?kind, %err, "route frame send failed");
        }
    }
}

fn error_reply(chain_key: &str, code: i64, text: String) -> Message {
    let mut msg = Message::from_error(code, text);
    msg.chain_key = chain_key.to_string();
    msg
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use serde_json::json;

    use super::*;

    fn bus(module: &str) -> Bus {
        Bus::with_options(module, PayloadFilter::Plain, Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn local_send_invokes_handler_in_process() {
        let auth = bus("AUTH");
        auth.register("whoami", |bus: &Bus, _msg: Message, responder: Responder| {
            let reply = Message::new().with_cdata(json!({"module": bus.module()}));
            responder.respond(bus, reply);
        });

        let (tx, rx) = channel();
        auth.send("AUTH", "whoami", Message::new(), move |_bus, msg| {
            tx.send(msg).unwrap();
        })
        .unwrap();

        let reply = rx.recv().unwrap();
        assert_eq!(reply.cdata(), Some(&json!({"module": "AUTH"})));
        assert!(!reply.chain_key.is_empty());
    }

    #[test]
    fn local_target_matches_case_insensitively() {
        let auth = bus("AUTH");
        auth.register("ping", |bus: &Bus, _msg, responder: Responder| {
            responder.respond(bus, Message::new().with_cdata(json!("pong")));
        });

        let (tx, rx) = channel();
        auth.send("auth", "ping", Message::new(), move |_bus, msg| {
            tx.send(msg).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap().cdata(), Some(&json!("pong")));
    }

    #[test]
    fn local_unknown_method_yields_error_envelope() {
        let auth = bus("AUTH");
        let (tx, rx) = channel();
        auth.send("AUTH", "missing", Message::new(), move |_bus, msg| {
            tx.send(msg).unwrap();
        })
        .unwrap();

        let reply = rx.recv().unwrap();
        let err = reply.err().expect("expected error envelope");
        assert_eq!(err.code, err_code::METHOD_NOT_FOUND);
    }

    #[test]
    fn unrouted_module_is_rejected() {
        let auth = bus("AUTH");
        let result = auth.send("NOWHERE", "x", Message::new(), |_bus, _msg| {});
        assert!(matches!(result, Err(RouterError::NoRoute(module)) if module == "NOWHERE"));
    }

    #[test]
    fn local_continuation_chain_preserves_chain_key() {
        let auth = bus("AUTH");

        auth.register("secret", |bus: &Bus, msg: Message, responder: Responder| {
            // Leaf handler: echo the chain key it observed.
            let reply = Message::new().with_cdata(json!({"observed": msg.chain_key}));
            responder.respond(bus, reply);
        });

        auth.register("gate", |bus: &Bus, msg: Message, responder: Responder| {
            bus.continue_with(
                "AUTH",
                "secret",
                msg,
                responder,
                |bus: &Bus, reply: Message, responder: Responder| {
                    responder.respond(bus, reply);
                },
            );
        });

        let (tx, rx) = channel();
        auth.send("AUTH", "gate", Message::new(), move |_bus, msg| {
            tx.send(msg).unwrap();
        })
        .unwrap();

        let reply = rx.recv().unwrap();
        let observed = reply.cdata().unwrap()["observed"].as_str().unwrap();
        assert_eq!(observed, reply.chain_key, "one chain key end to end");
    }

    #[test]
    fn continuation_to_unreachable_module_fails_the_chain() {
        let auth = bus("AUTH");
        auth.register("gate", |bus: &Bus, msg: Message, responder: Responder| {
            bus.continue_with(
                "VAULT",
                "get",
                msg,
                responder,
                |bus: &Bus, reply: Message, responder: Responder| {
                    // The nested failure arrives as an error envelope and the
                    // chain forwards it to the original caller.
                    responder.respond(bus, reply);
                },
            );
        });

        let (tx, rx) = channel();
        auth.send("AUTH", "gate", Message::new(), move |_bus, msg| {
            tx.send(msg).unwrap();
        })
        .unwrap();

        let reply = rx.recv().unwrap();
        assert_eq!(reply.err().unwrap().code, err_code::NO_ROUTE);
    }

    #[test]
    fn local_methods_listing_is_sorted() {
        let auth = bus("AUTH");
        auth.register("login", |bus: &Bus, _msg, r: Responder| {
            r.respond(bus, Message::new());
        });
        auth.register("logout", |bus: &Bus, _msg, r: Responder| {
            r.respond(bus, Message::new());
        });

        let (tx, rx) = channel();
        auth.methods("AUTH", move |_bus, names| {
            tx.send(names).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap(), vec!["login", "logout"]);
    }

    #[test]
    fn local_emit_reaches_local_subscribers() {
        let jobs = bus("JOBS");
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        jobs.subscribe("JOBS", "progress", move |_bus, value| {
            tx.lock().unwrap().send(value).unwrap();
        })
        .unwrap();

        jobs.emit("progress", json!({"done": 3})).unwrap();
        assert_eq!(rx.recv().unwrap(), json!({"done": 3}));
    }

    #[test]
    fn send_after_shutdown_fails() {
        let auth = bus("AUTH");
        auth.shutdown();
        let err = auth.listen("127.0.0.1", 0).unwrap_err();
        assert!(matches!(
            err,
            RouterError::Transport(qbus_transport::TransportError::Shutdown)
        ));
    }
}
