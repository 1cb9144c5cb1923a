//! Socket client - the session layer on top of a transport.
//!
//! The [`Client`] owns one transport at a time and:
//!
//! 1. Authenticates with a caller-supplied token getter
//! 2. Multiplexes outstanding requests by request id
//! 3. Fans pushes out to per-cmd subscribers
//! 4. Runs keepalive ping/pong
//! 5. Reconnects transparently, resuming the session id when it is still
//!    valid and re-authenticating when it has expired
//!
//! # Example
//!
//! ```ignore
//! use finwire::{Client, CodecType, DialOptions, Handshake, PlatformType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new();
//!     client.subscribe(3001, |packet| {
//!         println!("push: {} bytes", packet.body.len());
//!     });
//!
//!     let handshake = Handshake::new(1, CodecType::Protobuf, PlatformType::Openapi);
//!     client
//!         .dial("tcp://127.0.0.1:9000", handshake, DialOptions::default())
//!         .await?;
//!
//!     let res = client.request(2001, &my_request, Default::default()).await?;
//!     # _ = res;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::{self, BodyMessage};
use crate::control::{self, cmd, AuthRequest, AuthResponse, Heartbeat, ReconnectRequest};
use crate::error::{FinwireError, Result};
use crate::options::{DialOptions, RequestOptions};
use crate::protocol::{
    status, Handshake, Metadata, PackOptions, Packet, PacketType,
};
use crate::transport::{self, Transport};

/// Delay between consecutive reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Safety margin subtracted from the session expiry before deciding whether
/// a resume is still worth attempting.
const AUTH_EXPIRY_MARGIN_MS: i64 = 10_000;

type PushCallback = Arc<dyn Fn(&Packet) + Send + Sync>;
type PacketHook = Arc<dyn Fn(&Packet) + Send + Sync>;
type CloseHook = Arc<dyn Fn(Option<&FinwireError>) + Send + Sync>;
type ReconnectedHook = Arc<dyn Fn() + Send + Sync>;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// One-slot handoff for a response. A second response for the same id finds
/// the sender gone and is dropped with a warning.
struct AwaiterSlot {
    tx: Option<oneshot::Sender<Packet>>,
}

/// Reconnecting socket client.
///
/// Subscribers and hooks are expected to be registered before `dial`, or at
/// least before traffic arrives; registration is not synchronized against
/// delivery.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            inner: Arc::new_cyclic(|weak| ClientInner {
                weak: weak.clone(),
                transport: Mutex::new(None),
                addr: Mutex::new(None),
                handshake: Mutex::new(None),
                dial_opts: Mutex::new(DialOptions::default()),
                awaiters: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                on_ping: RwLock::new(None),
                on_pong: RwLock::new(None),
                on_close: RwLock::new(None),
                after_reconnected: RwLock::new(None),
                auth_info: RwLock::new(None),
                last_keepalive_id: AtomicU32::new(0),
                last_pong_at: Mutex::new(Instant::now()),
                reconnect_count: AtomicU32::new(0),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Dial the server, authenticate, and start keepalive.
    pub async fn dial(&self, addr: &str, handshake: Handshake, opts: DialOptions) -> Result<()> {
        let url = Url::parse(addr)?;

        let dialer = transport::get_dialer(url.scheme())
            .ok_or_else(|| FinwireError::DialerNotFound(url.scheme().to_owned()))?;

        *self.inner.addr.lock().unwrap() = Some(url.clone());
        *self.inner.handshake.lock().unwrap() = Some(handshake);
        *self.inner.dial_opts.lock().unwrap() = opts.clone();

        tracing::debug!(%url, "dialing");
        let transport = dialer.dial(&url, &handshake, &opts).await?;
        self.inner.attach(transport);
        tracing::debug!(%url, "connected");

        if !opts.keepalive.is_zero() {
            tokio::spawn(keepalive_loop(
                Arc::downgrade(&self.inner),
                self.inner.shutdown.clone(),
                opts.keepalive,
                opts.keepalive_timeout,
            ));
        }

        self.inner.auth(&opts).await
    }

    /// Issue a request and wait for its response.
    ///
    /// A non-zero response status is surfaced as [`FinwireError::Remote`]
    /// carrying the code and message from the error body.
    pub async fn request<T: BodyMessage>(
        &self,
        cmd_code: u32,
        body: &T,
        opts: RequestOptions,
    ) -> Result<Packet> {
        self.inner
            .do_request(cmd_code, body, opts.timeout, &opts.metadata)
            .await
    }

    /// Register a push subscriber for a cmd. Callbacks run on the delivery
    /// task in registration order.
    pub fn subscribe(&self, cmd_code: u32, callback: impl Fn(&Packet) + Send + Sync + 'static) {
        self.inner
            .subscribers
            .write()
            .unwrap()
            .entry(cmd_code)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Hook invoked on every inbound heartbeat ping.
    pub fn on_ping(&self, hook: impl Fn(&Packet) + Send + Sync + 'static) {
        *self.inner.on_ping.write().unwrap() = Some(Arc::new(hook));
    }

    /// Hook invoked on every inbound heartbeat pong.
    pub fn on_pong(&self, hook: impl Fn(&Packet) + Send + Sync + 'static) {
        *self.inner.on_pong.write().unwrap() = Some(Arc::new(hook));
    }

    /// Hook invoked once when the client closes. The argument is `None` for
    /// a user-initiated close and the fatal error otherwise.
    pub fn on_close(&self, hook: impl Fn(Option<&FinwireError>) + Send + Sync + 'static) {
        *self.inner.on_close.write().unwrap() = Some(Arc::new(hook));
    }

    /// Hook invoked after every successful reconnect.
    pub fn after_reconnected(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.after_reconnected.write().unwrap() = Some(Arc::new(hook));
    }

    /// The session grant from the last successful authentication.
    pub fn auth_info(&self) -> Option<AuthResponse> {
        self.inner.auth_info.read().unwrap().clone()
    }

    /// Close the connection and the client. Idempotent.
    pub fn close(&self) {
        self.inner.close_with(None);
    }
}

struct ClientInner {
    /// Self-reference handed to transport callbacks and spawned tasks so
    /// they never keep the client alive on their own.
    weak: Weak<ClientInner>,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    addr: Mutex<Option<Url>>,
    handshake: Mutex<Option<Handshake>>,
    dial_opts: Mutex<DialOptions>,

    awaiters: RwLock<HashMap<u32, AwaiterSlot>>,
    subscribers: RwLock<HashMap<u32, Vec<PushCallback>>>,

    on_ping: RwLock<Option<PacketHook>>,
    on_pong: RwLock<Option<PacketHook>>,
    on_close: RwLock<Option<CloseHook>>,
    after_reconnected: RwLock<Option<ReconnectedHook>>,

    auth_info: RwLock<Option<AuthResponse>>,

    last_keepalive_id: AtomicU32,
    last_pong_at: Mutex<Instant>,
    reconnect_count: AtomicU32,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl ClientInner {
    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .lock()
            .unwrap()
            .clone()
            .ok_or(FinwireError::ConnClosed)
    }

    fn pack_options(&self) -> PackOptions {
        PackOptions::gzip_size(self.dial_opts.lock().unwrap().min_gzip_size)
    }

    /// Store the transport and route its packets into the dispatcher.
    fn attach(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock().unwrap() = Some(transport.clone());

        let weak = self.weak.clone();
        transport.on_packet(Arc::new(move |res| {
            if let Some(inner) = weak.upgrade() {
                inner.on_packet(res);
            }
        }));
    }

    async fn auth(&self, opts: &DialOptions) -> Result<()> {
        let Some(getter) = opts.token_getter.clone() else {
            return Ok(());
        };

        let token = getter()?;
        let res = self
            .do_request(cmd::AUTH, &AuthRequest { token }, opts.auth_timeout, &[])
            .await?;

        let info: AuthResponse = res.unmarshal()?;
        *self.auth_info.write().unwrap() = Some(info);

        Ok(())
    }

    async fn do_request<T: BodyMessage>(
        &self,
        cmd_code: u32,
        body: &T,
        timeout: Duration,
        metadata: &[(String, String)],
    ) -> Result<Packet> {
        let transport = self.transport()?;

        let mut packet = Packet::request(transport.context(), cmd_code, body)?;
        for (key, val) in metadata {
            packet.metadata.set(key, val)?;
        }

        let request_id = packet.request_id();
        let rx = self.register_awaiter(request_id);

        if let Err(e) = transport.write(&mut packet, &self.pack_options()) {
            self.remove_awaiter(request_id);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.remove_awaiter(request_id);

        let response = match result {
            Err(_) => return Err(FinwireError::RequestTimeout(request_id)),
            Ok(Err(_)) => return Err(FinwireError::AwaitDropped),
            Ok(Ok(packet)) => packet,
        };

        if let Some(err) = response.remote_err() {
            return Err(FinwireError::Remote {
                status: response.status_code(),
                code: err.code,
                message: err.msg,
            });
        }

        Ok(response)
    }

    fn register_awaiter(&self, request_id: u32) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.awaiters
            .write()
            .unwrap()
            .insert(request_id, AwaiterSlot { tx: Some(tx) });
        rx
    }

    fn remove_awaiter(&self, request_id: u32) {
        self.awaiters.write().unwrap().remove(&request_id);
    }

    /// Close every pending slot; waiting callers observe a wait error.
    fn drain_awaiters(&self) {
        self.awaiters.write().unwrap().clear();
    }

    fn on_packet(&self, res: Result<Packet>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let packet = match res {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!(%e, "conn receive packet error");
                self.trigger_reconnect();
                return;
            }
        };

        tracing::debug!(
            packet_type = %packet.metadata.packet_type,
            cmd = packet.cmd(),
            request_id = packet.request_id(),
            status_code = packet.status_code(),
            "got packet",
        );

        if packet.is_control() {
            self.handle_control(packet);
            return;
        }

        match packet.metadata.packet_type {
            PacketType::Push => self.handle_push(&packet),
            PacketType::Response => self.handle_response(packet),
            PacketType::Request => {
                tracing::warn!(cmd = packet.cmd(), "client does not serve requests");
            }
        }
    }

    fn handle_control(&self, packet: Packet) {
        if packet.is_ping() {
            self.handle_ping(&packet);
            return;
        }

        if packet.is_pong() {
            self.handle_pong(&packet);
            return;
        }

        if packet.is_close() {
            self.close_by_server(&packet);
            return;
        }

        if packet.is_auth() || packet.is_reconnect() {
            self.handle_response(packet);
        }
    }

    fn handle_push(&self, packet: &Packet) {
        let subscribers = self.subscribers.read().unwrap();

        let Some(callbacks) = subscribers.get(&packet.cmd()) else {
            return;
        };

        for callback in callbacks {
            callback(packet);
        }
    }

    fn handle_response(&self, packet: Packet) {
        let request_id = packet.request_id();
        let mut awaiters = self.awaiters.write().unwrap();

        match awaiters.get_mut(&request_id) {
            Some(slot) => match slot.tx.take() {
                Some(tx) => {
                    let _ = tx.send(packet);
                }
                None => tracing::warn!(request_id, "duplicate response dropped"),
            },
            None => tracing::warn!(request_id, "no receiver for response"),
        }
    }

    fn handle_ping(&self, packet: &Packet) {
        let hook = self.on_ping.read().unwrap().clone();
        if let Some(hook) = hook {
            hook(packet);
        }

        let Ok(transport) = self.transport() else {
            return;
        };

        // message transports answer pings at the framing layer themselves
        if !transport.needs_control_handling() {
            return;
        }

        let mut res = Packet::response_raw(
            transport.context(),
            cmd::HEARTBEAT,
            status::SUCCESS,
            packet.body.clone(),
        )
        .with_request_id(packet.request_id());

        if let Err(e) = transport.write(&mut res, &self.pack_options()) {
            tracing::error!(%e, "failed to send heartbeat ack");
        }
    }

    fn handle_pong(&self, packet: &Packet) {
        let hook = self.on_pong.read().unwrap().clone();
        if let Some(hook) = hook {
            hook(packet);
        }

        if packet.request_id() == self.last_keepalive_id.load(Ordering::SeqCst) {
            *self.last_pong_at.lock().unwrap() = Instant::now();
        }
    }

    fn close_by_server(&self, packet: &Packet) {
        match packet.unmarshal::<control::Close>() {
            Ok(close) => {
                tracing::error!(code = close.code, reason = %close.reason, "close by server");
            }
            Err(e) => tracing::error!(%e, "failed to unmarshal close reason"),
        }

        if let Ok(transport) = self.transport() {
            transport.close(FinwireError::ConnClosed);
        }

        self.trigger_reconnect();
    }

    fn keepalive_tick(&self, keepalive_timeout: Duration) {
        if self.last_keepalive_id.load(Ordering::SeqCst) != 0 {
            let since_pong = self.last_pong_at.lock().unwrap().elapsed();

            if since_pong > keepalive_timeout {
                tracing::error!(elapsed = ?since_pong, "keepalive timeout");
                self.trigger_reconnect();
                return;
            }
        }

        let Ok(transport) = self.transport() else {
            return;
        };

        let ctx = transport.context();
        let id = ctx.next_request_id();
        let beat = Heartbeat {
            timestamp: now_ms(),
            heartbeat_id: Some(id as i32),
        };

        let body = match codec::marshal(ctx.codec, &beat) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(%e, "failed to build heartbeat");
                return;
            }
        };

        let mut metadata = Metadata::new(PacketType::Request, ctx.codec, cmd::HEARTBEAT);
        metadata.request_id = id;
        let mut packet = Packet { metadata, body };

        match transport.write(&mut packet, &self.pack_options()) {
            Ok(()) => {
                self.last_keepalive_id.store(id, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::error!(%e, "keepalive failed to ping");
                self.trigger_reconnect();
            }
        }
    }

    /// Start the reconnect loop unless one is already running; concurrent
    /// triggers collapse into a single loop.
    fn trigger_reconnect(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let Some(inner) = self.weak.upgrade() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };

        tokio::spawn(async move {
            inner.reconnect_loop().await;
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            tracing::info!("start reconnecting");

            match self.reconnect_once().await {
                Ok(()) => {
                    tracing::info!("reconnect success");

                    let hook = self.after_reconnected.read().unwrap().clone();
                    if let Some(hook) = hook {
                        hook();
                    }

                    return;
                }
                Err(FinwireError::HitMaxReconnect) => {
                    tracing::error!("close client for hit max reconnect count");
                    self.close_with(Some(FinwireError::HitMaxReconnect));
                    return;
                }
                Err(e) => {
                    tracing::error!(%e, "reconnect failed");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    async fn reconnect_once(&self) -> Result<()> {
        let opts = self.dial_opts.lock().unwrap().clone();

        if opts.max_reconnect > 0
            && self.reconnect_count.load(Ordering::SeqCst) >= opts.max_reconnect
        {
            return Err(FinwireError::HitMaxReconnect);
        }

        self.reconnect_count.fetch_add(1, Ordering::SeqCst);

        if let Some(old) = self.transport.lock().unwrap().take() {
            old.close(FinwireError::ConnClosed);
        }

        self.drain_awaiters();

        let url = self
            .addr
            .lock()
            .unwrap()
            .clone()
            .ok_or(FinwireError::ConnClosed)?;
        let handshake = self
            .handshake
            .lock()
            .unwrap()
            .ok_or(FinwireError::ConnClosed)?;
        let dialer = transport::get_dialer(url.scheme())
            .ok_or_else(|| FinwireError::DialerNotFound(url.scheme().to_owned()))?;

        let transport = dialer.dial(&url, &handshake, &opts).await?;
        self.attach(transport);

        let has_auth = self.auth_info.read().unwrap().is_some();
        if has_auth {
            if self.is_auth_expired() {
                self.auth(&opts).await?;
            } else {
                self.resume_session(&opts).await?;
            }
        }

        // the connection is fresh: restart keepalive bookkeeping and the
        // retry counter
        self.last_keepalive_id.store(0, Ordering::SeqCst);
        *self.last_pong_at.lock().unwrap() = Instant::now();
        self.reconnect_count.store(0, Ordering::SeqCst);

        Ok(())
    }

    async fn resume_session(&self, opts: &DialOptions) -> Result<()> {
        let session_id = self
            .auth_info
            .read()
            .unwrap()
            .as_ref()
            .map(|info| info.session_id.clone())
            .unwrap_or_default();

        let res = self
            .do_request(
                cmd::RECONNECT,
                &ReconnectRequest { session_id },
                opts.auth_timeout,
                &[],
            )
            .await;

        match res {
            Ok(packet) => {
                let info: AuthResponse = packet.unmarshal()?;
                *self.auth_info.write().unwrap() = Some(info);
                Ok(())
            }
            // the server no longer knows the session; fall back to full auth
            Err(FinwireError::Remote { status, .. }) if status == status::UNAUTHENTICATED => {
                self.auth(opts).await
            }
            Err(e) => Err(e),
        }
    }

    fn is_auth_expired(&self) -> bool {
        match self.auth_info.read().unwrap().as_ref() {
            None => true,
            Some(info) => now_ms() >= info.expires - AUTH_EXPIRY_MARGIN_MS,
        }
    }

    fn close_with(&self, err: Option<FinwireError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("close client");

        // signal first so keepalive and delivery exit, then drop the
        // transport, then tell the user
        self.shutdown.cancel();
        self.drain_awaiters();

        if let Some(transport) = self.transport.lock().unwrap().take() {
            transport.close(FinwireError::ConnClosed);
        }

        let hook = self.on_close.read().unwrap().clone();
        if let Some(hook) = hook {
            hook(err.as_ref());
        }
    }
}

async fn keepalive_loop(
    inner: Weak<ClientInner>,
    shutdown: CancellationToken,
    interval: Duration,
    keepalive_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };

        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        inner.keepalive_tick(keepalive_timeout);
    }
}
