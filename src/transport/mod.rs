//! Transport abstraction - the contract consumed by the session layer.
//!
//! A transport owns one live connection: it packs and writes outbound
//! packets, feeds every inbound packet (or the terminal error) to a single
//! registered callback in arrival order, and reports close exactly once.
//! Transports are chosen by URL scheme through the dialer registry; `tcp`,
//! `ws` and `wss` are built in and additional schemes may be registered at
//! startup.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use url::Url;

use crate::error::{FinwireError, Result};
use crate::options::DialOptions;
use crate::protocol::{ConnContext, Handshake, PackOptions, Packet};

mod tcp;
mod ws;

pub use tcp::TcpDialer;
pub use ws::WsDialer;

/// Receives every inbound packet, then the terminal error once.
pub type PacketCallback = Arc<dyn Fn(Result<Packet>) + Send + Sync>;

/// Fired exactly once when the transport transitions to closed.
pub type CloseCallback = Box<dyn FnOnce(&FinwireError) + Send>;

/// One live connection.
pub trait Transport: Send + Sync {
    /// Pack and enqueue a frame.
    ///
    /// Fails synchronously with [`FinwireError::ConnClosed`] after close and
    /// [`FinwireError::WriteQueueFull`] when the bounded write queue is
    /// saturated; writes never block the caller.
    fn write(&self, packet: &mut Packet, opts: &PackOptions) -> Result<()>;

    /// Register the packet callback. Only the first registration takes
    /// effect; packets received before registration stay queued.
    fn on_packet(&self, cb: PacketCallback);

    /// Register a close callback.
    fn on_close(&self, cb: CloseCallback);

    /// Per-connection context: negotiated codec, version, request-id
    /// generator.
    fn context(&self) -> &ConnContext;

    /// True when the session must answer heartbeat pings itself. Message
    /// transports handle control framing natively and return false.
    fn needs_control_handling(&self) -> bool;

    /// Close the connection; idempotent.
    fn close(&self, reason: FinwireError);
}

/// Establishes a transport for one URL scheme.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        uri: &Url,
        handshake: &Handshake,
        opts: &DialOptions,
    ) -> Result<Arc<dyn Transport>>;
}

static DIALERS: LazyLock<RwLock<HashMap<String, Arc<dyn Dialer>>>> = LazyLock::new(|| {
    let mut dialers: HashMap<String, Arc<dyn Dialer>> = HashMap::new();
    dialers.insert("tcp".to_owned(), Arc::new(TcpDialer));
    dialers.insert("ws".to_owned(), Arc::new(WsDialer));
    dialers.insert("wss".to_owned(), Arc::new(WsDialer));
    RwLock::new(dialers)
});

/// Register a dialer for a URL scheme.
///
/// # Panics
///
/// Panics when the scheme already has a dialer; duplicate registration is a
/// programming error.
pub fn register_dialer(scheme: &str, dialer: Arc<dyn Dialer>) {
    let mut dialers = DIALERS.write().unwrap();

    if dialers.contains_key(scheme) {
        panic!("dialer for {scheme} already exists");
    }

    dialers.insert(scheme.to_owned(), dialer);
}

/// Find the dialer for a URL scheme.
pub fn get_dialer(scheme: &str) -> Option<Arc<dyn Dialer>> {
    DIALERS.read().unwrap().get(scheme).cloned()
}
