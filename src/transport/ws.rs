//! Datagram transport over WebSocket.
//!
//! One WebSocket binary message is exactly one frame, decoded with the
//! one-shot unpack. The handshake travels as URL query parameters
//! (`version`, `codec`, `platform`); no two-byte preamble is sent.
//!
//! WebSocket control frames never reach the frame codec. They are handled at
//! this layer and surfaced to the session as synthetic packets:
//!
//! - incoming Ping: the transport replies with a Pong itself and surfaces a
//!   heartbeat request carrying the ping payload;
//! - incoming Pong: surfaced as a heartbeat response; when the payload
//!   decodes as a heartbeat with an id, the packet's request id is set from
//!   it;
//! - incoming Close: surfaced as a push with the close cmd, carrying code
//!   and reason.
//!
//! Because control framing is native here, `needs_control_handling` is
//! false: the session must not send its own heartbeat acks on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::ProtobufCodec;
use crate::control::{self, cmd, Heartbeat};
use crate::error::{FinwireError, Result};
use crate::options::DialOptions;
use crate::protocol::{self, status, ConnContext, Handshake, PackOptions, Packet};
use crate::transport::{CloseCallback, Dialer, PacketCallback, Transport};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Dialer for the `ws` and `wss` schemes.
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        uri: &Url,
        handshake: &Handshake,
        opts: &DialOptions,
    ) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = WsTransport::connect(uri, handshake, opts).await?;
        Ok(transport)
    }
}

/// Outbound WebSocket traffic: packed frames plus native control frames.
enum Outbound {
    Frame(Vec<u8>),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

struct Shared {
    ctx: ConnContext,
    write_tx: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_hooks: Mutex<Vec<CloseCallback>>,
    close_reason: Mutex<Option<FinwireError>>,
}

impl Shared {
    fn shutdown(&self, reason: FinwireError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(%reason, "close ws conn");

        let hooks: Vec<CloseCallback> = std::mem::take(&mut *self.close_hooks.lock().unwrap());
        for hook in hooks {
            hook(&reason);
        }

        *self.close_reason.lock().unwrap() = Some(reason);
        self.shutdown.cancel();
    }
}

/// WebSocket transport.
pub struct WsTransport {
    shared: Arc<Shared>,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
}

impl WsTransport {
    pub(crate) async fn connect(
        uri: &Url,
        handshake: &Handshake,
        opts: &DialOptions,
    ) -> Result<Arc<Self>> {
        let ctx = ConnContext::new(handshake)?;

        let mut uri = uri.clone();
        uri.query_pairs_mut()
            .append_pair("version", &handshake.version.to_string())
            .append_pair("codec", &handshake.codec.as_u8().to_string())
            .append_pair("platform", &handshake.platform.as_u8().to_string());

        let (stream, _) = tokio::time::timeout(opts.dial_timeout, connect_async(uri.as_str()))
            .await
            .map_err(|_| FinwireError::DialTimeout)??;

        let (sink, source) = stream.split();

        let (write_tx, write_rx) = mpsc::channel(opts.write_queue_size);
        let (packet_tx, packet_rx) = mpsc::channel(opts.read_queue_size);

        let shared = Arc::new(Shared {
            ctx,
            write_tx,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_hooks: Mutex::new(Vec::new()),
            close_reason: Mutex::new(None),
        });

        tokio::spawn(read_loop(shared.clone(), source, packet_tx));
        tokio::spawn(write_loop(shared.clone(), sink, write_rx));

        Ok(Arc::new(Self {
            shared,
            packet_rx: Mutex::new(Some(packet_rx)),
        }))
    }

    fn enqueue(&self, outbound: Outbound) -> Result<()> {
        self.shared.write_tx.try_send(outbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FinwireError::WriteQueueFull,
            mpsc::error::TrySendError::Closed(_) => FinwireError::ConnClosed,
        })
    }
}

impl Transport for WsTransport {
    fn write(&self, packet: &mut Packet, opts: &PackOptions) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(FinwireError::ConnClosed);
        }

        if packet.is_ping() {
            tracing::debug!("send ping");
            return self.enqueue(Outbound::Ping(Bytes::from(packet.body.clone())));
        }

        if packet.is_close() {
            let frame = packet
                .unmarshal::<control::Close>()
                .ok()
                .map(|close| CloseFrame {
                    code: CloseCode::from(close.code as u16),
                    reason: close.reason.into(),
                });
            return self.enqueue(Outbound::Close(frame));
        }

        let data = protocol::pack(&self.shared.ctx, packet, opts)?;
        self.enqueue(Outbound::Frame(data))
    }

    fn on_packet(&self, cb: PacketCallback) {
        let Some(mut rx) = self.packet_rx.lock().unwrap().take() else {
            tracing::warn!("packet callback already registered");
            return;
        };

        let shared = self.shared.clone();

        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                cb(Ok(packet));
            }

            let reason = shared
                .close_reason
                .lock()
                .unwrap()
                .take()
                .unwrap_or(FinwireError::ConnClosed);
            cb(Err(reason));
        });
    }

    fn on_close(&self, cb: CloseCallback) {
        self.shared.close_hooks.lock().unwrap().push(cb);
    }

    fn context(&self) -> &ConnContext {
        &self.shared.ctx
    }

    fn needs_control_handling(&self) -> bool {
        false
    }

    fn close(&self, reason: FinwireError) {
        self.shared.shutdown(reason);
    }
}

fn deliver(packet_tx: &mpsc::Sender<Packet>, packet: Packet) {
    if packet_tx.try_send(packet).is_err() {
        tracing::warn!("drop packet for read queue full");
    }
}

async fn read_loop(shared: Arc<Shared>, mut source: WsSource, packet_tx: mpsc::Sender<Packet>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            msg = source.next() => {
                let msg = match msg {
                    None => {
                        shared.shutdown(FinwireError::ConnClosed);
                        return;
                    }
                    Some(Err(e)) => {
                        shared.shutdown(e.into());
                        return;
                    }
                    Some(Ok(msg)) => msg,
                };

                match msg {
                    Message::Binary(data) => match protocol::unpack_bytes(&shared.ctx, &data) {
                        Ok(packet) => deliver(&packet_tx, packet),
                        Err(e) => {
                            shared.shutdown(e);
                            return;
                        }
                    },
                    Message::Text(text) => {
                        match protocol::unpack_bytes(&shared.ctx, text.as_bytes()) {
                            Ok(packet) => deliver(&packet_tx, packet),
                            Err(e) => {
                                shared.shutdown(e);
                                return;
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        tracing::debug!("receive ping");
                        let _ = shared.write_tx.try_send(Outbound::Pong(payload.clone()));

                        let packet =
                            Packet::request_raw(&shared.ctx, cmd::HEARTBEAT, payload.to_vec());
                        deliver(&packet_tx, packet);
                    }
                    Message::Pong(payload) => {
                        tracing::debug!("receive pong");

                        let mut packet = Packet::response_raw(
                            &shared.ctx,
                            cmd::HEARTBEAT,
                            status::SUCCESS,
                            payload.to_vec(),
                        );

                        // heartbeat pongs echo our payload; recover the
                        // request id so the session can match them
                        if let Ok(beat) = ProtobufCodec::decode::<Heartbeat>(&payload) {
                            if let Some(id) = beat.heartbeat_id {
                                packet.metadata.request_id = id as u32;
                            }
                        }

                        deliver(&packet_tx, packet);
                    }
                    Message::Close(frame) => {
                        let close = frame
                            .map(|f| control::Close {
                                code: i32::from(u16::from(f.code)),
                                reason: f.reason.to_string(),
                            })
                            .unwrap_or_default();

                        match Packet::push(&shared.ctx, cmd::CLOSE, &close) {
                            Ok(packet) => deliver(&packet_tx, packet),
                            Err(e) => tracing::warn!(%e, "failed to surface close frame"),
                        }
                    }
                    Message::Frame(_) => {}
                }
            }
        }
    }
}

async fn write_loop(shared: Arc<Shared>, mut sink: WsSink, mut write_rx: mpsc::Receiver<Outbound>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                let _ = sink.close().await;
                return;
            }
            outbound = write_rx.recv() => {
                let Some(outbound) = outbound else { return };

                let msg = match outbound {
                    Outbound::Frame(data) => Message::Binary(data.into()),
                    Outbound::Ping(payload) => Message::Ping(payload),
                    Outbound::Pong(payload) => Message::Pong(payload),
                    Outbound::Close(frame) => Message::Close(frame),
                };

                if let Err(e) = sink.send(msg).await {
                    shared.shutdown(e.into());
                    return;
                }
            }
        }
    }
}
