//! Stream transport over TCP.
//!
//! On connect the packed handshake goes out as the very first two bytes on
//! the socket. After that the connection runs three tasks:
//!
//! - the read loop feeds a `BytesMut` buffer and drives the incremental
//!   frame decoder until it stops producing packets;
//! - the delivery task (started by `on_packet`) hands queued packets to the
//!   session in arrival order and, after close, drains the queue before
//!   signalling the terminal error;
//! - the write loop drains the bounded write queue into the socket.
//!
//! Writes never block: a saturated queue rejects the write immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{FinwireError, Result};
use crate::options::DialOptions;
use crate::protocol::{self, ConnContext, FrameDecoder, Handshake, PackOptions, Packet};
use crate::transport::{CloseCallback, Dialer, PacketCallback, Transport};

/// Dialer for the `tcp` scheme.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        uri: &Url,
        handshake: &Handshake,
        opts: &DialOptions,
    ) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = TcpTransport::connect(uri, handshake, opts).await?;
        Ok(transport)
    }
}

struct Shared {
    ctx: ConnContext,
    write_tx: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_hooks: Mutex<Vec<CloseCallback>>,
    close_reason: Mutex<Option<FinwireError>>,
}

impl Shared {
    /// Tear the connection down once; later calls are no-ops.
    fn shutdown(&self, reason: FinwireError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(%reason, "close tcp conn");

        let hooks: Vec<CloseCallback> = std::mem::take(&mut *self.close_hooks.lock().unwrap());
        for hook in hooks {
            hook(&reason);
        }

        *self.close_reason.lock().unwrap() = Some(reason);

        // wakes the read and write loops; the read loop then drops the
        // packet queue sender, which lets delivery drain and terminate
        self.shutdown.cancel();
    }
}

/// TCP transport.
pub struct TcpTransport {
    shared: Arc<Shared>,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
}

impl TcpTransport {
    pub(crate) async fn connect(
        uri: &Url,
        handshake: &Handshake,
        opts: &DialOptions,
    ) -> Result<Arc<Self>> {
        let ctx = ConnContext::new(handshake)?;

        let host = uri
            .host_str()
            .ok_or(FinwireError::InvalidAddress(url::ParseError::EmptyHost))?;
        let port = uri
            .port()
            .ok_or(FinwireError::InvalidAddress(url::ParseError::InvalidPort))?;

        let stream = tokio::time::timeout(opts.dial_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| FinwireError::DialTimeout)??;

        let (read_half, mut write_half) = stream.into_split();

        // the handshake must be the first bytes on the socket
        write_half.write_all(&handshake.pack()).await?;

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

        tokio::spawn(read_loop(
            shared.clone(),
            read_half,
            packet_tx,
            opts.read_buffer_size,
        ));
        tokio::spawn(write_loop(shared.clone(), write_half, write_rx));

        Ok(Arc::new(Self {
            shared,
            packet_rx: Mutex::new(Some(packet_rx)),
        }))
    }
}

impl Transport for TcpTransport {
    fn write(&self, packet: &mut Packet, opts: &PackOptions) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(FinwireError::ConnClosed);
        }

        let data = protocol::pack(&self.shared.ctx, packet, opts)?;

        self.shared.write_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FinwireError::WriteQueueFull,
            mpsc::error::TrySendError::Closed(_) => FinwireError::ConnClosed,
        })
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
        true
    }

    fn close(&self, reason: FinwireError) {
        self.shared.shutdown(reason);
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut read_half: OwnedReadHalf,
    packet_tx: mpsc::Sender<Packet>,
    read_buffer_size: usize,
) {
    let mut chunk = vec![0u8; read_buffer_size];
    let mut buf = BytesMut::with_capacity(read_buffer_size * 2);
    let mut decoder = FrameDecoder::new(shared.ctx.version);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            res = read_half.read(&mut chunk) => {
                let n = match res {
                    Ok(0) => {
                        shared.shutdown(FinwireError::ConnClosed);
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        shared.shutdown(e.into());
                        return;
                    }
                };

                buf.extend_from_slice(&chunk[..n]);

                loop {
                    match decoder.unpack(&shared.ctx, &mut buf) {
                        Ok(Some(packet)) => {
                            if packet_tx.try_send(packet).is_err() {
                                tracing::warn!("drop packet for read queue full");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            shared.shutdown(e);
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            data = write_rx.recv() => {
                let Some(data) = data else { return };

                if let Err(e) = write_half.write_all(&data).await {
                    shared.shutdown(e.into());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::protocol::{CodecType, PlatformType};

    fn handshake() -> Handshake {
        Handshake::new(1, CodecType::Protobuf, PlatformType::Openapi)
    }

    async fn listen() -> (TcpListener, Url) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = Url::parse(&format!("tcp://{addr}")).unwrap();
        (listener, url)
    }

    #[tokio::test]
    async fn test_handshake_is_first_on_the_wire() {
        let (listener, url) = listen().await;

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let _t = TcpTransport::connect(&url, &handshake(), &DialOptions::default())
            .await
            .unwrap();

        assert_eq!(accept.await.unwrap(), handshake().pack());
    }

    #[tokio::test]
    async fn test_write_reaches_server() {
        let (listener, url) = listen().await;

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hs = [0u8; 2];
            stream.read_exact(&mut hs).await.unwrap();

            let ctx = ConnContext::new(&Handshake::unpack(&hs).unwrap()).unwrap();
            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 1024];
            let mut decoder = FrameDecoder::new(ctx.version);

            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);

                if let Some(p) = decoder.unpack(&ctx, &mut buf).unwrap() {
                    return p;
                }
            }
        });

        let transport = TcpTransport::connect(&url, &handshake(), &DialOptions::default())
            .await
            .unwrap();

        let mut packet = Packet::request_raw(transport.context(), 10, b"payload".to_vec());
        transport
            .write(&mut packet, &PackOptions::default())
            .unwrap();

        let got = accept.await.unwrap();
        assert_eq!(got.cmd(), 10);
        assert_eq!(got.body, b"payload");
    }

    #[tokio::test]
    async fn test_inbound_packets_then_terminal_error() {
        let (listener, url) = listen().await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hs = [0u8; 2];
            stream.read_exact(&mut hs).await.unwrap();

            let ctx = ConnContext::new(&Handshake::unpack(&hs).unwrap()).unwrap();
            for i in 0..3u8 {
                let mut p = Packet::push_raw(&ctx, 100, vec![i]);
                let data = protocol::pack(&ctx, &mut p, &PackOptions::default()).unwrap();
                stream.write_all(&data).await.unwrap();
            }
            // server drops the connection after the pushes
        });

        let transport = TcpTransport::connect(&url, &handshake(), &DialOptions::default())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.on_packet(Arc::new(move |res| {
            tx.send(res.map(|p| p.body)).unwrap();
        }));

        let mut bodies = Vec::new();
        while let Some(res) = rx.recv().await {
            match res {
                Ok(body) => bodies.push(body),
                Err(e) => {
                    assert!(matches!(e, FinwireError::ConnClosed));
                    break;
                }
            }
        }

        assert_eq!(bodies, vec![vec![0], vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_write_fails_fast_after_close() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            let _conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let transport = TcpTransport::connect(&url, &handshake(), &DialOptions::default())
            .await
            .unwrap();

        transport.close(FinwireError::ConnClosed);

        let mut packet = Packet::request_raw(transport.context(), 10, vec![]);
        assert!(matches!(
            transport.write(&mut packet, &PackOptions::default()),
            Err(FinwireError::ConnClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_hooks_fire_exactly_once() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            let _conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let transport = TcpTransport::connect(&url, &handshake(), &DialOptions::default())
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_hook = fired.clone();
        transport.on_close(Box::new(move |_| {
            fired_hook.fetch_add(1, Ordering::SeqCst);
        }));

        transport.close(FinwireError::ConnClosed);
        transport.close(FinwireError::ConnClosed);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_queue_full_rejects() {
        let (listener, url) = listen().await;
        // never read past the handshake so the queue can back up
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hs = [0u8; 2];
            stream.read_exact(&mut hs).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let opts = DialOptions::default().with_write_queue_size(1);
        let transport = TcpTransport::connect(&url, &handshake(), &opts)
            .await
            .unwrap();

        // large frames so the kernel buffer and the queue both fill
        let body = vec![0u8; 1 << 20];
        let mut saw_full = false;

        for _ in 0..64 {
            let mut packet = Packet::request_raw(transport.context(), 10, body.clone());
            match transport.write(&mut packet, &PackOptions::default()) {
                Ok(()) => {}
                Err(FinwireError::WriteQueueFull) => {
                    saw_full = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert!(saw_full);
    }
}
