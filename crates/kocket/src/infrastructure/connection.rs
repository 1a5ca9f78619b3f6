//! Lifecycle of one accepted connection.
//!
//! ```text
//!   read request ─► 101 ─► register ─► read loop ─────────► unregister
//!        │                    │          │  Message → spawn dispatch
//!        └─ reject: close     │          │  Ping    → queue Pong
//!                             │          └─ Close / EOF / error
//!                             └─► writer task: drains the outbound queue
//! ```
//!
//! The read loop is the only place that touches the decoder and the
//! reassembly buffer, so frames are processed strictly in arrival order.
//! Dispatches run as independent tasks and never block reading; each one
//! gets a context view bound to its own message.
//!
//! Closing never waits on the peer.  Once a connection is closed its writer
//! has `close_timeout` to flush what is queued, then the socket is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use kocket_core::protocol::{encode_control, find_header_end};
use kocket_core::{FrameAction, FrameDecoder, HandshakeError, Opcode, Reassembler, UpgradeRequest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::application::{Context, DispatchOutcome, Outbound};
use crate::domain::{ConnectionError, ConnectionId, RequestMeta, SendError, ServerEvent};
use crate::infrastructure::server::Shared;

// ── Entry point ───────────────────────────────────────────────────────────────

/// Runs a connection from its first byte to its teardown.
///
/// Generic over the transport so that anything byte-stream shaped (a
/// `TcpStream`, an in-memory duplex) can be served.
pub(crate) async fn handle_connection<S>(stream: S, peer_addr: Option<SocketAddr>, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(shared.config.read_buffer_size);

    // ── Handshake ─────────────────────────────────────────────────────────────
    let request = match read_request(&mut reader, &mut buf, shared.config.max_handshake_size).await {
        Ok(request) => request,
        Err(e) => {
            debug!("{}: handshake rejected: {e}", peer_label(peer_addr));
            let _ = writer.shutdown().await;
            return;
        }
    };
    let response = match request.accept() {
        Ok(response) => response,
        Err(e) => {
            debug!(
                "{}: handshake rejected ({:?}): {e}",
                peer_label(peer_addr),
                request.raw_request_line
            );
            let _ = writer.shutdown().await;
            return;
        }
    };
    if let Err(e) = writer.write_all(response.as_bytes()).await {
        debug!("{}: failed to write handshake response: {e}", peer_label(peer_addr));
        return;
    }

    // ── Registration ──────────────────────────────────────────────────────────
    let id = ConnectionId::new();
    let meta = RequestMeta::from_request(&request, peer_addr);
    let path = meta.path().to_string();
    let (tx, rx) = mpsc::channel(shared.config.outbound_queue_size);
    let ctx = Arc::new(Context::new(id, meta, tx, shared.events.clone()));

    let writer_task = tokio::spawn(write_loop(
        writer,
        rx,
        Arc::clone(&ctx),
        shared.config.close_timeout(),
    ));
    shared.registry.add(Arc::clone(&ctx)).await;
    info!("connection {id}: open from {} on {path}", peer_label(peer_addr));
    shared.events.emit(ServerEvent::Connect { id, peer_addr, path });

    // ── Frames ────────────────────────────────────────────────────────────────
    if let Err(e) = read_loop(&mut reader, buf, &ctx, &shared).await {
        shared.events.error(Some(id), e);
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    shared.registry.remove(id).await;
    ctx.destroy();
    // Bounded by the close timeout: queued frames get that long to go out.
    let _ = writer_task.await;
    info!("connection {id}: closed");
    shared.events.emit(ServerEvent::Close { id });
}

fn peer_label(peer_addr: Option<SocketAddr>) -> String {
    peer_addr.map_or_else(|| "peer".to_string(), |addr| addr.to_string())
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Reads until the header block is complete and parses it.
///
/// The header may arrive across several reads.  Bytes after the blank line
/// are left in `buf`: a client may pipeline its first frame behind the
/// request.
async fn read_request<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<UpgradeRequest, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_header_end(buf) {
            if end > max_size {
                return Err(HandshakeError::TooLarge { max: max_size });
            }
            let head = buf.split_to(end);
            return UpgradeRequest::parse(&head);
        }
        if buf.len() >= max_size {
            return Err(HandshakeError::TooLarge { max: max_size });
        }

        buf.reserve(max_size - buf.len());
        match reader.read_buf(buf).await {
            Ok(0) => return Err(HandshakeError::Incomplete),
            Ok(_) => {}
            Err(e) => {
                trace!("read failed during handshake: {e}");
                return Err(HandshakeError::Incomplete);
            }
        }
    }
}

// ── Read loop ─────────────────────────────────────────────────────────────────

/// Decodes and acts on frames until the peer closes, the context is
/// destroyed, or the protocol is violated.
async fn read_loop<R>(
    reader: &mut R,
    mut buf: BytesMut,
    ctx: &Arc<Context>,
    shared: &Arc<Shared>,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let max_payload_size = shared.config.max_payload_size;
    let mut decoder = FrameDecoder::server().max_payload_size(max_payload_size);
    let mut reassembler = Reassembler::new(max_payload_size);

    loop {
        // Bytes left over from the handshake read are decoded before the
        // first socket read.
        while let Some(frame) = decoder.decode(&mut buf)? {
            trace!(
                "connection {}: {:?} fin={} len={}",
                ctx.id(),
                frame.opcode,
                frame.fin,
                frame.payload_len
            );

            match reassembler.push(frame)? {
                FrameAction::Message(message) => {
                    debug!(
                        "connection {}: {:?} message, {} bytes",
                        ctx.id(),
                        message.kind,
                        message.data.len()
                    );
                    spawn_dispatch(Arc::new(ctx.with_message(message)), Arc::clone(shared));
                }
                FrameAction::Pong { fin, payload } => {
                    match ctx.enqueue(encode_control(Opcode::Pong, fin, &payload)) {
                        Ok(()) => {}
                        Err(SendError::Closed) => return Ok(()),
                        // A dropped pong is reported; the connection stays up.
                        Err(e) => shared.events.error(Some(ctx.id()), e),
                    }
                }
                FrameAction::Close => {
                    debug!("connection {}: close frame received", ctx.id());
                    return Ok(());
                }
                FrameAction::Pending | FrameAction::Ignored => {}
            }

            if ctx.is_closed() {
                return Ok(());
            }
        }

        buf.reserve(shared.config.read_buffer_size);
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    debug!("connection {}: peer closed the stream", ctx.id());
                    return Ok(());
                }
            }
            () = ctx.closed() => return Ok(()),
        }
    }
}

fn spawn_dispatch(ctx: Arc<Context>, shared: Arc<Shared>) {
    tokio::spawn(async move {
        let id = ctx.id();
        match shared.pipeline.dispatch(ctx).await {
            DispatchOutcome::Completed => trace!("connection {id}: pipeline completed"),
            DispatchOutcome::Halted { at } => trace!("connection {id}: pipeline halted at #{at}"),
            DispatchOutcome::Faulted(fault) => shared.events.async_fault(fault),
        }
    });
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Sole owner of the write half.
///
/// Drains the queue until [`Outbound::Close`] or the first write failure,
/// which also closes the connection.  Once the connection is closed the
/// remaining frames get `close_timeout` to go out; after that the writer
/// gives up, even in the middle of a frame, and the write half is dropped.
async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    ctx: Arc<Context>,
    close_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let drain = async {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(bytes) => writer.write_all(&bytes).await?,
                Outbound::Close => break,
            }
        }
        writer.shutdown().await
    };
    let deadline = async {
        ctx.closed().await;
        tokio::time::sleep(close_timeout).await;
    };

    tokio::select! {
        result = drain => {
            if let Err(e) = result {
                ctx.events()
                    .error(Some(ctx.id()), SendError::Write(e.to_string()));
                ctx.destroy();
            }
        }
        () = deadline => {
            debug!("connection {}: close timed out, dropping unsent frames", ctx.id());
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
