//! Per-connection context handed to every handler.
//!
//! A [`Context`] is created right after a successful upgrade and lives until
//! the connection leaves the registry.  It deliberately keeps three kinds of
//! state apart:
//!
//! - **Request metadata** ([`RequestMeta`]): immutable, shared read-only.
//! - **Handler-visible state**: the optional name and the current message.
//!   Reassembly buffers are *not* here; they belong to the connection's read
//!   loop.
//! - **User data**: an opaque, type-keyed slot for application extensions.
//!
//! Each dispatch gets its own view of the connection, bound to the message
//! that started it.  Views share everything else: naming a connection or
//! closing it through one view is seen by all of them.
//!
//! Outbound frames never touch the socket directly.  They are queued on a
//! bounded channel drained by the connection's writer task, which owns the
//! write half exclusively.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use kocket_core::{encode_frame, Message, MessageKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::application::events::EventSink;
use crate::domain::{ConnectionId, RequestMeta, SendError};

/// Something a handler can send.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as a Text frame.
    Text(String),
    /// Sent as a Binary frame.
    Binary(Bytes),
    /// Serialized to its JSON text and sent as a Text frame.
    Json(serde_json::Value),
}

impl Payload {
    /// Encodes the payload as one complete frame.
    ///
    /// # Errors
    ///
    /// [`SendError::Serialize`] if a JSON value cannot be rendered.
    pub fn encode(&self) -> Result<Bytes, SendError> {
        match self {
            Self::Text(text) => Ok(encode_frame(MessageKind::Text, text.as_bytes())),
            Self::Binary(data) => Ok(encode_frame(MessageKind::Binary, data)),
            Self::Json(value) => serde_json::to_string(value)
                .map(|text| encode_frame(MessageKind::Text, text.as_bytes()))
                .map_err(|e| SendError::Serialize(e.to_string())),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(data))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(data))
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Instruction for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write these bytes (one encoded frame).
    Frame(Bytes),
    /// Shut the write half down and stop.
    Close,
}

type UserData = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Connection-wide state, shared by every view of the connection.
struct ConnectionState {
    id: ConnectionId,
    request: RequestMeta,
    name: RwLock<Option<String>>,
    last_message: RwLock<Option<Message>>,
    data: RwLock<UserData>,
    outbound: mpsc::Sender<Outbound>,
    events: EventSink,
    closed: AtomicBool,
    close_signal: Notify,
}

/// State and send API of one upgraded connection.
pub struct Context {
    state: Arc<ConnectionState>,
    /// The message this view was dispatched for; `None` outside a dispatch.
    message: Option<Message>,
}

impl Context {
    /// Creates a context whose frames go to `outbound`.
    ///
    /// The server wires `outbound` to the connection's writer task; tests and
    /// custom transports can hold the receiving end directly.
    pub fn new(
        id: ConnectionId,
        request: RequestMeta,
        outbound: mpsc::Sender<Outbound>,
        events: EventSink,
    ) -> Self {
        Self {
            state: Arc::new(ConnectionState {
                id,
                request,
                name: RwLock::new(None),
                last_message: RwLock::new(None),
                data: RwLock::new(HashMap::new()),
                outbound,
                events,
                closed: AtomicBool::new(false),
                close_signal: Notify::new(),
            }),
            message: None,
        }
    }

    /// A view of the same connection bound to `message`.
    ///
    /// The read loop creates one per dispatch, so a handler reads the message
    /// that triggered it even if later messages complete first.  The message
    /// also becomes the connection's latest, which unbound views report.
    pub(crate) fn with_message(&self, message: Message) -> Self {
        *write(&self.state.last_message) = Some(message.clone());
        Self {
            state: Arc::clone(&self.state),
            message: Some(message),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    pub fn request(&self) -> &RequestMeta {
        &self.state.request
    }

    /// Path of the upgrade request, e.g. `/chat`.
    pub fn path(&self) -> &str {
        self.state.request.path()
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.state.request.query(key)
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Sends one message frame.
    ///
    /// Never fails from the caller's point of view: if the connection is
    /// closed, its queue is full, or the payload cannot be serialized, the
    /// failure is published as a [`ServerEvent::Error`](crate::domain::ServerEvent).
    pub fn send(&self, data: impl Into<Payload>) {
        if let Err(e) = data.into().encode().and_then(|frame| self.enqueue(frame)) {
            self.state.events.error(Some(self.id()), e);
        }
    }

    /// Serializes `value` to JSON and sends it as a Text frame.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(text) => self.send(text),
            Err(e) => self
                .state
                .events
                .error(Some(self.id()), SendError::Serialize(e.to_string())),
        }
    }

    /// Reads `source` to the end, then sends everything as one Binary frame.
    ///
    /// The frame header needs the full length, so nothing is written until
    /// the source is exhausted.  A read failure is reported like any other
    /// send failure and nothing is sent.
    pub async fn send_stream<R>(&self, mut source: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        match source.read_to_end(&mut buf).await {
            Ok(_) => self.send(buf),
            Err(e) => self
                .state
                .events
                .error(Some(self.id()), SendError::StreamRead(e.to_string())),
        }
    }

    /// Queues an already encoded frame.
    ///
    /// # Errors
    ///
    /// - [`SendError::Closed`] once the connection is closed or its writer
    ///   has stopped.
    /// - [`SendError::QueueFull`] when the writer is that far behind; the
    ///   frame is dropped.
    pub(crate) fn enqueue(&self, frame: Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match self.state.outbound.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    // ── Current message ───────────────────────────────────────────────────────

    /// The message being handled.  Outside a dispatch (e.g. a context from
    /// `Server::connections`), the most recently completed one.
    pub fn message(&self) -> Option<Message> {
        match &self.message {
            Some(message) => Some(message.clone()),
            None => read(&self.state.last_message).clone(),
        }
    }

    /// Raw bytes of the current message.
    pub fn buffer(&self) -> Option<Bytes> {
        self.message().map(|m| m.data)
    }

    /// The current message as UTF-8 text (lossy).
    pub fn text(&self) -> Option<String> {
        self.message().map(|m| m.as_text().into_owned())
    }

    /// The current message parsed as JSON; `None` if absent or invalid.
    pub fn json(&self) -> Option<serde_json::Value> {
        self.json_as()
    }

    /// The current message deserialized into `T`; `None` if absent or if it
    /// does not parse.
    pub fn json_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_slice(&self.message()?.data).ok()
    }

    // ── Naming ────────────────────────────────────────────────────────────────

    /// Assigns the label used by `Server::send_to`.  Names need not be
    /// unique and may be reassigned.
    pub fn set_name(&self, name: impl Into<String>) -> &Self {
        *write(&self.state.name) = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<String> {
        read(&self.state.name).clone()
    }

    pub(crate) fn has_name(&self, name: &str) -> bool {
        read(&self.state.name).as_deref() == Some(name)
    }

    // ── User data ─────────────────────────────────────────────────────────────

    /// Stores a value of type `T`, replacing any previous `T`.
    pub fn set_data<T: Any + Send + Sync>(&self, value: T) -> &Self {
        write(&self.state.data).insert(TypeId::of::<T>(), Box::new(value));
        self
    }

    /// Returns a clone of the stored `T`, if any.
    pub fn data<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        read(&self.state.data)
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// Removes and returns the stored `T`.
    pub fn take_data<T: Any + Send + Sync>(&self) -> Option<T> {
        write(&self.state.data)
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Closes the connection.  Calling it again does nothing.
    ///
    /// Never waits on the writer: frames already queued get a bounded grace
    /// period to reach the socket, then the socket is dropped.
    pub fn destroy(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("connection {}: closing", self.id());
        // Gone or full: either way the writer also watches the close signal.
        let _ = self.state.outbound.try_send(Outbound::Close);
        self.state.close_signal.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`Context::destroy`] has been called.  Any number of
    /// tasks may wait at once.
    pub(crate) async fn closed(&self) {
        let notified = self.state.close_signal.notified();
        tokio::pin!(notified);
        // Registered before the flag check so a concurrent destroy is not missed.
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.state.events
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("path", &self.path())
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// A handler that panics while holding one of these locks must not take the
// whole connection down with it.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConnectionError, ServerEvent};
    use bytes::BytesMut;
    use kocket_core::{FrameDecoder, Opcode};

    fn context() -> (Context, mpsc::Receiver<Outbound>, EventSink) {
        context_with_queue(16)
    }

    fn context_with_queue(size: usize) -> (Context, mpsc::Receiver<Outbound>, EventSink) {
        let (tx, rx) = mpsc::channel(size);
        let events = EventSink::new(16);
        let ctx = Context::new(ConnectionId::new(), RequestMeta::default(), tx, events.clone());
        (ctx, rx, events)
    }

    /// Decodes one queued frame with a client-role decoder.
    fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> kocket_core::Frame {
        match rx.try_recv().expect("a frame must be queued") {
            Outbound::Frame(bytes) => {
                let mut buf = BytesMut::from(&bytes[..]);
                FrameDecoder::client().decode(&mut buf).unwrap().unwrap()
            }
            Outbound::Close => panic!("expected a frame, got Close"),
        }
    }

    #[test]
    fn test_send_text_queues_one_text_frame() {
        let (ctx, mut rx, _) = context();

        ctx.send("hello");

        let frame = next_frame(&mut rx);
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.fin);
        assert!(!frame.masked);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(rx.try_recv().is_err(), "exactly one frame per send");
    }

    #[test]
    fn test_send_bytes_queues_binary_frame() {
        let (ctx, mut rx, _) = context();
        ctx.send(vec![1u8, 2, 3]);
        let frame = next_frame(&mut rx);
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn test_send_json_value_serializes_to_text() {
        let (ctx, mut rx, _) = context();
        ctx.send(serde_json::json!({ "name": "ann" }));
        let frame = next_frame(&mut rx);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(&frame.payload[..], br#"{"name":"ann"}"#);
    }

    #[test]
    fn test_send_json_struct() {
        #[derive(Serialize)]
        struct Greeting<'a> {
            hello: &'a str,
        }
        let (ctx, mut rx, _) = context();
        ctx.send_json(&Greeting { hello: "world" });
        assert_eq!(&next_frame(&mut rx).payload[..], br#"{"hello":"world"}"#);
    }

    #[tokio::test]
    async fn test_send_stream_buffers_whole_source() {
        // Arrange: a reader that yields its data in several small chunks.
        let (ctx, mut rx, _) = context();
        let source = tokio_test::io::Builder::new()
            .read(b"chunk-1 ")
            .read(b"chunk-2 ")
            .read(b"chunk-3")
            .build();

        // Act
        ctx.send_stream(source).await;

        // Assert: one Binary frame with everything.
        let frame = next_frame(&mut rx);
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(&frame.payload[..], b"chunk-1 chunk-2 chunk-3");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_stream_read_error_is_reported_not_sent() {
        let (ctx, mut rx, events) = context();
        let mut sub = events.subscribe();
        let source = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
            .build();

        ctx.send_stream(source).await;

        assert!(rx.try_recv().is_err());
        match sub.try_recv().unwrap() {
            ServerEvent::Error { error, .. } => {
                assert!(matches!(*error, ConnectionError::Send(SendError::StreamRead(_))));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_send_after_destroy_reports_closed() {
        let (ctx, mut rx, events) = context();
        let mut sub = events.subscribe();

        ctx.destroy();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        ctx.send("too late");

        assert!(rx.try_recv().is_err());
        match sub.try_recv().unwrap() {
            ServerEvent::Error { id, error } => {
                assert_eq!(id, Some(ctx.id()));
                assert!(matches!(*error, ConnectionError::Send(SendError::Closed)));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_send_when_writer_is_gone_reports_closed() {
        let (ctx, rx, events) = context();
        let mut sub = events.subscribe();
        drop(rx);

        ctx.send("nobody home");

        assert!(matches!(sub.try_recv().unwrap(), ServerEvent::Error { .. }));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (ctx, mut rx, _) = context();
        ctx.destroy();
        ctx.destroy();
        assert!(ctx.is_closed());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err(), "only one Close must be queued");
    }

    #[test]
    fn test_full_queue_reports_queue_full() {
        // Arrange: room for exactly one frame.
        let (ctx, mut rx, events) = context_with_queue(1);
        let mut sub = events.subscribe();

        // Act
        ctx.send("kept");
        ctx.send("dropped");

        // Assert: the first frame is queued, the second is reported.
        assert_eq!(&next_frame(&mut rx).payload[..], b"kept");
        assert!(rx.try_recv().is_err());
        match sub.try_recv().unwrap() {
            ServerEvent::Error { id, error } => {
                assert_eq!(id, Some(ctx.id()));
                assert!(matches!(*error, ConnectionError::Send(SendError::QueueFull)));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!ctx.is_closed(), "a full queue does not close the connection");
    }

    #[tokio::test]
    async fn test_closed_wakes_every_waiter() {
        // Arrange: two waiters, like the read loop and the writer.
        let (ctx, _rx, _) = context();
        let ctx = Arc::new(ctx);
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { ctx.closed().await })
            })
            .collect();
        tokio::task::yield_now().await;

        // Act
        ctx.destroy();

        // Assert
        for waiter in waiters {
            tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
                .await
                .expect("closed() must resolve")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_destroy_with_full_queue_still_signals_close() {
        let (ctx, mut rx, _) = context_with_queue(1);
        ctx.send("fills the queue");

        ctx.destroy();

        assert!(ctx.is_closed());
        tokio::time::timeout(std::time::Duration::from_secs(1), ctx.closed())
            .await
            .expect("closed() must resolve without room for the Close marker");
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_accessors_without_message() {
        let (ctx, _rx, _) = context();
        assert!(ctx.message().is_none());
        assert!(ctx.buffer().is_none());
        assert!(ctx.text().is_none());
        assert!(ctx.json().is_none());
    }

    #[test]
    fn test_accessors_read_bound_message() {
        let (ctx, _rx, _) = context();
        let ctx = ctx.with_message(Message::text(r#"{"name":"bob","n":2}"#));

        assert_eq!(ctx.text().as_deref(), Some(r#"{"name":"bob","n":2}"#));
        assert_eq!(ctx.json().unwrap()["name"], "bob");

        #[derive(serde::Deserialize)]
        struct Hello {
            n: u32,
        }
        assert_eq!(ctx.json_as::<Hello>().unwrap().n, 2);
    }

    #[test]
    fn test_json_fails_softly_on_invalid_json() {
        let (ctx, _rx, _) = context();
        let ctx = ctx.with_message(Message::text("not json"));
        assert!(ctx.json().is_none());
        assert_eq!(ctx.text().as_deref(), Some("not json"));
    }

    #[test]
    fn test_each_view_keeps_its_own_message() {
        // Arrange: two messages complete before either dispatch reads.
        let (ctx, _rx, _) = context();
        let first = ctx.with_message(Message::text("first"));
        let second = ctx.with_message(Message::binary(vec![9u8]));

        // Assert: each view sees its own message.
        assert_eq!(first.text().as_deref(), Some("first"));
        let msg = second.message().unwrap();
        assert_eq!(msg.kind, MessageKind::Binary);
        assert_eq!(&msg.data[..], &[9]);

        // The unbound context reports the latest one.
        assert_eq!(ctx.buffer().unwrap(), Bytes::from_static(&[9]));
    }

    #[test]
    fn test_views_share_name_and_lifecycle() {
        let (ctx, _rx, _) = context();
        let view = ctx.with_message(Message::text("hi"));

        view.set_name("ann");
        view.destroy();

        assert_eq!(view.id(), ctx.id());
        assert_eq!(ctx.name().as_deref(), Some("ann"));
        assert!(ctx.is_closed());
    }

    #[test]
    fn test_set_name_chains_and_reassigns() {
        let (ctx, _rx, _) = context();
        assert_eq!(ctx.set_name("ann").name().as_deref(), Some("ann"));
        ctx.set_name("bob");
        assert!(ctx.has_name("bob"));
        assert!(!ctx.has_name("ann"));
    }

    #[test]
    fn test_user_data_slots_are_typed() {
        #[derive(Clone, Debug, PartialEq)]
        struct Session(u32);

        let (ctx, _rx, _) = context();
        ctx.set_data(Session(7)).set_data(String::from("extra"));

        assert_eq!(ctx.data::<Session>(), Some(Session(7)));
        assert_eq!(ctx.data::<String>().as_deref(), Some("extra"));
        assert_eq!(ctx.take_data::<Session>(), Some(Session(7)));
        assert_eq!(ctx.data::<Session>(), None);
    }
}
