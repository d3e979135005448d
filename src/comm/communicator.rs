use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::SystemTime;

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

use crate::comm::context::CommunicatorContext;
use crate::comm::handler::MessageHandler;
use crate::comm::system_handlers::builtin_system_handlers;
use crate::comm::waiters::{Registration, Waiters};
use crate::config::{CommunicatorConfig, WaitTime};
use crate::liveness::LivenessPeer;
use crate::messaging::envelope::{encode_frame, read_frame, Envelope};
use crate::messaging::message::{Message, StructuredPayload};
use crate::messaging::system_types::SystemMessageType;
use crate::raw::raw_channel::RawChannel;

const KEY_VERSION: &str = "version";
const KEY_TIMESTAMP: &str = "timestamp";
const KEY_TUNNEL: &str = "tunnel";
pub(crate) const KEY_PONG: &str = "pong";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// sends the first handshake
    Initiator,
    Responder,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    Plain,
    Tls,
    /// e.g. HTTP tunneling - handlers are always dispatched asynchronously
    Tunnel,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    New,
    Handshaking,
    Established,
    Closed,
    /// terminated because of an I/O error or a protocol violation
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// What the peer told us about itself during the handshake
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeerInfo {
    pub protocol_version: u32,
    /// the peer's clock minus ours in milliseconds, as measured when the handshake arrived
    pub clock_offset_millis: i64,
    pub tunnel: bool,
}

/// Options for [Communicator::send]
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// types accepted as a response - empty means 'any type with the right correlation id'
    pub expected_types: Vec<i32>,
    /// `None` falls back to the communicator's override, then to the configured default
    pub wait: Option<WaitTime>,
    /// number of additional attempts if no response arrives in time
    pub retry_count: usize,
}

impl SendOptions {
    pub fn expecting(expected_types: Vec<i32>) -> SendOptions {
        SendOptions {
            expected_types,
            ..Default::default()
        }
    }

    pub fn with_wait(mut self, wait: impl Into<WaitTime>) -> SendOptions {
        self.wait = Some(wait.into());
        self
    }

    pub fn with_retries(mut self, retry_count: usize) -> SendOptions {
        self.retry_count = retry_count;
        self
    }
}

type CloseListener = Box<dyn FnOnce(u64) + Send + Sync>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The protocol engine for a single connection: It reads and dispatches incoming frames, runs
///  the handshake, correlates requests with their responses, and serializes all writes.
///
/// A communicator is created by [Communicator::start] on an already connected byte stream, and
///  it owns the stream until it is closed - explicitly, by the peer, or because of an I/O error.
pub struct Communicator {
    session_id: u64,
    role: Role,
    transport: TransportKind,
    context: Arc<CommunicatorContext>,

    writer: Mutex<Option<BoxedWriter>>,
    state: watch::Sender<ConnectionState>,
    peer_info: RwLock<Option<PeerInfo>>,
    running: AtomicBool,
    cancel_sender: broadcast::Sender<()>,

    system_handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    waiters: Waiters,
    lost_and_found: Mutex<VecDeque<Message>>,

    busy: AtomicUsize,
    pong_count: AtomicU64,
    wait_time_override: StdMutex<Option<WaitTime>>,
    close_listeners: StdMutex<Vec<(u64, CloseListener)>>,
    next_close_listener_id: AtomicU64,

    accepted_raw_channels_sender: StdMutex<Option<mpsc::UnboundedSender<RawChannel>>>,
    accepted_raw_channels: Mutex<mpsc::UnboundedReceiver<RawChannel>>,
}

impl Debug for Communicator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Communicator{{session:{}, {:?}, {:?}, {:?}}}", self.session_id, self.role, self.transport, *self.state.borrow())
    }
}

impl Communicator {
    /// Takes ownership of a connected stream and starts the receive loop. The initiating side
    ///  sends the handshake and returns only after the peer's reply arrived; this fails if the
    ///  connection terminates first.
    pub async fn start<S>(stream: S, role: Role, transport: TransportKind, context: &Arc<CommunicatorContext>) -> anyhow::Result<Arc<Communicator>>
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let (reader, writer) = tokio::io::split(stream);
        let (cancel_sender, cancel_receiver) = broadcast::channel(1);
        let (raw_sender, raw_receiver) = mpsc::unbounded_channel();

        let session_id = context.next_session_id();
        let communicator = Arc::new(Communicator {
            session_id,
            role,
            transport,
            context: context.clone(),
            writer: Mutex::new(Some(Box::new(writer))),
            state: watch::Sender::new(ConnectionState::New),
            peer_info: Default::default(),
            running: AtomicBool::new(true),
            cancel_sender,
            system_handlers: RwLock::new(builtin_system_handlers()),
            handlers: Default::default(),
            waiters: Default::default(),
            lost_and_found: Default::default(),
            busy: Default::default(),
            pong_count: Default::default(),
            wait_time_override: Default::default(),
            close_listeners: Default::default(),
            next_close_listener_id: Default::default(),
            accepted_raw_channels_sender: StdMutex::new(Some(raw_sender)),
            accepted_raw_channels: Mutex::new(raw_receiver),
        });

        for handler in context.create_global_handlers().await {
            if handler.is_system() {
                communicator.register_system_handler(handler).await;
            }
            else if let Err(e) = communicator.register_handler(handler).await {
                warn!("skipping global handler: {}", e);
            }
        }

        let span = span!(Level::INFO, "communicator", session_id, ?role);
        info!(parent: &span, "starting communicator on {:?} transport", transport);

        communicator.state.send_replace(ConnectionState::Handshaking);
        tokio::spawn(communicator.clone()
            .receive_loop(Box::new(reader), cancel_receiver)
            .instrument(span.clone()));

        if role == Role::Initiator {
            communicator.handshake()
                .instrument(span)
                .await?;
        }
        Ok(communicator)
    }

    async fn handshake(&self) -> anyhow::Result<()> {
        debug!("sending handshake");
        self.write(&mut self.handshake_message()).await?;

        let mut state_receiver = self.state.subscribe();
        let state = *state_receiver.wait_for(|s| *s == ConnectionState::Established || s.is_terminal()).await?;
        if state != ConnectionState::Established {
            bail!("connection terminated during handshake");
        }
        debug!("handshake complete");
        Ok(())
    }

    fn handshake_message(&self) -> Message {
        Message::system(SystemMessageType::Handshake, StructuredPayload::new()
            .with(KEY_VERSION, self.context.config.protocol_version)
            .with(KEY_TIMESTAMP, now_millis())
            .with(KEY_TUNNEL, self.transport == TransportKind::Tunnel))
    }

    /// Processes a handshake from the peer. A handshake arriving after the connection is
    ///  established is ignored.
    pub(crate) async fn on_handshake(&self, message: &Message) -> anyhow::Result<()> {
        if *self.state.borrow() != ConnectionState::Handshaking {
            debug!("ignoring handshake in state {:?}", *self.state.borrow());
            return Ok(());
        }

        let peer_info = PeerInfo {
            protocol_version: message.get_i64(KEY_VERSION).unwrap_or(0).clamp(0, u32::MAX as i64) as u32,
            clock_offset_millis: message.get_i64(KEY_TIMESTAMP)
                .map(|ts| ts - now_millis())
                .unwrap_or(0),
            tunnel: message.get_bool(KEY_TUNNEL).unwrap_or(false),
        };
        if peer_info.protocol_version != self.context.config.protocol_version {
            warn!("peer uses protocol version {}, we use {} - proceeding anyway", peer_info.protocol_version, self.context.config.protocol_version);
        }
        debug!("received handshake: {:?}", peer_info);
        *self.peer_info.write().await = Some(peer_info);

        if self.role == Role::Initiator {
            self.mark_established();
            return Ok(());
        }

        // The reply must be the first message the peer sees from us, so the writer stays locked
        //  from the state change until it is written
        let mut reply = self.handshake_message();
        let buf = self.encode(&reply)?;
        let result = {
            let mut writer = self.writer.lock().await;
            self.mark_established();
            Self::write_buf(&mut writer, &buf).await
        };
        self.after_write(result, &mut reply).await
    }

    fn mark_established(&self) {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Handshaking {
                *s = ConnectionState::Established;
                true
            }
            else {
                false
            }
        });
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn context(&self) -> &Arc<CommunicatorContext> {
        &self.context
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.context.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_established(&self) -> bool {
        self.is_running() && self.state() == ConnectionState::Established
    }

    /// waits until the connection is closed or failed
    pub async fn closed(&self) -> ConnectionState {
        let mut state_receiver = self.state.subscribe();
        let state = match state_receiver.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            Err(_) => ConnectionState::Closed,
        };
        state
    }

    pub async fn peer_info(&self) -> Option<PeerInfo> {
        *self.peer_info.read().await
    }

    /// number of handlers currently executing
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_wait_time_override(&self, wait: Option<WaitTime>) {
        *self.wait_time_override.lock().unwrap_or_else(PoisonError::into_inner) = wait;
    }

    fn resolve_wait_time(&self, explicit: Option<WaitTime>) -> WaitTime {
        explicit
            .or(*self.wait_time_override.lock().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or(self.context.config.default_wait_time)
    }

    /// Registers a callback that is invoked once when the connection terminates. If it is
    ///  terminated already, the callback is invoked immediately.
    ///
    /// The returned id can be passed to [Communicator::remove_close_listener].
    pub fn on_close(&self, listener: impl FnOnce(u64) + Send + Sync + 'static) -> u64 {
        let id = self.next_close_listener_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self.close_listeners.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_running() {
                listeners.push((id, Box::new(listener)));
                return id;
            }
        }
        listener(self.session_id);
        id
    }

    /// returns `true` if the listener was still registered
    pub fn remove_close_listener(&self, id: u64) -> bool {
        let mut listeners = self.close_listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let len_before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() < len_before
    }

    #[cfg(test)]
    pub(crate) fn num_close_listeners(&self) -> usize {
        self.close_listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Registers an application handler. Each message type can be claimed by at most one
    ///  registered handler per communicator.
    pub async fn register_handler(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let new_types = handler.accepted_types();
        if let Some(t) = new_types.iter().find(|t| **t < 0) {
            bail!("application handlers can not accept system message type {}", t);
        }

        let mut handlers = self.handlers.write().await;
        for existing in handlers.iter() {
            let existing_types = existing.accepted_types();
            if let Some(t) = new_types.iter().find(|t| existing_types.contains(t)) {
                bail!("message type {} is already claimed by another handler", t);
            }
        }
        debug!("registering handler for types {:?}", new_types);
        handlers.push(handler);
        Ok(())
    }

    /// removes the handler claiming the given type, returning it if there was one
    pub async fn deregister_handler(&self, message_type: i32) -> Option<Arc<dyn MessageHandler>> {
        let mut handlers = self.handlers.write().await;
        let idx = handlers.iter().position(|h| h.accepted_types().contains(&message_type))?;
        Some(handlers.remove(idx))
    }

    pub async fn register_system_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.system_handlers.write().await
            .push(handler);
    }

    pub async fn remove_system_handler(&self, handler: &Arc<dyn MessageHandler>) {
        self.system_handlers.write().await
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Writes a message without waiting for anything
    pub async fn queue(&self, mut message: Message) -> anyhow::Result<()> {
        if !self.is_running() {
            bail!("communicator {} is closed", self.session_id);
        }
        self.write(&mut message).await
    }

    /// Sends a message and waits for a response with the same correlation id, returning `None`
    ///  if no response arrives within the wait budget or the connection terminates.
    ///
    /// A message without an id gets a fresh one that does not collide with any other pending
    ///  request. Each retry writes the message again with the same id.
    pub async fn send(&self, mut message: Message, options: SendOptions) -> anyhow::Result<Option<Message>> {
        if !self.is_running() {
            bail!("communicator {} is closed", self.session_id);
        }

        let wait = self.resolve_wait_time(options.wait);
        if wait == WaitTime::NoWait {
            self.write(&mut message).await?;
            return Ok(None);
        }

        for attempt in 0..=options.retry_count {
            let registration = if message.has_message_id() {
                self.waiters.register_for_id(message.message_id(), options.expected_types.clone())
            }
            else {
                let registration = self.waiters.register_fresh(options.expected_types.clone());
                message.set_message_id(registration.message_id);
                registration
            };
            let token = registration.token;

            if attempt > 0 {
                debug!("retrying message {} (attempt {})", message.message_id(), attempt+1);
            }
            if let Err(e) = self.write(&mut message).await {
                self.waiters.remove(token);
                return Err(e);
            }

            let response = self.await_response(registration, wait).await;
            self.waiters.remove(token);

            if response.is_some() {
                return Ok(response);
            }
            if !self.is_running() {
                break;
            }
        }
        trace!("no response for message {}", message.message_id());
        Ok(None)
    }

    async fn await_response(&self, mut registration: Registration, wait: WaitTime) -> Option<Message> {
        let deadline = match wait {
            WaitTime::NoWait => return None,
            WaitTime::Forever => None,
            WaitTime::Bounded(d) => Some(Instant::now() + d),
        };

        let mut poll_interval = tokio::time::interval(self.context.config.response_poll_interval);
        loop {
            select! {
                response = &mut registration.receiver => {
                    // an error means the waiter was dropped, i.e. the connection is gone
                    return response.ok();
                }
                _ = poll_interval.tick() => {
                    if !self.is_running() {
                        return None;
                    }
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Waits for the next message of one of the given types, regardless of its correlation id.
    ///  Messages of these types that arrived earlier without a taker are returned first.
    pub async fn fetch(&self, message_types: Vec<i32>, wait: Option<WaitTime>) -> Option<Message> {
        let mut registration = self.waiters.register_for_types(message_types.clone());

        if let Some(message) = self.take_lost_and_found_matching(&message_types).await {
            self.waiters.remove(registration.token);
            if let Ok(overtaking) = registration.receiver.try_recv() {
                self.lost_and_found.lock().await
                    .push_front(overtaking);
            }
            return Some(message);
        }

        let token = registration.token;
        let wait = self.resolve_wait_time(wait);
        let result = self.await_response(registration, wait).await;
        self.waiters.remove(token);
        result
    }

    async fn take_lost_and_found_matching(&self, message_types: &[i32]) -> Option<Message> {
        let mut lost_and_found = self.lost_and_found.lock().await;
        let idx = lost_and_found.iter().position(|m| message_types.contains(&m.message_type()))?;
        lost_and_found.remove(idx)
    }

    /// removes and returns the oldest unclaimed message of a given type
    pub async fn take_lost_and_found(&self, message_type: i32) -> Option<Message> {
        self.take_lost_and_found_matching(&[message_type]).await
    }

    pub async fn lost_and_found_len(&self) -> usize {
        self.lost_and_found.lock().await.len()
    }

    /// Round trip through the peer's built-in test handler
    pub async fn test_connection(&self, wait: Option<WaitTime>) -> bool {
        let request = Message::system(SystemMessageType::TestConnection, StructuredPayload::new());
        let options = SendOptions {
            expected_types: vec![SystemMessageType::Acknowledgement.code()],
            wait,
            retry_count: 0,
        };
        match self.send(request, options).await {
            Ok(Some(response)) => response.is_successful(),
            Ok(None) => false,
            Err(e) => {
                debug!("connection test failed: {}", e);
                false
            }
        }
    }

    pub(crate) fn record_pong(&self) {
        self.pong_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn push_accepted_raw_channel(&self, channel: RawChannel) -> anyhow::Result<()> {
        let sender = self.accepted_raw_channels_sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) if sender.send(channel).is_ok() => Ok(()),
            _ => bail!("communicator {} is closed", self.session_id),
        }
    }

    /// Waits for the peer to open a raw channel. Returns `None` once the connection is closed.
    pub async fn accept_raw_channel(&self) -> Option<RawChannel> {
        self.accepted_raw_channels.lock().await
            .recv()
            .await
    }

    /// Opens a raw channel using the context's raw channel configuration
    pub async fn open_raw_channel(self: &Arc<Self>) -> anyhow::Result<RawChannel> {
        RawChannel::open(self, self.context.raw_channel_config.clone()).await
    }

    /// Closes the connection, notifying the peer if the stream is still writable. Closing is
    ///  idempotent.
    pub async fn close(&self) {
        self.close_with(SystemMessageType::Close).await
    }

    /// Like [Communicator::close], but tells the peer that this side is shutting down
    pub async fn notify_shutdown(&self) {
        self.close_with(SystemMessageType::ShutdownNotice).await
    }

    async fn close_with(&self, message_type: SystemMessageType) {
        if !self.is_running() {
            return;
        }
        debug!("closing communicator {} with {:?}", self.session_id, message_type);
        if let Err(e) = self.write(&mut Message::system(message_type, StructuredPayload::new())).await {
            debug!("could not notify peer of close: {}", e);
        }
        self.shutdown(ConnectionState::Closed).await;
    }

    /// Terminates the connection without notifying the peer
    pub(crate) async fn shutdown(&self, final_state: ConnectionState) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("shutting down communicator {} ({:?})", self.session_id, final_state);

        let _ = self.cancel_sender.send(());
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("error shutting down stream: {}", e);
            }
        }

        self.waiters.clear();
        self.accepted_raw_channels_sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.state.send_replace(final_state);

        let listeners = std::mem::take(&mut *self.close_listeners.lock().unwrap_or_else(PoisonError::into_inner));
        for (_, listener) in listeners {
            listener(self.session_id);
        }
    }

    async fn write(&self, message: &mut Message) -> anyhow::Result<()> {
        let buf = self.encode(message)?;
        let result = {
            let mut writer = self.writer.lock().await;
            trace!("writing {:?}", message);
            Self::write_buf(&mut writer, &buf).await
        };
        self.after_write(result, message).await
    }

    fn encode(&self, message: &Message) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::new();
        encode_frame(message, &mut buf)?;
        let payload_len = buf.len() - Envelope::SERIALIZED_LEN;
        if payload_len > self.context.config.max_message_size {
            bail!("message of type {} has {} bytes payload, exceeding the maximum of {}", message.message_type(), payload_len, self.context.config.max_message_size);
        }
        Ok(buf)
    }

    async fn write_buf(writer: &mut Option<BoxedWriter>, buf: &[u8]) -> WriteResult {
        let Some(writer) = writer.as_mut() else {
            return WriteResult::Closed;
        };
        match writer.write_all(buf).await {
            Ok(()) => match writer.flush().await {
                Ok(()) => WriteResult::Written,
                Err(e) => WriteResult::Failed(e),
            },
            Err(e) => WriteResult::Failed(e),
        }
    }

    async fn after_write(&self, result: WriteResult, message: &mut Message) -> anyhow::Result<()> {
        match result {
            WriteResult::Written => {
                message.mark_sent();
                Ok(())
            }
            WriteResult::Closed => bail!("communicator {} is closed", self.session_id),
            WriteResult::Failed(e) => {
                warn!("error writing to stream - terminating connection: {}", e);
                self.shutdown(ConnectionState::Failed).await;
                Err(e.into())
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: BoxedReader, mut cancel_receiver: broadcast::Receiver<()>) {
        let final_state = loop {
            select! {
                _ = cancel_receiver.recv() => {
                    debug!("receive loop cancelled");
                    break ConnectionState::Closed;
                }
                frame = read_frame(&mut reader, self.context.config.max_message_size) => {
                    match frame {
                        Ok(Some((envelope, payload))) => {
                            let correlation_id = Uuid::new_v4();
                            let span = span!(Level::TRACE, "frame_received", ?correlation_id);
                            self.on_frame(envelope, payload)
                                .instrument(span)
                                .await;
                        }
                        Ok(None) => {
                            debug!("peer closed the stream");
                            break ConnectionState::Closed;
                        }
                        Err(e) => {
                            error!("terminating connection: {}", e);
                            break ConnectionState::Failed;
                        }
                    }
                }
            }
        };
        self.shutdown(final_state).await;
    }

    async fn on_frame(self: &Arc<Self>, envelope: Envelope, payload: bytes::Bytes) {
        let message = match envelope.decode_message(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping undecodable message of type {}: {}", envelope.message_type, e);
                return;
            }
        };
        trace!("received {:?}", message);
        self.dispatch(message).await;
    }

    async fn dispatch(self: &Arc<Self>, message: Message) {
        if self.state() != ConnectionState::Established && message.system_type() != Some(SystemMessageType::Handshake) {
            debug!("dropping message of type {} received before the handshake completed", message.message_type());
            return;
        }

        if message.is_system() {
            let handler = self.system_handlers.read().await
                .iter()
                .find(|h| h.accepts(&message))
                .cloned();
            if let Some(handler) = handler {
                self.run_handler(handler, message).await;
                return;
            }
        }

        let Some(message) = self.waiters.offer(message) else {
            return;
        };

        if message.is_system() {
            debug!("dropping system message of type {} that nobody is waiting for", message.message_type());
            return;
        }

        let handler = self.handlers.read().await
            .iter()
            .find(|h| h.accepts(&message))
            .cloned();
        match handler {
            Some(handler) => self.run_handler(handler, message).await,
            None => {
                debug!("no handler for message type {} - adding it to lost and found", message.message_type());
                self.lost_and_found.lock().await
                    .push_back(message);
            }
        }
    }

    async fn run_handler(self: &Arc<Self>, handler: Arc<dyn MessageHandler>, message: Message) {
        if handler.is_blocking() && self.transport != TransportKind::Tunnel {
            self.execute_handler(handler, message).await;
        }
        else {
            let communicator = self.clone();
            tokio::spawn(async move {
                communicator.execute_handler(handler, message).await;
            }.instrument(Span::current()));
        }
    }

    async fn execute_handler(self: &Arc<Self>, handler: Arc<dyn MessageHandler>, message: Message) {
        let message_type = message.message_type();
        let message_id = message.has_message_id().then_some(message.message_id());

        let result = {
            let _busy = BusyGuard::new(&self.busy);
            handler.on_message(self, message).await
        };

        match result {
            Ok(Some(mut response)) => {
                if let Some(id) = message_id {
                    response.set_message_id(id);
                }
                if let Err(e) = self.queue(response).await {
                    debug!("could not send response to message of type {}: {}", message_type, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("handler for message type {} failed: {}", message_type, e),
        }
    }
}

enum WriteResult {
    Written,
    Closed,
    Failed(std::io::Error),
}

struct BusyGuard<'a> {
    busy: &'a AtomicUsize,
}
impl <'a> BusyGuard<'a> {
    fn new(busy: &'a AtomicUsize) -> BusyGuard<'a> {
        busy.fetch_add(1, Ordering::AcqRel);
        BusyGuard { busy }
    }
}
impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl LivenessPeer for Communicator {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    fn is_alive(&self) -> bool {
        self.is_running()
    }

    fn is_claimed(&self) -> bool {
        self.busy_count() > 0
    }

    fn pong_count(&self) -> u64 {
        self.pong_count.load(Ordering::Acquire)
    }

    async fn send_ping(&self) -> anyhow::Result<()> {
        self.queue(Message::system(SystemMessageType::PingPong, StructuredPayload::new())).await
    }

    async fn close(&self) {
        Communicator::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::comm::handler::MockMessageHandler;
    use crate::test_util::comm::{communicator_pair, communicator_pair_with_transport, EchoHandler, SlowHandler};
    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    fn app_message(message_type: i32) -> Message {
        Message::new(message_type, StructuredPayload::new().with("text", "hello")).unwrap()
    }

    #[tokio::test]
    async fn test_handshake() {
        let (client, server) = communicator_pair().await;

        assert_eq!(client.state(), ConnectionState::Established);
        server.state.subscribe().wait_for(|s| *s == ConnectionState::Established).await.unwrap();

        let client_peer = client.peer_info().await.unwrap();
        assert_eq!(client_peer.protocol_version, CommunicatorConfig::PROTOCOL_VERSION);
        assert!(!client_peer.tunnel);
        assert!(client_peer.clock_offset_millis.abs() < 1000);
        assert!(server.peer_info().await.is_some());
        assert_ne!(client.session_id(), server.session_id());
    }

    #[tokio::test]
    async fn test_repeated_handshake_is_ignored() {
        let (client, server) = communicator_pair().await;
        let peer_info = client.peer_info().await;

        client.queue(client.handshake_message()).await.unwrap();
        server.queue(server.handshake_message()).await.unwrap();
        assert!(client.test_connection(None).await);

        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(client.peer_info().await, peer_info);
    }

    #[tokio::test]
    async fn test_messages_before_handshake_are_dropped() {
        let context = CommunicatorContext::default_context();
        let (client_stream, mut server_stream) = tokio::io::duplex(64*1024);

        let mut buf = BytesMut::new();
        encode_frame(&app_message(5), &mut buf).unwrap();
        server_stream.write_all(&buf).await.unwrap();

        let server = tokio::spawn(async move {
            // a raw peer that answers the handshake, keeping the stream open
            let mut header = [0u8; Envelope::SERIALIZED_LEN];
            server_stream.read_exact(&mut header).await.unwrap();
            let envelope = Envelope::deser(&mut header.as_ref()).unwrap();
            let mut payload = vec![0u8; envelope.payload_size as usize];
            server_stream.read_exact(&mut payload).await.unwrap();

            let mut buf = BytesMut::new();
            encode_frame(&Message::system(SystemMessageType::Handshake, StructuredPayload::new().with(KEY_VERSION, 1)), &mut buf).unwrap();
            server_stream.write_all(&buf).await.unwrap();
            server_stream
        });

        let client = Communicator::start(client_stream, Role::Initiator, TransportKind::Plain, &context).await.unwrap();
        let _server_stream = server.await.unwrap();

        assert_eq!(client.lost_and_found_len().await, 0);
    }

    #[tokio::test]
    async fn test_initiator_fails_if_peer_closes_during_handshake() {
        let context = CommunicatorContext::default_context();
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        drop(server_stream);

        assert!(Communicator::start(client_stream, Role::Initiator, TransportKind::Plain, &context).await.is_err());
    }

    #[tokio::test]
    async fn test_send_and_receive_response() {
        let (client, server) = communicator_pair().await;
        server.register_handler(Arc::new(EchoHandler { message_type: 3, response_type: 4 })).await.unwrap();

        let response = client.send(app_message(3), SendOptions::expecting(vec![4])).await.unwrap()
            .unwrap();
        assert_eq!(response.message_type(), 4);
        assert_eq!(response.get_str("text"), Some("hello"));
        assert!(response.has_message_id());
        assert!(client.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_send_keeps_preassigned_id() {
        let (client, server) = communicator_pair().await;
        server.register_handler(Arc::new(EchoHandler { message_type: 3, response_type: 4 })).await.unwrap();

        let response = client.send(app_message(3).with_message_id(4711), SendOptions::default()).await.unwrap()
            .unwrap();
        assert_eq!(response.message_id(), 4711);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_response_times_out() {
        let (client, server) = communicator_pair().await;
        let start = Instant::now();

        let response = client.send(app_message(3), SendOptions::expecting(vec![4]).with_wait(Duration::from_millis(500))).await.unwrap();

        assert!(response.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(750), "{:?}", elapsed);

        // the unanswered message ended up in the peer's lost and found
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.lost_and_found_len().await, 1);
        assert!(client.waiters.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries() {
        let (client, server) = communicator_pair().await;
        let start = Instant::now();

        let response = client.send(app_message(3), SendOptions::expecting(vec![4])
            .with_wait(Duration::from_millis(500))
            .with_retries(2)
        ).await.unwrap();
        assert!(response.is_none());
        assert!(start.elapsed() >= Duration::from_millis(1250));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = server.take_lost_and_found(3).await.unwrap();
        let second = server.take_lost_and_found(3).await.unwrap();
        let third = server.take_lost_and_found(3).await.unwrap();
        assert!(server.take_lost_and_found(3).await.is_none());
        assert_eq!(first.message_id(), second.message_id());
        assert_eq!(first.message_id(), third.message_id());
    }

    #[rstest]
    #[case::no_wait(WaitTime::NoWait)]
    #[case::zero(WaitTime::from_millis(0))]
    #[tokio::test(start_paused = true)]
    async fn test_send_no_wait(#[case] wait: WaitTime) {
        let (client, server) = communicator_pair().await;
        server.register_handler(Arc::new(EchoHandler { message_type: 3, response_type: 4 })).await.unwrap();

        let start = Instant::now();
        let response = client.send(app_message(3), SendOptions::default().with_wait(wait)).await.unwrap();
        assert!(response.is_none());
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_override() {
        let (client, _server) = communicator_pair().await;
        client.set_wait_time_override(Some(WaitTime::Bounded(Duration::from_secs(2))));

        let start = Instant::now();
        let response = client.send(app_message(3), SendOptions::default()).await.unwrap();
        assert!(response.is_none());
        assert!(start.elapsed() >= Duration::from_millis(1750));
        assert!(start.elapsed() <= Duration::from_millis(2250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_returns_none_when_connection_closes() {
        let (client, server) = communicator_pair().await;

        let sender = client.clone();
        let send = tokio::spawn(async move {
            sender.send(app_message(3), SendOptions::default().with_wait(WaitTime::Forever)).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        server.close().await;

        assert!(send.await.unwrap().unwrap().is_none());
        assert_eq!(client.closed().await, ConnectionState::Closed);
        assert!(client.send(app_message(3), SendOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fires_listeners_once() {
        let (client, server) = communicator_pair().await;

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        client.on_close(move |_| { c.fetch_add(1, Ordering::SeqCst); });

        client.close().await;
        client.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(server.closed().await, ConnectionState::Closed);

        // registering after close fires immediately
        let c = count.clone();
        client.on_close(move |_| { c.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_removed_close_listener_is_not_fired() {
        let (client, _server) = communicator_pair().await;

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = client.on_close(move |_| { c.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(client.num_close_listeners(), 1);

        assert!(client.remove_close_listener(id));
        assert!(!client.remove_close_listener(id));
        assert_eq!(client.num_close_listeners(), 0);

        client.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_notify_shutdown_closes_peer() {
        let (client, server) = communicator_pair().await;
        client.notify_shutdown().await;
        assert_eq!(server.closed().await, ConnectionState::Closed);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_peer_dropping_stream_closes_communicator() {
        let context = CommunicatorContext::default_context();
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        let (client, server) = tokio::join!(
            Communicator::start(client_stream, Role::Initiator, TransportKind::Plain, &context),
            Communicator::start(server_stream, Role::Responder, TransportKind::Plain, &context),
        );
        let client = client.unwrap();
        let server = server.unwrap();

        server.shutdown(ConnectionState::Closed).await;
        assert_eq!(client.closed().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_frame_fails_connection() {
        let mut config = CommunicatorConfig::default_config();
        config.max_message_size = 1024;
        let mut raw_config = crate::config::RawChannelConfig::default_config();
        raw_config.block_size = 512;
        let context = CommunicatorContext::new(config, raw_config).unwrap();

        let (client_stream, mut server_stream) = tokio::io::duplex(64*1024);
        let client = tokio::spawn({
            let context = context.clone();
            async move { Communicator::start(client_stream, Role::Responder, TransportKind::Plain, &context).await }
        }).await.unwrap().unwrap();

        let mut buf = BytesMut::new();
        Envelope { message_type: 1, payload_size: 2000, message_id: -1, raw: true }.ser(&mut buf);
        server_stream.write_all(&buf).await.unwrap();

        assert_eq!(client.closed().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected_on_send() {
        let (client, _server) = communicator_pair().await;
        let huge = Message::new(1, vec![0u8; client.config().max_message_size + 1]).unwrap();
        assert!(client.queue(huge).await.is_err());
        assert!(client.is_running());
    }

    #[tokio::test]
    async fn test_unhandled_messages_go_to_lost_and_found() {
        let (client, server) = communicator_pair().await;

        client.queue(app_message(8)).await.unwrap();
        client.queue(app_message(9)).await.unwrap();
        client.queue(app_message(8).with_message_id(2)).await.unwrap();
        assert!(client.test_connection(None).await);

        assert_eq!(server.lost_and_found_len().await, 3);
        assert_eq!(server.take_lost_and_found(8).await.unwrap().message_id(), -1);
        assert_eq!(server.take_lost_and_found(8).await.unwrap().message_id(), 2);
        assert!(server.take_lost_and_found(8).await.is_none());

        let fetched = server.fetch(vec![9], Some(WaitTime::NoWait)).await.unwrap();
        assert_eq!(fetched.message_type(), 9);
        assert_eq!(server.lost_and_found_len().await, 0);
    }

    #[tokio::test]
    async fn test_fetch_waits_for_message() {
        let (client, server) = communicator_pair().await;

        let fetcher = server.clone();
        let fetch = tokio::spawn(async move {
            fetcher.fetch(vec![12], Some(WaitTime::Forever)).await
        });
        tokio::task::yield_now().await;
        while server.waiters.is_empty() {
            tokio::task::yield_now().await;
        }
        client.queue(app_message(12)).await.unwrap();

        let fetched = fetch.await.unwrap().unwrap();
        assert_eq!(fetched.message_type(), 12);
        assert_eq!(server.lost_and_found_len().await, 0);
    }

    #[tokio::test]
    async fn test_handler_types_are_claimed_exclusively() {
        let (client, _server) = communicator_pair().await;
        client.register_handler(Arc::new(EchoHandler { message_type: 3, response_type: 4 })).await.unwrap();
        assert!(client.register_handler(Arc::new(EchoHandler { message_type: 3, response_type: 5 })).await.is_err());

        let mut system = MockMessageHandler::new();
        system.expect_accepted_types().return_const(vec![-1]);
        assert!(client.register_handler(Arc::new(system)).await.is_err());

        assert!(client.deregister_handler(3).await.is_some());
        assert!(client.deregister_handler(3).await.is_none());
        client.register_handler(Arc::new(EchoHandler { message_type: 3, response_type: 5 })).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_sends_nothing() {
        let (client, server) = communicator_pair().await;

        let mut handler = MockMessageHandler::new();
        handler.expect_accepted_types().return_const(vec![3]);
        handler.expect_accepts().returning(|m| m.message_type() == 3);
        handler.expect_is_system().return_const(false);
        handler.expect_is_blocking().return_const(true);
        handler.expect_on_message()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("failure")));
        server.register_handler(Arc::new(handler)).await.unwrap();

        let response = client.send(app_message(3), SendOptions::default().with_wait(Duration::from_millis(300))).await.unwrap();
        assert!(response.is_none());
        assert!(server.is_running());
    }

    #[rstest]
    #[case::plain_blocking(TransportKind::Plain, true, 1)]
    #[case::plain_async(TransportKind::Plain, false, 0)]
    #[case::tunnel_blocking(TransportKind::Tunnel, true, 0)]
    #[tokio::test]
    async fn test_blocking_handlers_run_on_reader(#[case] transport: TransportKind, #[case] blocking: bool, #[case] expected_busy_while_handled: usize) {
        let (client, server) = communicator_pair_with_transport(transport).await;
        let handler = Arc::new(SlowHandler::new(3, blocking));
        server.register_handler(handler.clone()).await.unwrap();

        client.queue(app_message(3)).await.unwrap();
        handler.started.notified().await;

        // a blocking handler keeps the reader from processing the test connection request
        let responsive = client.test_connection(Some(WaitTime::Bounded(Duration::from_millis(300)))).await;
        assert_eq!(responsive, expected_busy_while_handled == 0);
        assert_eq!(server.busy_count(), 1);

        handler.release.notify_one();
        assert!(client.test_connection(None).await);
        while server.busy_count() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_global_handlers_apply_to_new_communicators() {
        let context = CommunicatorContext::default_context();
        context.register_handler_factory(Arc::new(|| Arc::new(EchoHandler { message_type: 3, response_type: 4 }))).await;

        let (client, _server) = crate::test_util::comm::communicator_pair_in_context(&context, TransportKind::Plain).await;
        let response = client.send(app_message(3), SendOptions::expecting(vec![4])).await.unwrap();
        assert!(response.is_some());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (client, _server) = communicator_pair().await;
        assert_eq!(LivenessPeer::pong_count(client.as_ref()), 0);

        client.send_ping().await.unwrap();
        while LivenessPeer::pong_count(client.as_ref()) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(LivenessPeer::pong_count(client.as_ref()), 1);
        assert!(client.is_alive());
        assert!(!client.is_claimed());
    }
}
