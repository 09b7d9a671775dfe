//! Peer state machine.
//!
//! A [`Peer`] is one end of a connection. It sends its handshake as soon as
//! the channel is usable, checks the remote's handshake (credentials and
//! per-call schema hashes), then dispatches calls and messages in both
//! directions until it closes.
//!
//! All state sits behind one mutex. A driver task feeds channel events
//! through it in order; auth checks, handlers and call timers run as
//! separate tasks and re-enter through the same lock. The lock is never
//! held across an `.await`.

use crate::auth::{AcceptAll, AuthPolicy, CredentialValidator};
use crate::channel::{ChannelEvent, FrameChannel, FrameSink};
use crate::config::PeerConfig;
use crate::descriptor::Call;
use crate::error::{CallError, HandlerError, PeerError, SendError};
use crate::registry::{Registry, Side};
use bytes::Bytes;
use parking_lot::Mutex;
use peerwire_protocol::{
    CodecError, Credentials, Encoder, ErrorCode, Frame, Handshake, HandshakeAnswer,
    ProtocolError, Type, Value,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Default call timeout (10 seconds).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-peer settings.
#[derive(Clone)]
pub struct PeerOptions {
    /// User presented in our handshake.
    pub user: String,
    /// Password presented in our handshake.
    pub password: String,
    /// Reject remotes that present neither a user nor a password.
    pub auth_required: bool,
    /// Check run against the remote's credentials.
    pub auth_policy: Arc<dyn AuthPolicy>,
    /// Timeout used by [`Peer::call`]. Zero disables it.
    pub call_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            auth_required: false,
            auth_policy: Arc::new(AcceptAll),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl PeerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds options from loaded configuration.
    ///
    /// Configured credentials install a [`CredentialValidator`]; otherwise
    /// every remote is accepted.
    pub fn from_config(config: &PeerConfig) -> Self {
        let auth_policy: Arc<dyn AuthPolicy> = if config.auth.credentials.is_empty() {
            Arc::new(AcceptAll)
        } else {
            Arc::new(CredentialValidator::from_config(&config.auth))
        };
        Self {
            user: config.auth.user.clone(),
            password: config.auth.password.clone(),
            auth_required: config.auth.required,
            auth_policy,
            call_timeout: config.calls.timeout(),
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn require_auth(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    pub fn with_auth_policy(mut self, policy: impl AuthPolicy + 'static) -> Self {
        self.auth_policy = Arc::new(policy);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

impl fmt::Debug for PeerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerOptions")
            .field("user", &self.user)
            .field("auth_required", &self.auth_required)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// Connection-level notifications.
#[derive(Debug)]
pub enum PeerEvent {
    /// Both handshake directions completed. Sent at most once.
    Connected,
    /// A fault. Fatal faults are preceded by [`PeerEvent::Closed`]; transport
    /// errors already queued behind a close are reported after it.
    Error(PeerError),
    /// The peer closed. Sent exactly once.
    Closed,
}

/// Stream of [`PeerEvent`]s. Ends after the peer closes.
#[derive(Debug)]
pub struct PeerEvents {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl PeerEvents {
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.rx.try_recv().ok()
    }

    /// Waits for the handshake to complete.
    ///
    /// Returns the error that closed the connection, if any.
    pub async fn wait_connected(&mut self) -> Result<(), PeerError> {
        match self.rx.recv().await {
            Some(PeerEvent::Connected) => Ok(()),
            Some(PeerEvent::Error(e)) => Err(e),
            Some(PeerEvent::Closed) => match self.rx.recv().await {
                Some(PeerEvent::Error(e)) => Err(e),
                _ => Err(PeerError::ConnectionClosed),
            },
            None => Err(PeerError::ConnectionClosed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Starting,
    Waiting,
    Done,
}

type Reply = oneshot::Sender<Result<Value, CallError>>;

struct PendingCall {
    call: Arc<Call>,
    reply: Reply,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    /// Resolves the caller. Consumes the entry so it can only happen once.
    fn resolve(self, result: Result<Value, CallError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if self.reply.send(result).is_err() {
            tracing::debug!("Caller of {} went away before the answer", self.call.name());
        }
    }
}

struct PeerState {
    closed: bool,
    local_handshake: HandshakeState,
    remote_handshake: HandshakeState,
    /// Local call name -> remote advertised a matching hash.
    available_calls: HashMap<String, bool>,
    available_messages: HashMap<String, bool>,
    /// Unanswered calls by sid.
    pending: HashMap<u64, PendingCall>,
    /// Next sid to assign. Sids are never reused within a connection.
    next_sid: u64,
    remote_user: String,
    /// Dropped when the driver stops so the event stream ends.
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
}

impl PeerState {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            closed: false,
            local_handshake: HandshakeState::Starting,
            remote_handshake: HandshakeState::Starting,
            available_calls: HashMap::new(),
            available_messages: HashMap::new(),
            pending: HashMap::new(),
            next_sid: 0,
            remote_user: String::new(),
            events: Some(events),
        }
    }

    fn handshake_done(&self) -> bool {
        self.local_handshake == HandshakeState::Done
            && self.remote_handshake == HandshakeState::Done
    }

    fn emit(&self, event: PeerEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    fn take_pending(&mut self, sid: u64) -> Option<PendingCall> {
        self.pending.remove(&sid)
    }
}

struct PeerInner {
    registry: Arc<Registry>,
    side: Side,
    options: PeerOptions,
    sink: Arc<dyn FrameSink>,
    state: Mutex<PeerState>,
}

/// One end of a connection.
///
/// Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Creates a peer over `channel` and starts its driver task.
    ///
    /// The handshake is sent immediately when the channel is connected,
    /// otherwise on [`ChannelEvent::Connected`]. Must be called from within
    /// a tokio runtime.
    pub fn new(
        registry: Arc<Registry>,
        side: Side,
        options: PeerOptions,
        channel: FrameChannel,
    ) -> (Peer, PeerEvents) {
        let FrameChannel {
            sink,
            events,
            connected,
        } = channel;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(PeerInner {
            registry,
            side,
            options,
            sink,
            state: Mutex::new(PeerState::new(events_tx)),
        });

        if connected {
            inner.start_handshake();
        }
        tokio::spawn(drive(Arc::clone(&inner), events));

        (Peer { inner }, PeerEvents { rx: events_rx })
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Whether the remote advertised a compatible version of local call `name`.
    pub fn can_call(&self, name: &str) -> bool {
        let st = self.inner.state.lock();
        st.available_calls.get(name).copied().unwrap_or(false)
    }

    /// Whether the remote advertised a compatible version of local message `name`.
    pub fn can_send(&self, name: &str) -> bool {
        let st = self.inner.state.lock();
        st.available_messages.get(name).copied().unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn handshake_done(&self) -> bool {
        self.inner.state.lock().handshake_done()
    }

    /// User the remote presented in its handshake; empty until received.
    pub fn remote_user(&self) -> String {
        self.inner.state.lock().remote_user.clone()
    }

    /// Number of calls still waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        let st = self.inner.state.lock();
        st.pending.len()
    }

    /// Calls the remote using the configured default timeout.
    ///
    /// The call frame is sent before this returns. Every outcome, including
    /// local validation failures, is delivered through the returned future.
    /// Must be called from within a tokio runtime; the call timer is spawned
    /// before this returns.
    pub fn call(
        &self,
        name: &str,
        data: &Value,
    ) -> impl Future<Output = Result<Value, CallError>> + Send + 'static {
        self.call_with_timeout(name, data, self.inner.options.call_timeout)
    }

    /// Calls the remote. A zero `timeout` waits indefinitely.
    ///
    /// Must be called from within a tokio runtime unless `timeout` is zero.
    ///
    /// Calls without an output type resolve to [`Value::Null`].
    pub fn call_with_timeout(
        &self,
        name: &str,
        data: &Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, CallError>> + Send + 'static {
        let started = self.inner.start_call(name, data, timeout);
        async move {
            match started {
                Ok(rx) => rx.await.unwrap_or(Err(CallError::ConnectionLost)),
                Err(e) => Err(e),
            }
        }
    }

    /// Sends a message, dropping it silently on any local failure.
    pub fn send(&self, name: &str, data: &Value) {
        if let Err(e) = self.send_strict(name, data) {
            tracing::debug!("Message {} not sent: {}", name, e);
        }
    }

    /// Sends a message, reporting local failures.
    pub fn send_strict(&self, name: &str, data: &Value) -> Result<(), SendError> {
        let st = self.inner.state.lock();
        if st.closed {
            return Err(SendError::Closed);
        }
        if !st.handshake_done() {
            return Err(SendError::NotReady);
        }
        let message = self
            .inner
            .registry
            .local_messages(self.inner.side)
            .by_name(name)
            .ok_or_else(|| SendError::UnknownMessage(name.to_string()))?;
        if !st.available_messages.get(name).copied().unwrap_or(false) {
            return Err(SendError::Unsupported(name.to_string()));
        }

        let frame = Encoder::message(message.id(), message.input(), data)?;
        self.inner.sink.send_frame(frame)?;
        tracing::debug!("Sent message {} (id={})", name, message.id());
        Ok(())
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Peer")
            .field("side", &self.inner.side)
            .field("closed", &st.closed)
            .field("handshake_done", &st.handshake_done())
            .finish()
    }
}

async fn drive(inner: Arc<PeerInner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Connected => inner.start_handshake(),
            ChannelEvent::Frame(frame) => inner.process_frame(frame),
            ChannelEvent::Closed => inner.close(),
            ChannelEvent::Error(e) => inner.fail(PeerError::Channel(e)),
        }
        if inner.state.lock().closed {
            break;
        }
    }
    // The transport went away without saying so.
    inner.close();

    // Transport errors queued behind the close are still reported.
    while let Ok(event) = events.try_recv() {
        if let ChannelEvent::Error(e) = event {
            inner.fail(PeerError::Channel(e));
        }
    }
    inner.state.lock().events = None;
    tracing::debug!("Peer driver stopped ({:?})", inner.side);
}

fn decode_payload(ty: Option<&Type>, payload: &[u8]) -> Result<Value, CodecError> {
    match ty {
        Some(ty) => ty.decode(payload),
        None if payload.is_empty() => Ok(Value::Null),
        None => Err(CodecError::TrailingBytes(payload.len())),
    }
}

impl PeerInner {
    fn send_frame(&self, frame: Result<Bytes, CodecError>) -> Result<(), PeerError> {
        self.sink.send_frame(frame?)?;
        Ok(())
    }

    fn send_error(&self, sid: u64, reason: &str, code: ErrorCode) -> Result<(), PeerError> {
        let code = code.wire_code().unwrap_or(0);
        self.send_frame(Encoder::error(sid, reason, code))
    }

    fn start_handshake(&self) {
        let result = {
            let mut st = self.state.lock();
            if st.closed || st.local_handshake != HandshakeState::Starting {
                return;
            }

            let handshake = Handshake::new(
                Credentials::new(self.options.user.clone(), self.options.password.clone()),
                self.registry.remote_calls(self.side).adverts(),
                self.registry.remote_messages(self.side).adverts(),
            );
            let sent = handshake
                .encode()
                .map_err(PeerError::from)
                .and_then(|frame| Ok(self.sink.send_frame(frame)?));
            if sent.is_ok() {
                st.local_handshake = HandshakeState::Waiting;
                tracing::debug!(
                    "Sent handshake ({:?}): {} calls, {} messages",
                    self.side,
                    handshake.calls.len(),
                    handshake.messages.len()
                );
            }
            sent
        };

        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn process_frame(self: &Arc<Self>, frame: Bytes) {
        let result = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }

            if st.handshake_done() {
                self.route_frame(&mut st, frame)
            } else if st.remote_handshake == HandshakeState::Starting {
                self.on_handshake(&mut st, &frame)
            } else if st.local_handshake == HandshakeState::Waiting {
                self.on_handshake_answer(&mut st, &frame)
            } else {
                Err(ProtocolError::UnexpectedFrame("received before the handshake completed").into())
            }
        };

        if let Err(e) = result {
            tracing::warn!("Closing {:?} peer: {}", self.side, e);
            self.fail(e);
        }
    }

    fn on_handshake(self: &Arc<Self>, st: &mut PeerState, frame: &[u8]) -> Result<(), PeerError> {
        let handshake = Handshake::decode(frame)?;
        st.remote_handshake = HandshakeState::Waiting;

        if self.options.auth_required && handshake.auth.is_empty() {
            let answer = HandshakeAnswer::rejected("Authentication is required").encode()?;
            if let Err(e) = self.sink.send_frame(answer) {
                tracing::debug!("Could not send handshake rejection: {}", e);
            }
            st.remote_handshake = HandshakeState::Done;
            return Err(PeerError::AuthRequired);
        }

        st.remote_user = handshake.auth.user.clone();

        let local_calls = self.registry.local_calls(self.side);
        for advert in &handshake.calls {
            if let Some(call) = local_calls.get(advert.id) {
                st.available_calls
                    .insert(call.name().to_string(), advert.hash == *call.hash());
            }
        }
        let local_messages = self.registry.local_messages(self.side);
        for advert in &handshake.messages {
            if let Some(message) = local_messages.get(advert.id) {
                st.available_messages
                    .insert(message.name().to_string(), advert.hash == *message.hash());
            }
        }

        tracing::debug!(
            "Received handshake from {:?}: {} calls, {} messages",
            handshake.auth.user,
            handshake.calls.len(),
            handshake.messages.len()
        );

        let policy = Arc::clone(&self.options.auth_policy);
        let weak = Arc::downgrade(self);
        let credentials = handshake.auth;
        tokio::spawn(async move {
            let result = policy.authenticate(credentials).await;
            if let Some(inner) = weak.upgrade() {
                inner.finish_auth(result);
            }
        });

        Ok(())
    }

    fn finish_auth(&self, result: Result<(), String>) {
        let outcome = {
            let mut st = self.state.lock();
            st.remote_handshake = HandshakeState::Done;
            if st.closed {
                return;
            }

            let answer = match result {
                Ok(()) => HandshakeAnswer::accepted(),
                Err(ref reason) => HandshakeAnswer::rejected(reason.clone()),
            };
            let sent = answer
                .encode()
                .map_err(PeerError::from)
                .and_then(|frame| Ok(self.sink.send_frame(frame)?));

            match (sent, result) {
                (Err(e), _) => Err(e),
                (Ok(()), Err(reason)) => Err(PeerError::AuthRejected(reason)),
                (Ok(()), Ok(())) => {
                    if st.handshake_done() {
                        self.on_connected(&st);
                    }
                    Ok(())
                }
            }
        };

        if let Err(e) = outcome {
            tracing::warn!("Closing {:?} peer: {}", self.side, e);
            self.fail(e);
        }
    }

    fn on_handshake_answer(&self, st: &mut PeerState, frame: &[u8]) -> Result<(), PeerError> {
        let answer = HandshakeAnswer::decode(frame)?;
        st.local_handshake = HandshakeState::Done;

        if let Some(reason) = answer.error {
            return Err(PeerError::HandshakeFailed(reason));
        }
        if st.handshake_done() {
            self.on_connected(st);
        }
        Ok(())
    }

    fn on_connected(&self, st: &PeerState) {
        tracing::info!(
            "{:?} peer connected (remote user {:?})",
            self.side,
            st.remote_user
        );
        st.emit(PeerEvent::Connected);
    }

    fn route_frame(self: &Arc<Self>, st: &mut PeerState, frame: Bytes) -> Result<(), PeerError> {
        match Frame::decode(frame)? {
            Frame::Call { sid, id, payload } => self.on_call(sid, id, &payload),
            Frame::Message { id, payload } => {
                self.on_message(id, &payload);
                Ok(())
            }
            Frame::Success { sid, payload } => {
                match st.take_pending(sid) {
                    Some(pending) => {
                        let result =
                            decode_payload(pending.call.output(), &payload).map_err(CallError::Decode);
                        pending.resolve(result);
                    }
                    None => tracing::debug!("Ignoring answer for unknown sid {}", sid),
                }
                Ok(())
            }
            Frame::Error { sid, reason, code } => {
                match st.take_pending(sid) {
                    Some(pending) => pending.resolve(Err(CallError::Remote { reason, code })),
                    None => tracing::debug!("Ignoring error for unknown sid {}", sid),
                }
                Ok(())
            }
        }
    }

    fn on_call(self: &Arc<Self>, sid: u64, id: u64, payload: &[u8]) -> Result<(), PeerError> {
        let call = self.registry.remote_calls(self.side).get(id);
        let (call, handler) = match call.and_then(|c| c.handler().map(|h| (c, h))) {
            Some((call, handler)) => (Arc::clone(call), Arc::clone(handler)),
            None => {
                tracing::debug!("No handler for call id {} (sid={})", id, sid);
                return self.send_error(sid, "Not implemented", ErrorCode::NotImplemented);
            }
        };

        let input = match decode_payload(call.input(), payload) {
            Ok(input) => input,
            Err(e) => {
                tracing::debug!("Invalid input for call {} (sid={}): {}", call.name(), sid, e);
                return self.send_error(sid, "Invalid input data", ErrorCode::InvalidData);
            }
        };

        tracing::debug!("Dispatching call {} (sid={})", call.name(), sid);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = handler(input).await;
            if let Some(inner) = weak.upgrade() {
                inner.answer(sid, &call, result);
            }
        });
        Ok(())
    }

    fn on_message(&self, id: u64, payload: &[u8]) {
        let Some(message) = self.registry.remote_messages(self.side).get(id) else {
            tracing::debug!("Ignoring unknown message id {}", id);
            return;
        };
        let Some(handler) = message.handler().cloned() else {
            return;
        };

        match decode_payload(message.input(), payload) {
            Ok(input) => {
                tracing::debug!("Dispatching message {}", message.name());
                tokio::spawn(async move { handler(input).await });
            }
            Err(e) => tracing::debug!("Ignoring message {} with invalid data: {}", message.name(), e),
        }
    }

    /// Sends a handler's result back to the caller.
    fn answer(&self, sid: u64, call: &Call, result: Result<Value, HandlerError>) {
        let sent = {
            let st = self.state.lock();
            if st.closed {
                tracing::debug!("Dropping answer to {} (sid={}) after close", call.name(), sid);
                return;
            }

            let mut invalid = None;
            let frame = match result {
                Ok(value) => Encoder::success(sid, call.output(), &value).or_else(|e| {
                    invalid = Some(e);
                    Encoder::error(sid, "Internal error", ErrorCode::Internal.wire_code().unwrap_or(0))
                }),
                Err(err) => Encoder::error(sid, &err.reason, err.code),
            };
            let sent = self.send_frame(frame);

            if let Some(source) = invalid {
                tracing::warn!("Handler for {} produced an invalid answer: {}", call.name(), source);
                st.emit(PeerEvent::Error(PeerError::InvalidAnswer {
                    call: call.name().to_string(),
                    source,
                }));
            }
            sent
        };

        if let Err(e) = sent {
            self.fail(e);
        }
    }

    fn start_call(
        self: &Arc<Self>,
        name: &str,
        data: &Value,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Value, CallError>>, CallError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(CallError::Closed);
        }
        if !st.handshake_done() {
            return Err(CallError::NotReady);
        }
        let call = self
            .registry
            .local_calls(self.side)
            .by_name(name)
            .cloned()
            .ok_or_else(|| CallError::UnknownCall(name.to_string()))?;
        if !st.available_calls.get(name).copied().unwrap_or(false) {
            return Err(CallError::Unsupported(name.to_string()));
        }

        let sid = st.next_sid;
        let frame = Encoder::call(sid, call.id(), call.input(), data).map_err(CallError::Encode)?;
        self.sink.send_frame(frame)?;

        let (tx, rx) = oneshot::channel();
        let timer = if timeout.is_zero() {
            None
        } else {
            let weak = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.time_out(sid);
                }
            });
            Some(task.abort_handle())
        };

        st.next_sid += 1;
        st.pending.insert(
            sid,
            PendingCall {
                call,
                reply: tx,
                timer,
            },
        );
        tracing::debug!("Sent call {} (sid={})", name, sid);
        Ok(rx)
    }

    fn time_out(&self, sid: u64) {
        let mut st = self.state.lock();
        if let Some(pending) = st.take_pending(sid) {
            tracing::debug!("Call {} (sid={}) timed out", pending.call.name(), sid);
            // The firing timer is this task; nothing left to abort.
            let _ = pending.reply.send(Err(CallError::Timeout));
        }
    }

    fn close(&self) {
        self.shutdown(None);
    }

    /// Closes, then reports `error`.
    fn fail(&self, error: PeerError) {
        self.shutdown(Some(error));
    }

    fn shutdown(&self, error: Option<PeerError>) {
        let mut st = self.state.lock();
        if st.closed {
            if let Some(e) = error {
                tracing::debug!("Error after close: {}", e);
                st.emit(PeerEvent::Error(e));
            }
            return;
        }

        st.closed = true;
        self.sink.close();

        let pending: Vec<PendingCall> = st.pending.drain().map(|(_, p)| p).collect();
        if !pending.is_empty() {
            tracing::debug!("Failing {} pending calls", pending.len());
        }
        for call in pending {
            call.resolve(Err(CallError::ConnectionLost));
        }

        tracing::info!("{:?} peer closed", self.side);
        st.emit(PeerEvent::Closed);
        if let Some(e) = error {
            st.emit(PeerEvent::Error(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthFn;
    use crate::channel::MemoryChannel;
    use crate::descriptor::{call_handler, message_handler};
    use serde_json::json;
    use tokio::time::Instant;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn add_input() -> Type {
        Type::parse(&json!({"a": "int", "b": "int"})).unwrap()
    }

    fn add_args(a: i64, b: i64) -> Value {
        Value::object().field("a", a).field("b", b).build()
    }

    /// `add` and `hang` are client calls answered by the server; `notify`
    /// is a client message.
    fn registry_with(notify: Option<mpsc::UnboundedSender<Value>>) -> Arc<Registry> {
        let mut registry = Registry::new();
        registry
            .add_client_call(
                1,
                "add",
                Some(add_input()),
                Some(Type::int()),
                Some(call_handler(|input: Value| async move {
                    let a = input.get("a").and_then(Value::as_i64).unwrap_or(0);
                    let b = input.get("b").and_then(Value::as_i64).unwrap_or(0);
                    if a + b > 100 {
                        return Err(HandlerError::new("Result is too large"));
                    }
                    Ok(Value::Int(a + b))
                })),
            )
            .unwrap();
        registry
            .add_client_call(
                2,
                "hang",
                None,
                None,
                Some(call_handler(|_| std::future::pending())),
            )
            .unwrap();
        registry
            .add_client_call(
                3,
                "broken",
                None,
                Some(Type::int()),
                Some(call_handler(|_| async { Ok(Value::from("not a number")) })),
            )
            .unwrap();
        registry
            .add_client_call(4, "unhandled", None, None, None)
            .unwrap();

        let handler = notify.map(|tx| {
            message_handler(move |input| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(input);
                }
            })
        });
        registry
            .add_client_message(1, "notify", Some(Type::string()), handler)
            .unwrap();

        Arc::new(registry)
    }

    async fn connect_with(
        registry: Arc<Registry>,
        client_options: PeerOptions,
        server_options: PeerOptions,
    ) -> (Peer, PeerEvents, Peer, PeerEvents) {
        init_tracing();
        let (a, b) = MemoryChannel::pair();
        let (client, mut client_events) =
            Peer::new(Arc::clone(&registry), Side::Client, client_options, a);
        let (server, mut server_events) = Peer::new(registry, Side::Server, server_options, b);

        client_events.wait_connected().await.unwrap();
        server_events.wait_connected().await.unwrap();
        (client, client_events, server, server_events)
    }

    async fn connect(registry: Arc<Registry>) -> (Peer, PeerEvents, Peer, PeerEvents) {
        connect_with(registry, PeerOptions::default(), PeerOptions::default()).await
    }

    async fn next_frame(channel: &mut FrameChannel) -> Bytes {
        match channel.events.recv().await {
            Some(ChannelEvent::Frame(frame)) => frame,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    /// Plays the remote side of the handshake by hand.
    async fn raw_handshake(raw: &mut FrameChannel, registry: &Registry, side: Side) {
        Handshake::decode(&next_frame(raw).await).unwrap();
        let ours = Handshake::new(
            Credentials::default(),
            registry.remote_calls(side).adverts(),
            registry.remote_messages(side).adverts(),
        );
        raw.sink.send_frame(ours.encode().unwrap()).unwrap();

        let answer = HandshakeAnswer::decode(&next_frame(raw).await).unwrap();
        assert_eq!(answer.error, None);
        raw.sink
            .send_frame(HandshakeAnswer::accepted().encode().unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_scenario() {
        let (client, _ce, _server, _se) = connect(registry_with(None)).await;
        assert!(client.handshake_done());
        assert!(client.can_call("add"));

        let sum = client.call("add", &add_args(12, 13)).await.unwrap();
        assert_eq!(sum, Value::Int(25));

        let err = client.call("add", &add_args(120, 130)).await.unwrap_err();
        assert!(!err.is_local());
        assert_eq!(err.to_string(), "Result is too large");

        let err = client.call("sub", &add_args(1, 2)).await.unwrap_err();
        assert!(err.is_local());
        assert!(matches!(err, CallError::UnknownCall(ref name) if name == "sub"));

        let start = Instant::now();
        let err = client
            .call_with_timeout("hang", &Value::Null, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout));
        assert_eq!(err.code(), Some(-1));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_codes() {
        let (client, _ce, _server, mut server_events) = connect(registry_with(None)).await;

        let err = client.call("unhandled", &Value::Null).await.unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::NotImplemented));
        assert_eq!(err.to_string(), "Not implemented");

        let err = client.call("broken", &Value::Null).await.unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::Internal));
        assert!(!err.is_local());

        match server_events.recv().await {
            Some(PeerEvent::Error(PeerError::InvalidAnswer { call, .. })) => {
                assert_eq!(call, "broken")
            }
            other => panic!("expected an invalid answer event, got {:?}", other),
        }
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_local_encode_error() {
        let (client, _ce, _server, _se) = connect(registry_with(None)).await;
        let err = client
            .call("add", &Value::object().field("a", 1i64).build())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Encode(_)));
        assert!(err.is_local());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_message_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (client, _ce, server, _se) = connect(registry_with(Some(tx))).await;

        assert!(client.can_send("notify"));
        client.send("notify", &Value::from("hello"));
        assert_eq!(rx.recv().await, Some(Value::from("hello")));

        assert!(matches!(
            client.send_strict("shout", &Value::Null),
            Err(SendError::UnknownMessage(_))
        ));
        assert!(matches!(
            client.send_strict("notify", &Value::Int(1)),
            Err(SendError::Encode(_))
        ));
        // The server only receives this message; it cannot send it.
        assert!(matches!(
            server.send_strict("notify", &Value::from("x")),
            Err(SendError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_hash_mismatch_gates_calls() {
        init_tracing();
        let mut client_registry = Registry::new();
        client_registry
            .add_client_call(1, "add", Some(add_input()), Some(Type::int()), None)
            .unwrap();
        client_registry
            .add_client_message(1, "notify", Some(Type::string()), None)
            .unwrap();

        let mut server_registry = Registry::new();
        let other_input = Type::parse(&json!({"a": "int", "b": "string"})).unwrap();
        server_registry
            .add_client_call(1, "add", Some(other_input), Some(Type::int()), None)
            .unwrap();
        server_registry
            .add_client_message(1, "notify", Some(Type::string()), None)
            .unwrap();

        let (a, b) = MemoryChannel::pair();
        let (client, mut client_events) =
            Peer::new(Arc::new(client_registry), Side::Client, PeerOptions::default(), a);
        let (_server, mut server_events) =
            Peer::new(Arc::new(server_registry), Side::Server, PeerOptions::default(), b);
        client_events.wait_connected().await.unwrap();
        server_events.wait_connected().await.unwrap();

        assert!(!client.can_call("add"));
        assert!(client.can_send("notify"));
        let err = client.call("add", &add_args(1, 2)).await.unwrap_err();
        assert!(matches!(err, CallError::Unsupported(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_before_handshake() {
        init_tracing();
        let registry = registry_with(None);
        let (a, b, connector) = MemoryChannel::deferred_pair();
        let (client, mut client_events) =
            Peer::new(Arc::clone(&registry), Side::Client, PeerOptions::default(), a);
        let (_server, mut server_events) =
            Peer::new(registry, Side::Server, PeerOptions::default(), b);

        assert!(!client.handshake_done());
        assert!(!client.can_call("add"));
        let err = client.call("add", &add_args(1, 2)).await.unwrap_err();
        assert!(matches!(err, CallError::NotReady));
        assert!(matches!(
            client.send_strict("notify", &Value::from("x")),
            Err(SendError::NotReady)
        ));

        connector.connect();
        client_events.wait_connected().await.unwrap();
        server_events.wait_connected().await.unwrap();
        assert_eq!(
            client.call("add", &add_args(1, 2)).await.unwrap(),
            Value::Int(3)
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        init_tracing();
        let registry = registry_with(None);
        let (a, b) = MemoryChannel::pair();
        let client_options = PeerOptions::new()
            .with_credentials("user", "pass")
            .require_auth(true);
        let (client, mut client_events) =
            Peer::new(Arc::clone(&registry), Side::Client, client_options, a);
        let (server, mut server_events) =
            Peer::new(registry, Side::Server, PeerOptions::default(), b);

        let err = client_events.wait_connected().await.unwrap_err();
        assert!(matches!(err, PeerError::AuthRequired));
        assert!(server_events.wait_connected().await.is_err());
        assert!(client.is_closed());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_credentials_checked() {
        init_tracing();
        let secret = CredentialValidator::hash_password("wonderland");
        let validator = CredentialValidator::new(vec![("alice".to_string(), secret)]);
        let server_options = PeerOptions::new()
            .require_auth(true)
            .with_auth_policy(validator);

        let (_client, _ce, server, _se) = connect_with(
            registry_with(None),
            PeerOptions::new().with_credentials("alice", "wonderland"),
            server_options.clone(),
        )
        .await;
        assert_eq!(server.remote_user(), "alice");

        let (a, b) = MemoryChannel::pair();
        let registry = registry_with(None);
        let (_client, mut client_events) = Peer::new(
            Arc::clone(&registry),
            Side::Client,
            PeerOptions::new().with_credentials("alice", "guess"),
            a,
        );
        let (_server, mut server_events) = Peer::new(registry, Side::Server, server_options, b);

        let err = server_events.wait_connected().await.unwrap_err();
        assert!(matches!(err, PeerError::AuthRejected(ref reason) if reason == "Invalid credentials"));
        assert!(client_events.wait_connected().await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_failed_reason() {
        init_tracing();
        let registry = registry_with(None);
        let (a, mut raw) = MemoryChannel::pair();
        let (_client, mut client_events) =
            Peer::new(Arc::clone(&registry), Side::Client, PeerOptions::default(), a);

        Handshake::decode(&next_frame(&mut raw).await).unwrap();
        let ours = Handshake::new(Credentials::default(), vec![], vec![]);
        raw.sink.send_frame(ours.encode().unwrap()).unwrap();
        raw.sink
            .send_frame(HandshakeAnswer::rejected("go away").encode().unwrap())
            .unwrap();

        match client_events.wait_connected().await {
            Err(PeerError::HandshakeFailed(reason)) => assert_eq!(reason, "go away"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_answers_are_dropped() {
        init_tracing();
        let registry = registry_with(None);
        let (a, mut raw) = MemoryChannel::pair();
        let (client, mut client_events) =
            Peer::new(Arc::clone(&registry), Side::Client, PeerOptions::default(), a);
        raw_handshake(&mut raw, &registry, Side::Server).await;
        client_events.wait_connected().await.unwrap();

        let pending = client.call_with_timeout("add", &add_args(1, 2), Duration::from_millis(20));
        let sid = match Frame::decode(next_frame(&mut raw).await).unwrap() {
            Frame::Call { sid, id, .. } => {
                assert_eq!(id, 1);
                sid
            }
            other => panic!("expected a call frame, got {:?}", other),
        };
        assert_eq!(sid, 0);
        assert!(matches!(pending.await, Err(CallError::Timeout)));

        // Answering after the timeout finds nothing to resolve.
        let late = Encoder::success(sid, Some(&Type::int()), &Value::Int(3)).unwrap();
        raw.sink.send_frame(late).unwrap();

        // Sids are never reused; an error then a success for the same sid
        // resolves the caller exactly once.
        let pending = client.call_with_timeout("add", &add_args(2, 2), Duration::ZERO);
        let sid = match Frame::decode(next_frame(&mut raw).await).unwrap() {
            Frame::Call { sid, .. } => sid,
            other => panic!("expected a call frame, got {:?}", other),
        };
        assert_eq!(sid, 1);
        raw.sink
            .send_frame(Encoder::error(sid, "busy", 7).unwrap())
            .unwrap();
        raw.sink
            .send_frame(Encoder::success(sid, Some(&Type::int()), &Value::Int(4)).unwrap())
            .unwrap();

        match pending.await {
            Err(CallError::Remote { reason, code }) => {
                assert_eq!(reason, "busy");
                assert_eq!(code, 7);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!client.is_closed());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_inbound_call_errors() {
        init_tracing();
        let registry = registry_with(None);
        let (b, mut raw) = MemoryChannel::pair();
        let (_server, mut server_events) =
            Peer::new(Arc::clone(&registry), Side::Server, PeerOptions::default(), b);
        raw_handshake(&mut raw, &registry, Side::Client).await;
        server_events.wait_connected().await.unwrap();

        let unknown = Frame::Call {
            sid: 0,
            id: 99,
            payload: Bytes::new(),
        };
        raw.sink.send_frame(unknown.encode().unwrap()).unwrap();
        assert_eq!(
            Frame::decode(next_frame(&mut raw).await).unwrap(),
            Frame::Error {
                sid: 0,
                reason: "Not implemented".to_string(),
                code: 1000
            }
        );

        let truncated = Frame::Call {
            sid: 1,
            id: 1,
            payload: Bytes::from_static(&[0x01]),
        };
        raw.sink.send_frame(truncated.encode().unwrap()).unwrap();
        assert_eq!(
            Frame::decode(next_frame(&mut raw).await).unwrap(),
            Frame::Error {
                sid: 1,
                reason: "Invalid input data".to_string(),
                code: 1001
            }
        );

        let good = Encoder::call(2, 1, Some(&add_input()), &add_args(40, 2)).unwrap();
        raw.sink.send_frame(good).unwrap();
        match Frame::decode(next_frame(&mut raw).await).unwrap() {
            Frame::Success { sid, payload } => {
                assert_eq!(sid, 2);
                assert_eq!(Type::int().decode(&payload).unwrap(), Value::Int(42));
            }
            other => panic!("expected a success frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_frame_closes() {
        init_tracing();
        let registry = registry_with(None);
        let (a, mut raw) = MemoryChannel::pair();
        let (client, mut client_events) =
            Peer::new(Arc::clone(&registry), Side::Client, PeerOptions::default(), a);
        raw_handshake(&mut raw, &registry, Side::Server).await;
        client_events.wait_connected().await.unwrap();

        let pending = client.call_with_timeout("hang", &Value::Null, Duration::ZERO);
        next_frame(&mut raw).await;

        raw.sink.send_frame(Bytes::from_static(&[0x09])).unwrap();

        assert!(matches!(client_events.recv().await, Some(PeerEvent::Closed)));
        assert!(matches!(
            client_events.recv().await,
            Some(PeerEvent::Error(PeerError::Protocol(
                ProtocolError::InvalidFrameKind(0x09)
            )))
        ));
        assert!(client_events.recv().await.is_none());
        assert!(matches!(pending.await, Err(CallError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_unexpected_frame_during_auth() {
        init_tracing();
        let registry = registry_with(None);
        let (a, mut raw) = MemoryChannel::pair();
        let stalled = AuthFn(|_: Credentials| std::future::pending::<Result<(), String>>());
        let (client, mut client_events) = Peer::new(
            registry,
            Side::Client,
            PeerOptions::new().with_auth_policy(stalled),
            a,
        );

        Handshake::decode(&next_frame(&mut raw).await).unwrap();
        let ours = Handshake::new(Credentials::default(), vec![], vec![]);
        raw.sink.send_frame(ours.encode().unwrap()).unwrap();
        raw.sink
            .send_frame(HandshakeAnswer::accepted().encode().unwrap())
            .unwrap();
        // Our auth check never finishes, so this frame arrives out of order.
        raw.sink
            .send_frame(Encoder::message(1, None, &Value::Null).unwrap())
            .unwrap();

        match client_events.wait_connected().await {
            Err(PeerError::Protocol(ProtocolError::UnexpectedFrame(_))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, mut client_events, server, mut server_events) =
            connect(registry_with(None)).await;

        let first = client.call_with_timeout("hang", &Value::Null, Duration::ZERO);
        let second = client.call_with_timeout("hang", &Value::Null, Duration::from_secs(60));
        assert_eq!(client.pending_calls(), 2);

        client.close();
        client.close();

        assert!(matches!(first.await, Err(CallError::ConnectionLost)));
        let err = second.await.unwrap_err();
        assert!(matches!(err, CallError::ConnectionLost));
        assert_eq!(err.code(), Some(-2));

        assert!(matches!(client_events.recv().await, Some(PeerEvent::Closed)));
        assert!(client_events.recv().await.is_none());
        assert!(matches!(server_events.recv().await, Some(PeerEvent::Closed)));
        assert!(server.is_closed());

        let err = client.call("add", &add_args(1, 1)).await.unwrap_err();
        assert!(matches!(err, CallError::Closed));
        assert!(matches!(
            client.send_strict("notify", &Value::from("x")),
            Err(SendError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_channel_error_closes_then_reports() {
        init_tracing();
        let registry = registry_with(None);
        let (a, b, connector) = MemoryChannel::deferred_pair();
        let (client, mut client_events) =
            Peer::new(Arc::clone(&registry), Side::Client, PeerOptions::default(), a);
        let (_server, mut server_events) =
            Peer::new(registry, Side::Server, PeerOptions::default(), b);

        connector.fail("boom");

        for events in [&mut client_events, &mut server_events] {
            assert!(matches!(events.recv().await, Some(PeerEvent::Closed)));
            match events.recv().await {
                Some(PeerEvent::Error(PeerError::Channel(e))) => {
                    assert!(e.to_string().contains("boom"))
                }
                other => panic!("expected a channel error, got {:?}", other),
            }
        }
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_answered_calls_leave_no_entries() {
        let (client, _ce, _server, _se) = connect(registry_with(None)).await;

        for i in 0..1000i64 {
            let sum = client.call("add", &add_args(i % 50, 1)).await.unwrap();
            assert_eq!(sum, Value::Int(i % 50 + 1));
        }
        let err = client
            .call_with_timeout("hang", &Value::Null, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout));

        let st = client.inner.state.lock();
        assert!(st.pending.is_empty());
        assert_eq!(st.next_sid, 1001);
    }

    #[tokio::test]
    async fn test_channel_error_after_close_is_reported() {
        init_tracing();
        let (a, _b) = MemoryChannel::pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = FrameChannel::new(a.sink, rx, true);
        let (_peer, mut events) =
            Peer::new(registry_with(None), Side::Client, PeerOptions::default(), channel);

        tx.send(ChannelEvent::Closed).unwrap();
        tx.send(ChannelEvent::Error(crate::error::ChannelError::Transport(
            "reset".to_string(),
        )))
        .unwrap();

        assert!(matches!(events.recv().await, Some(PeerEvent::Closed)));
        match events.recv().await {
            Some(PeerEvent::Error(PeerError::Channel(e))) => {
                assert!(e.to_string().contains("reset"))
            }
            other => panic!("expected a channel error, got {:?}", other),
        }
        assert!(events.recv().await.is_none());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = PeerConfig::default();
        config.auth.user = "svc".to_string();
        config.auth.required = true;
        config.calls.timeout_ms = 0;

        let options = PeerOptions::from_config(&config);
        assert_eq!(options.user, "svc");
        assert!(options.auth_required);
        assert!(options.call_timeout.is_zero());
        assert!(!format!("{:?}", options).contains("password"));
    }
}
