// Relay stream - one ordered duplex byte stream on top of disposable
// transport connections, with ACK tracking, reconnect and retransmission.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::close_code::{CloseClass, CloseCode, ClosePhase};
use crate::error::RelayError;
use crate::models::RelayTimeouts;
use crate::protocol::{self, RelayMessage, MAX_MESSAGE_SIZE, MAX_WRITE_SIZE, MIN_READ_SIZE};
use crate::transport::{RelayTarget, RelayTransport, TransportError};

/// Bytes written by the caller but not yet acknowledged by the relay.
///
/// `head_offset` is the cumulative stream offset of the first queued byte and
/// always equals the acked watermark once a trim has been applied. Acks may
/// land mid-chunk because the relay re-segments payloads, so trimming can
/// split the head chunk.
#[derive(Debug, Default)]
struct PendingQueue {
    chunks: VecDeque<Bytes>,
    head_offset: u64,
}

impl PendingQueue {
    fn push(&mut self, chunk: Bytes) {
        self.chunks.push_back(chunk);
    }

    /// Drops every queued byte below `watermark`.
    fn trim_to(&mut self, watermark: u64) {
        while let Some(front) = self.chunks.front_mut() {
            let end = self.head_offset + front.len() as u64;
            if end <= watermark {
                self.head_offset = end;
                self.chunks.pop_front();
            } else {
                let cut = watermark.saturating_sub(self.head_offset) as usize;
                if cut > 0 {
                    front.advance(cut);
                    self.head_offset = watermark;
                }
                break;
            }
        }
        if self.head_offset < watermark {
            self.head_offset = watermark;
        }
    }

    /// Unacked chunks, oldest first, for resending after a reconnect.
    fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.head_offset = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Denied,
    BackendNotFound,
    ConnectFailed,
    ReconnectFailed,
    Protocol,
}

impl FailureKind {
    fn to_error(self, reason: String) -> RelayError {
        match self {
            FailureKind::Denied => RelayError::Denied(reason),
            FailureKind::BackendNotFound => RelayError::BackendNotFound(reason),
            FailureKind::ConnectFailed => RelayError::ConnectFailed(reason),
            FailureKind::ReconnectFailed => RelayError::ReconnectFailed(reason),
            FailureKind::Protocol => RelayError::ProtocolViolation(reason),
        }
    }
}

/// Lifecycle of the stream as a whole, separate from any one transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum StreamStatus {
    #[default]
    Open,
    ClosedByCaller,
    ClosedByPeer,
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryMode {
    /// Dial a brand-new relay session. Used before any write is pending.
    Restart,
    /// Re-attach to the existing session and resend the unacked queue.
    Reattach,
}

/// What the read loop should do after one decoded message.
enum MessageOutcome {
    Deliver(usize),
    Continue,
    Close(CloseCode, String),
}

/// Session bookkeeping guarded by the stream's state lock. Never held across
/// an await point.
#[derive(Default)]
struct Session {
    sid: Option<String>,
    // True once any session id was established over the stream's lifetime,
    // even across restarts. Drives close-code classification.
    sid_ever: bool,
    transport: Option<Arc<dyn RelayTransport>>,
    // Bumped each time a new transport is installed, so an operation that
    // observed a dead transport cannot tear down its replacement.
    generation: u64,
    bytes_written: u64,
    bytes_acked: u64,
    bytes_consumed: u64,
    pending: PendingQueue,
    owed_ack: bool,
    // Handshake over-read destined for the read loop, tagged implicitly by
    // `generation`.
    recv_carry: BytesMut,
    status: StreamStatus,
}

impl Session {
    fn status_error(&self) -> Option<RelayError> {
        match &self.status {
            StreamStatus::Open => None,
            StreamStatus::ClosedByCaller => Some(RelayError::StreamClosedByCaller),
            StreamStatus::ClosedByPeer => Some(RelayError::StreamClosedByPeer),
            StreamStatus::Failed { kind, reason } => Some(kind.to_error(reason.clone())),
        }
    }

    /// Applies an ACK watermark, trimming the pending queue. `from_reconnect`
    /// marks watermarks carried by ReconnectSuccessAck, which may legitimately
    /// be zero.
    fn apply_ack(&mut self, ack: u64, from_reconnect: bool) -> Result<(), RelayError> {
        if !from_reconnect && ack == 0 && self.bytes_written > 0 {
            return Err(RelayError::ProtocolViolation(format!(
                "Zero ACK after {} bytes written",
                self.bytes_written
            )));
        }
        if ack < self.bytes_acked || ack > self.bytes_written {
            return Err(RelayError::ProtocolViolation(format!(
                "ACK watermark {} outside window {}..{}",
                ack, self.bytes_acked, self.bytes_written
            )));
        }
        self.pending.trim_to(ack);
        self.bytes_acked = ack;
        Ok(())
    }
}

/// Receive-side buffers, guarded by the read lock so one reader runs at a
/// time. `scratch` is the transport read target; bytes move into `buf` only
/// after a read completes, so a cancelled read leaves `buf` intact.
struct RecvBuffer {
    buf: BytesMut,
    scratch: Vec<u8>,
    // Generation whose bytes currently sit in `buf`; on mismatch the stale
    // remainder is discarded (the relay resends from the consumed watermark).
    filled_gen: u64,
}

impl RecvBuffer {
    fn new() -> Self {
        RecvBuffer {
            buf: BytesMut::with_capacity(MIN_READ_SIZE),
            scratch: vec![0u8; MIN_READ_SIZE],
            filled_gen: 0,
        }
    }
}

enum DialError {
    /// The relay dropped the fresh connection for a transient reason; the
    /// dial may be repeated.
    Retry(String),
    Fatal(RelayError),
}

/// One logically continuous, acknowledged duplex byte stream over a relay.
///
/// The stream dials its target lazily on the first read or write, records the
/// session id from `ConnectSuccess`, and absorbs transport churn: recoverable
/// close codes trigger a reconnect (or a fresh connect when nothing is
/// pending) followed by retransmission of every unacknowledged byte. One read
/// and one write may run concurrently; neither operation is reentrant.
/// Dropping a pending `read`/`write` future cancels that operation without
/// corrupting the ACK bookkeeping.
pub struct RelayStream<G: RelayTarget> {
    target: G,
    stream_id: String,
    timeouts: RelayTimeouts,
    session: Mutex<Session>,
    recv: TokioMutex<RecvBuffer>,
    send: TokioMutex<BytesMut>,
    // Serializes connect/reconnect attempts across the read and write paths.
    recovery: TokioMutex<()>,
}

impl<G: RelayTarget> RelayStream<G> {
    pub fn new(target: G) -> Self {
        Self::with_timeouts(target, RelayTimeouts::default())
    }

    pub fn with_timeouts(target: G, timeouts: RelayTimeouts) -> Self {
        let stream_id = Uuid::new_v4().to_string();
        debug!("Stream {}: created", stream_id);
        RelayStream {
            target,
            stream_id,
            timeouts,
            session: Mutex::new(Session::default()),
            recv: TokioMutex::new(RecvBuffer::new()),
            send: TokioMutex::new(BytesMut::with_capacity(MAX_MESSAGE_SIZE)),
            recovery: TokioMutex::new(()),
        }
    }

    /// Local identifier used in logs; not the relay session id.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Session id announced by the relay, once known.
    pub fn sid(&self) -> Option<String> {
        self.session.lock().unwrap().sid.clone()
    }

    pub fn bytes_written(&self) -> u64 {
        self.session.lock().unwrap().bytes_written
    }

    pub fn bytes_acked(&self) -> u64 {
        self.session.lock().unwrap().bytes_acked
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.session.lock().unwrap().bytes_consumed
    }

    /// Reads the next chunk of the tunneled byte stream into `out`.
    ///
    /// `out` must hold at least `MIN_READ_SIZE` bytes so any relay message
    /// fits. Returns 0 once the relay has closed the stream gracefully.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize, RelayError> {
        if out.len() < MIN_READ_SIZE {
            return Err(RelayError::BufferTooSmall {
                given: out.len(),
                required: MIN_READ_SIZE,
            });
        }
        {
            let session = self.session.lock().unwrap();
            if matches!(session.status, StreamStatus::ClosedByPeer) {
                return Ok(0);
            }
            if let Some(err) = session.status_error() {
                return Err(err);
            }
        }
        match self.read_inner(out).await {
            Err(RelayError::StreamClosedByPeer) => Ok(0),
            other => other,
        }
    }

    async fn read_inner(&self, out: &mut [u8]) -> Result<usize, RelayError> {
        let mut recv = self.recv.lock().await;
        let RecvBuffer {
            buf,
            scratch,
            filled_gen,
        } = &mut *recv;

        loop {
            // Buffered bytes are only parsed while they belong to the live
            // transport; once a recovery bumps the generation the remainder
            // is stale and the relay resends it from the consumed watermark.
            if *filled_gen == self.session.lock().unwrap().generation {
                if let Some(msg) =
                    protocol::try_parse_message(buf).map_err(|e| self.fail_with(e))?
                {
                    match self.handle_message(msg, out).map_err(|e| self.fail_with(e))? {
                        MessageOutcome::Deliver(n) => return Ok(n),
                        MessageOutcome::Continue => continue,
                        MessageOutcome::Close(code, reason) => {
                            if !buf.is_empty()
                                && matches!(code.classify(self.phase()), CloseClass::Graceful)
                            {
                                return Err(self.fail_with(RelayError::MalformedMessage(format!(
                                    "{} byte(s) of trailing data after the relay closed the stream",
                                    buf.len()
                                ))));
                            }
                            self.recover_from(TransportError::Closed { code, reason }, *filled_gen)
                                .await?;
                            continue;
                        }
                    }
                }
            }

            let (transport, gen) = self.ensure_transport().await?;
            if *filled_gen != gen {
                // Stale bytes from a dead transport; anything unread is
                // resent by the relay from the consumed watermark.
                buf.clear();
                let carry = {
                    let mut session = self.session.lock().unwrap();
                    mem::take(&mut session.recv_carry)
                };
                if !carry.is_empty() {
                    buf.extend_from_slice(&carry);
                }
                *filled_gen = gen;
                continue;
            }

            match transport.read(&mut scratch[..]).await {
                Ok(0) => {
                    let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
                    self.recover_from(TransportError::Io(eof), gen).await?;
                }
                Ok(n) => {
                    // The transport may have been replaced while this read
                    // was parked; bytes from the old one must never reach
                    // the caller a second time.
                    if self.session.lock().unwrap().generation == gen {
                        buf.extend_from_slice(&scratch[..n]);
                    } else {
                        debug!(
                            "Stream {}: dropped {} byte(s) read from a replaced transport",
                            self.stream_id, n
                        );
                    }
                }
                Err(err) => {
                    if let TransportError::Closed { code, .. } = &err {
                        let fresh = self.session.lock().unwrap().generation == gen;
                        if fresh
                            && !buf.is_empty()
                            && matches!(code.classify(self.phase()), CloseClass::Graceful)
                        {
                            return Err(self.fail_with(RelayError::MalformedMessage(format!(
                                "Transport closed gracefully mid-message with {} byte(s) buffered",
                                buf.len()
                            ))));
                        }
                    }
                    self.recover_from(err, gen).await?;
                }
            }
        }
    }

    fn handle_message(
        &self,
        msg: RelayMessage,
        out: &mut [u8],
    ) -> Result<MessageOutcome, RelayError> {
        match msg {
            RelayMessage::ConnectSuccess { sid } => {
                debug!("Stream {}: relay announced session {}", self.stream_id, sid);
                let mut session = self.session.lock().unwrap();
                session.sid = Some(sid);
                session.sid_ever = true;
                Ok(MessageOutcome::Continue)
            }
            RelayMessage::ReconnectSuccessAck { ack } => {
                self.session.lock().unwrap().apply_ack(ack, true)?;
                Ok(MessageOutcome::Continue)
            }
            RelayMessage::Ack { ack } => {
                self.session.lock().unwrap().apply_ack(ack, false)?;
                trace!("Stream {}: relay acked {} bytes", self.stream_id, ack);
                Ok(MessageOutcome::Continue)
            }
            RelayMessage::Data { payload } => {
                let n = payload.len();
                out[..n].copy_from_slice(&payload);
                {
                    let mut session = self.session.lock().unwrap();
                    session.bytes_consumed += n as u64;
                    session.owed_ack = true;
                }
                trace!("Stream {}: delivered {} bytes to caller", self.stream_id, n);
                Ok(MessageOutcome::Deliver(n))
            }
            RelayMessage::Close { code, reason } => Ok(MessageOutcome::Close(code, reason)),
            RelayMessage::Unknown { tag } => {
                if self.session.lock().unwrap().sid.is_some() {
                    debug!("Stream {}: skipping deprecated tag {}", self.stream_id, tag);
                    Ok(MessageOutcome::Continue)
                } else {
                    Err(RelayError::ProtocolViolation(format!(
                        "Unexpected tag {} before session was established",
                        tag
                    )))
                }
            }
        }
    }

    /// Sends one chunk of at most `MAX_WRITE_SIZE` bytes to the relay.
    ///
    /// An owed ACK for consumed data is piggybacked first. The chunk joins
    /// the pending queue until the relay acknowledges it, and is resent
    /// automatically after a reconnect.
    pub async fn write(&self, buf: &[u8]) -> Result<(), RelayError> {
        if buf.is_empty() {
            return Err(RelayError::EmptyPayload);
        }
        if buf.len() > MAX_WRITE_SIZE {
            return Err(RelayError::PayloadTooLarge {
                given: buf.len(),
                max: MAX_WRITE_SIZE,
            });
        }
        {
            let session = self.session.lock().unwrap();
            if let Some(err) = session.status_error() {
                return Err(err);
            }
        }

        let payload = Bytes::copy_from_slice(buf);
        let frame = RelayMessage::Data {
            payload: payload.clone(),
        };
        let mut scratch = self.send.lock().await;

        loop {
            let (transport, gen) = self.ensure_transport().await?;

            let owed = {
                let session = self.session.lock().unwrap();
                if session.owed_ack {
                    Some(session.bytes_consumed)
                } else {
                    None
                }
            };
            if let Some(watermark) = owed {
                scratch.clear();
                protocol::encode_into(&RelayMessage::Ack { ack: watermark }, &mut scratch)?;
                if let Err(err) = transport.write(&scratch).await {
                    self.recover_from(err, gen).await?;
                    continue;
                }
                trace!(
                    "Stream {}: acked {} consumed bytes to relay",
                    self.stream_id,
                    watermark
                );
                let mut session = self.session.lock().unwrap();
                if session.bytes_consumed == watermark {
                    session.owed_ack = false;
                }
            }

            scratch.clear();
            protocol::encode_into(&frame, &mut scratch)?;
            if let Err(err) = transport.write(&scratch).await {
                self.recover_from(err, gen).await?;
                continue;
            }
            let committed = {
                let mut session = self.session.lock().unwrap();
                if session.generation == gen {
                    session.pending.push(payload.clone());
                    session.bytes_written += payload.len() as u64;
                    Some(session.bytes_written)
                } else {
                    None
                }
            };
            let total = match committed {
                Some(total) => total,
                None => {
                    // The transport was replaced while this write was in
                    // flight, so the bytes landed on the dead one. Send
                    // them again on the live session.
                    debug!(
                        "Stream {}: resending {} byte(s) written to a replaced transport",
                        self.stream_id,
                        payload.len()
                    );
                    continue;
                }
            };
            trace!(
                "Stream {}: wrote {} bytes (total {})",
                self.stream_id,
                payload.len(),
                total
            );
            return Ok(());
        }
    }

    /// Closes the stream. Final: in-flight and later operations fail with a
    /// closed-by-caller error, and no reconnect is attempted.
    pub async fn close(&self) {
        let transport = {
            let mut session = self.session.lock().unwrap();
            session.status = StreamStatus::ClosedByCaller;
            session.transport.take()
        };
        if let Some(transport) = transport {
            debug!("Stream {}: closed by caller", self.stream_id);
            if timeout(self.timeouts.close, transport.close()).await.is_err() {
                warn!("Stream {}: transport close timed out", self.stream_id);
            }
        }
    }

    /// One-shot connect-and-first-read cycle to validate reachability and
    /// authorization without keeping a session. Denial, lookup and connect
    /// failures surface exactly as they would on a real read.
    pub async fn probe_connection(&self, probe_timeout: Duration) -> Result<(), RelayError> {
        {
            let session = self.session.lock().unwrap();
            if let Some(err) = session.status_error() {
                return Err(err);
            }
        }
        debug!("Stream {}: probing relay connectivity", self.stream_id);
        match timeout(probe_timeout, self.probe_inner()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ConnectFailed(format!(
                "Probe timed out after {:?}",
                probe_timeout
            ))),
        }
    }

    async fn probe_inner(&self) -> Result<(), RelayError> {
        let transport = match self.target.connect().await {
            Ok(t) => t,
            Err(TransportError::Closed { code, reason }) => {
                return probe_close_result(code, &reason)
            }
            Err(TransportError::LocallyClosed) => return Err(RelayError::StreamClosedByCaller),
            Err(TransportError::Io(err)) => {
                return Err(RelayError::ConnectFailed(format!(
                    "Probe connect failed: {}",
                    err
                )))
            }
        };

        let mut buf = BytesMut::with_capacity(256);
        let mut scratch = vec![0u8; MIN_READ_SIZE];
        loop {
            if let Some(msg) = protocol::try_parse_message(&mut buf)? {
                let result = match msg {
                    RelayMessage::Close { code, reason } => probe_close_result(code, &reason),
                    other => {
                        debug!(
                            "Stream {}: probe reached the relay ({})",
                            self.stream_id,
                            other.kind()
                        );
                        Ok(())
                    }
                };
                transport.close().await;
                return result;
            }
            match transport.read(&mut scratch[..]).await {
                Ok(0) => {
                    return Err(RelayError::ConnectFailed(
                        "Probe connection ended before the relay handshake".into(),
                    ))
                }
                Ok(n) => buf.extend_from_slice(&scratch[..n]),
                Err(TransportError::Closed { code, reason }) => {
                    return probe_close_result(code, &reason)
                }
                Err(TransportError::LocallyClosed) => return Err(RelayError::StreamClosedByCaller),
                Err(TransportError::Io(err)) => {
                    return Err(RelayError::ConnectFailed(format!(
                        "Probe read failed: {}",
                        err
                    )))
                }
            }
        }
    }

    /// Returns the live transport, dialing one under the recovery lock when
    /// none is installed.
    async fn ensure_transport(&self) -> Result<(Arc<dyn RelayTransport>, u64), RelayError> {
        {
            let session = self.session.lock().unwrap();
            if let Some(err) = session.status_error() {
                return Err(err);
            }
            if let Some(transport) = &session.transport {
                return Ok((transport.clone(), session.generation));
            }
        }

        let _guard = self.recovery.lock().await;
        let mode = {
            let session = self.session.lock().unwrap();
            if let Some(err) = session.status_error() {
                return Err(err);
            }
            if let Some(transport) = &session.transport {
                return Ok((transport.clone(), session.generation));
            }
            if session.bytes_written > 0 && session.sid.is_some() {
                RecoveryMode::Reattach
            } else {
                RecoveryMode::Restart
            }
        };
        let result = match mode {
            RecoveryMode::Restart => self.restart_locked(false).await,
            RecoveryMode::Reattach => self.reattach_locked().await,
        };
        result.map_err(|e| self.fail_with(e))
    }

    /// Reacts to a transport-level failure observed at `gen`: graceful codes
    /// end the stream, terminal codes poison it, recoverable ones dial a
    /// replacement transport.
    async fn recover_from(&self, err: TransportError, gen: u64) -> Result<(), RelayError> {
        match err {
            TransportError::LocallyClosed => Err(RelayError::StreamClosedByCaller),
            TransportError::Io(io_err) => {
                warn!(
                    "Stream {}: transport failed ({}), attempting recovery",
                    self.stream_id, io_err
                );
                self.recover(gen).await
            }
            TransportError::Closed { code, reason } => {
                let detail = close_detail(code, &reason);
                match code.classify(self.phase()) {
                    CloseClass::Graceful => {
                        debug!(
                            "Stream {}: relay closed the stream gracefully ({})",
                            self.stream_id, detail
                        );
                        self.latch_peer_closed(Some(gen));
                        Err(RelayError::StreamClosedByPeer)
                    }
                    CloseClass::Denied => {
                        self.drop_transport_if(gen);
                        Err(self.fail_with(RelayError::Denied(detail)))
                    }
                    CloseClass::BackendNotFound => {
                        self.drop_transport_if(gen);
                        Err(self.fail_with(RelayError::BackendNotFound(detail)))
                    }
                    CloseClass::ConnectFailed => {
                        self.drop_transport_if(gen);
                        Err(self.fail_with(RelayError::ConnectFailed(detail)))
                    }
                    CloseClass::ReconnectFailed => {
                        self.drop_transport_if(gen);
                        Err(self.fail_with(RelayError::ReconnectFailed(detail)))
                    }
                    CloseClass::Recoverable => {
                        warn!(
                            "Stream {}: transport closed with {}, attempting recovery",
                            self.stream_id, detail
                        );
                        self.recover(gen).await
                    }
                }
            }
        }
    }

    /// Dials a replacement transport for a failure observed at `gen`. If
    /// another operation already installed a newer transport, does nothing.
    async fn recover(&self, gen: u64) -> Result<(), RelayError> {
        let _guard = self.recovery.lock().await;
        let mode = {
            let mut session = self.session.lock().unwrap();
            if let Some(err) = session.status_error() {
                return Err(err);
            }
            if session.generation != gen {
                return Ok(());
            }
            session.transport = None;
            if session.bytes_written > 0 && session.sid.is_some() {
                RecoveryMode::Reattach
            } else {
                RecoveryMode::Restart
            }
        };
        let result = match mode {
            RecoveryMode::Restart => self.restart_locked(true).await,
            RecoveryMode::Reattach => self.reattach_locked().await,
        };
        result.map(|_| ()).map_err(|e| self.fail_with(e))
    }

    /// Closes a dialed transport that will not be installed.
    async fn close_dialed(&self, transport: &Arc<dyn RelayTransport>) {
        if timeout(self.timeouts.close, transport.close()).await.is_err() {
            warn!("Stream {}: transport close timed out", self.stream_id);
        }
    }

    /// Establishes a brand-new relay session. Caller holds the recovery lock.
    /// `recovering` distinguishes a recovery dial (one shot) from the lazy
    /// initial dial, which may repeat once if the relay drops the fresh
    /// connection with a recoverable code.
    async fn restart_locked(
        &self,
        recovering: bool,
    ) -> Result<(Arc<dyn RelayTransport>, u64), RelayError> {
        {
            // A new relay session starts its byte counters from zero.
            let mut session = self.session.lock().unwrap();
            session.sid = None;
            session.bytes_written = 0;
            session.bytes_acked = 0;
            session.bytes_consumed = 0;
            session.pending.clear();
            session.owed_ack = false;
            session.recv_carry = BytesMut::new();
        }

        let deadline = self.timeouts.connect;
        let mut attempt = timeout(deadline, self.dial_connect()).await;
        let retry_detail = match &attempt {
            Ok(Err(DialError::Retry(detail))) if !recovering => Some(detail.clone()),
            _ => None,
        };
        if let Some(detail) = retry_detail {
            warn!(
                "Stream {}: relay dropped the fresh connection ({}), dialing again",
                self.stream_id, detail
            );
            attempt = timeout(deadline, self.dial_connect()).await;
        }

        let (transport, sid, surplus) = match attempt {
            Ok(Ok(dialed)) => dialed,
            Ok(Err(DialError::Retry(detail))) => return Err(RelayError::ConnectFailed(detail)),
            Ok(Err(DialError::Fatal(err))) => return Err(err),
            Err(_) => {
                return Err(RelayError::ConnectFailed(format!(
                    "Connect timed out after {:?}",
                    deadline
                )))
            }
        };

        let installed = {
            let mut session = self.session.lock().unwrap();
            match session.status_error() {
                // The stream was closed while the dial was in flight; the
                // fresh transport must not outlive it.
                Some(err) => Err(err),
                None => {
                    session.sid = Some(sid.clone());
                    session.sid_ever = true;
                    session.transport = Some(transport.clone());
                    session.generation += 1;
                    session.recv_carry = surplus;
                    Ok(session.generation)
                }
            }
        };
        let gen = match installed {
            Ok(gen) => gen,
            Err(err) => {
                self.close_dialed(&transport).await;
                return Err(err);
            }
        };
        info!(
            "Stream {}: relay session established, sid {}",
            self.stream_id, sid
        );
        Ok((transport, gen))
    }

    /// Dials `connect` and consumes the `ConnectSuccess` handshake. Bytes
    /// read past the handshake are returned for the read loop.
    async fn dial_connect(
        &self,
    ) -> Result<(Arc<dyn RelayTransport>, String, BytesMut), DialError> {
        let transport: Arc<dyn RelayTransport> = match self.target.connect().await {
            Ok(t) => Arc::from(t),
            Err(err) => return Err(self.classify_dial_failure(err, RecoveryMode::Restart)),
        };

        let mut buf = BytesMut::with_capacity(256);
        let mut scratch = vec![0u8; MIN_READ_SIZE];
        loop {
            match protocol::try_parse_message(&mut buf) {
                Err(err) => {
                    self.close_dialed(&transport).await;
                    return Err(DialError::Fatal(err));
                }
                Ok(Some(RelayMessage::ConnectSuccess { sid })) => {
                    return Ok((transport, sid, buf))
                }
                Ok(Some(RelayMessage::Close { code, reason })) => {
                    return Err(self.classify_dial_failure(
                        TransportError::Closed { code, reason },
                        RecoveryMode::Restart,
                    ))
                }
                Ok(Some(RelayMessage::Unknown { tag })) => {
                    self.close_dialed(&transport).await;
                    return Err(DialError::Fatal(RelayError::ProtocolViolation(format!(
                        "Unexpected tag {} before session was established",
                        tag
                    ))));
                }
                Ok(Some(other)) => {
                    self.close_dialed(&transport).await;
                    return Err(DialError::Fatal(RelayError::ProtocolViolation(format!(
                        "Expected ConnectSuccess during the relay handshake, got {}",
                        other.kind()
                    ))));
                }
                Ok(None) => match transport.read(&mut scratch[..]).await {
                    Ok(0) => {
                        return Err(DialError::Retry(
                            "Connection ended during the relay handshake".into(),
                        ))
                    }
                    Ok(n) => buf.extend_from_slice(&scratch[..n]),
                    Err(err) => {
                        return Err(self.classify_dial_failure(err, RecoveryMode::Restart))
                    }
                },
            }
        }
    }

    /// Re-attaches to the current session and resends the unacked queue on
    /// the new transport before installing it. Caller holds the recovery
    /// lock, so reads and writes stay parked until the resend is complete.
    async fn reattach_locked(&self) -> Result<(Arc<dyn RelayTransport>, u64), RelayError> {
        let (sid, consumed) = {
            let session = self.session.lock().unwrap();
            match &session.sid {
                Some(sid) => (sid.clone(), session.bytes_consumed),
                None => {
                    return Err(RelayError::ProtocolViolation(
                        "Reconnect attempted without a session id".into(),
                    ))
                }
            }
        };
        info!(
            "Stream {}: reconnecting to relay, sid {}, consumed {}",
            self.stream_id, sid, consumed
        );

        let deadline = self.timeouts.reconnect;
        let (transport, ack, surplus) =
            match timeout(deadline, self.dial_reconnect(&sid, consumed)).await {
                Ok(Ok(dialed)) => dialed,
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(RelayError::ReconnectFailed(format!(
                        "Reconnect timed out after {:?}",
                        deadline
                    )))
                }
            };

        let applied = {
            let mut session = self.session.lock().unwrap();
            let applied = session.apply_ack(ack, true);
            if applied.is_ok() {
                // The reconnect itself reported the consumed watermark.
                session.owed_ack = false;
            }
            applied
        };
        if let Err(err) = applied {
            self.close_dialed(&transport).await;
            return Err(err);
        }

        let chunks = self.session.lock().unwrap().pending.snapshot();
        if !chunks.is_empty() {
            let total: usize = chunks.iter().map(|c| c.len()).sum();
            let mut frame = BytesMut::with_capacity(MAX_MESSAGE_SIZE);
            for chunk in &chunks {
                frame.clear();
                protocol::encode_into(
                    &RelayMessage::Data {
                        payload: chunk.clone(),
                    },
                    &mut frame,
                )?;
                if let Err(err) = transport.write(&frame).await {
                    self.close_dialed(&transport).await;
                    return Err(RelayError::ReconnectFailed(format!(
                        "Resend after reconnect failed: {}",
                        err
                    )));
                }
            }
            debug!(
                "Stream {}: resent {} unacknowledged byte(s) in {} chunk(s)",
                self.stream_id,
                total,
                chunks.len()
            );
        }

        let installed = {
            let mut session = self.session.lock().unwrap();
            match session.status_error() {
                Some(err) => Err(err),
                None => {
                    session.transport = Some(transport.clone());
                    session.generation += 1;
                    session.recv_carry = surplus;
                    Ok(session.generation)
                }
            }
        };
        let gen = match installed {
            Ok(gen) => gen,
            Err(err) => {
                self.close_dialed(&transport).await;
                return Err(err);
            }
        };
        info!(
            "Stream {}: reconnected, relay acked {} of {} written bytes",
            self.stream_id,
            ack,
            self.bytes_written()
        );
        Ok((transport, gen))
    }

    /// Dials `reconnect` and consumes the `ReconnectSuccessAck` handshake.
    async fn dial_reconnect(
        &self,
        sid: &str,
        consumed: u64,
    ) -> Result<(Arc<dyn RelayTransport>, u64, BytesMut), RelayError> {
        let transport: Arc<dyn RelayTransport> = match self.target.reconnect(sid, consumed).await {
            Ok(t) => Arc::from(t),
            Err(err) => return Err(self.reattach_failure(err)),
        };

        let mut buf = BytesMut::with_capacity(256);
        let mut scratch = vec![0u8; MIN_READ_SIZE];
        loop {
            match protocol::try_parse_message(&mut buf) {
                Err(err) => {
                    self.close_dialed(&transport).await;
                    return Err(err);
                }
                Ok(Some(RelayMessage::ReconnectSuccessAck { ack })) => {
                    return Ok((transport, ack, buf))
                }
                Ok(Some(RelayMessage::Close { code, reason })) => {
                    return Err(self.reattach_failure(TransportError::Closed { code, reason }))
                }
                Ok(Some(RelayMessage::Unknown { tag })) => {
                    debug!(
                        "Stream {}: skipping deprecated tag {} during reconnect",
                        self.stream_id, tag
                    );
                }
                Ok(Some(other)) => {
                    self.close_dialed(&transport).await;
                    return Err(RelayError::ProtocolViolation(format!(
                        "Expected ReconnectSuccessAck during the reconnect handshake, got {}",
                        other.kind()
                    )));
                }
                Ok(None) => match transport.read(&mut scratch[..]).await {
                    Ok(0) => {
                        return Err(RelayError::ReconnectFailed(
                            "Connection ended during the reconnect handshake".into(),
                        ))
                    }
                    Ok(n) => buf.extend_from_slice(&scratch[..n]),
                    Err(err) => return Err(self.reattach_failure(err)),
                },
            }
        }
    }

    fn reattach_failure(&self, err: TransportError) -> RelayError {
        match self.classify_dial_failure(err, RecoveryMode::Reattach) {
            DialError::Fatal(err) => err,
            DialError::Retry(detail) => RelayError::ReconnectFailed(detail),
        }
    }

    fn classify_dial_failure(&self, err: TransportError, mode: RecoveryMode) -> DialError {
        match err {
            TransportError::LocallyClosed => DialError::Fatal(RelayError::StreamClosedByCaller),
            TransportError::Io(io_err) => match mode {
                RecoveryMode::Restart => DialError::Retry(io_err.to_string()),
                RecoveryMode::Reattach => DialError::Fatal(RelayError::ReconnectFailed(format!(
                    "Reconnect failed: {}",
                    io_err
                ))),
            },
            TransportError::Closed { code, reason } => {
                let detail = close_detail(code, &reason);
                match code.classify(self.phase()) {
                    CloseClass::Graceful => {
                        self.latch_peer_closed(None);
                        DialError::Fatal(RelayError::StreamClosedByPeer)
                    }
                    CloseClass::Denied => DialError::Fatal(RelayError::Denied(detail)),
                    CloseClass::BackendNotFound => {
                        DialError::Fatal(RelayError::BackendNotFound(detail))
                    }
                    CloseClass::ConnectFailed => {
                        DialError::Fatal(RelayError::ConnectFailed(detail))
                    }
                    CloseClass::ReconnectFailed => {
                        DialError::Fatal(RelayError::ReconnectFailed(detail))
                    }
                    CloseClass::Recoverable => match mode {
                        RecoveryMode::Restart => DialError::Retry(detail),
                        RecoveryMode::Reattach => {
                            DialError::Fatal(RelayError::ReconnectFailed(detail))
                        }
                    },
                }
            }
        }
    }

    fn phase(&self) -> ClosePhase {
        if self.session.lock().unwrap().sid_ever {
            ClosePhase::Active
        } else {
            ClosePhase::Connecting
        }
    }

    fn latch_peer_closed(&self, gen: Option<u64>) {
        let mut session = self.session.lock().unwrap();
        if matches!(session.status, StreamStatus::Open) {
            session.status = StreamStatus::ClosedByPeer;
        }
        if let Some(gen) = gen {
            if session.generation == gen {
                session.transport = None;
            }
        }
    }

    fn drop_transport_if(&self, gen: u64) {
        let mut session = self.session.lock().unwrap();
        if session.generation == gen {
            session.transport = None;
        }
    }

    /// Marks the stream unusable for terminal failures, so later operations
    /// fail the same way instead of redialing.
    fn fail_with(&self, err: RelayError) -> RelayError {
        let failure = match &err {
            RelayError::Denied(reason) => Some((FailureKind::Denied, reason.clone())),
            RelayError::BackendNotFound(reason) => {
                Some((FailureKind::BackendNotFound, reason.clone()))
            }
            RelayError::ConnectFailed(reason) => Some((FailureKind::ConnectFailed, reason.clone())),
            RelayError::ReconnectFailed(reason) => {
                Some((FailureKind::ReconnectFailed, reason.clone()))
            }
            RelayError::ProtocolViolation(reason) | RelayError::MalformedMessage(reason) => {
                Some((FailureKind::Protocol, reason.clone()))
            }
            _ => None,
        };
        if let Some((kind, reason)) = failure {
            let mut session = self.session.lock().unwrap();
            if matches!(session.status, StreamStatus::Open) {
                warn!("Stream {}: unrecoverable failure: {}", self.stream_id, err);
                session.status = StreamStatus::Failed { kind, reason };
                session.transport = None;
            }
        }
        err
    }
}

fn close_detail(code: CloseCode, reason: &str) -> String {
    if reason.is_empty() {
        format!("{:?}", code)
    } else {
        format!("{:?}: {}", code, reason)
    }
}

fn probe_close_result(code: CloseCode, reason: &str) -> Result<(), RelayError> {
    let detail = close_detail(code, reason);
    match code.classify(ClosePhase::Connecting) {
        CloseClass::Graceful => Ok(()),
        CloseClass::Denied => Err(RelayError::Denied(detail)),
        CloseClass::BackendNotFound => Err(RelayError::BackendNotFound(detail)),
        _ => Err(RelayError::ConnectFailed(detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn ack_prefix_trims_whole_chunks() {
        let mut queue = PendingQueue::default();
        queue.push(chunk("hello"));
        queue.push(chunk("world"));

        queue.trim_to(5);
        assert_eq!(queue.snapshot(), vec![chunk("world")]);
        assert_eq!(queue.head_offset, 5);

        queue.trim_to(10);
        assert!(queue.snapshot().is_empty());
        assert_eq!(queue.head_offset, 10);
    }

    #[test]
    fn ack_mid_chunk_splits_the_head() {
        let mut queue = PendingQueue::default();
        queue.push(chunk("abcdef"));
        queue.push(chunk("gh"));

        queue.trim_to(2);
        assert_eq!(queue.snapshot(), vec![chunk("cdef"), chunk("gh")]);
        assert_eq!(queue.head_offset, 2);
    }

    #[test]
    fn ack_sequence_keeps_exact_unacked_suffix() {
        let writes = ["ab", "cde", "f", "ghij"];
        let full: String = writes.concat();

        for watermark in 0..=full.len() as u64 {
            let mut queue = PendingQueue::default();
            for w in &writes {
                queue.push(chunk(w));
            }
            queue.trim_to(watermark);

            let remaining: Vec<u8> = queue
                .snapshot()
                .iter()
                .flat_map(|c| c.iter().copied())
                .collect();
            assert_eq!(remaining, full.as_bytes()[watermark as usize..].to_vec());
            assert_eq!(queue.head_offset, watermark);
        }
    }

    #[test]
    fn acks_apply_in_order_and_are_idempotent() {
        let mut queue = PendingQueue::default();
        queue.push(chunk("abcd"));
        queue.push(chunk("efgh"));

        queue.trim_to(2);
        queue.trim_to(7);
        queue.trim_to(7);
        assert_eq!(queue.snapshot(), vec![chunk("h")]);
        assert_eq!(queue.head_offset, 7);
    }

    #[test]
    fn zero_ack_after_writes_is_a_violation() {
        let mut session = Session::default();
        session.bytes_written = 4;
        session.pending.push(chunk("abcd"));

        assert!(matches!(
            session.apply_ack(0, false),
            Err(RelayError::ProtocolViolation(_))
        ));
        // A reconnect may legitimately report zero received bytes.
        assert!(session.apply_ack(0, true).is_ok());
    }

    #[test]
    fn ack_outside_written_window_is_a_violation() {
        let mut session = Session::default();
        session.bytes_written = 4;
        session.pending.push(chunk("abcd"));

        assert!(matches!(
            session.apply_ack(5, false),
            Err(RelayError::ProtocolViolation(_))
        ));

        session.apply_ack(3, false).unwrap();
        assert!(matches!(
            session.apply_ack(2, false),
            Err(RelayError::ProtocolViolation(_))
        ));
        assert_eq!(session.bytes_acked, 3);
    }
}
