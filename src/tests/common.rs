//! Common test utilities: scripted relay transports and targets
#![cfg(test)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::close_code::CloseCode;
use crate::models::RelayTimeouts;
use crate::protocol::{self, RelayMessage};
use crate::stream::RelayStream;
use crate::transport::{RelayTarget, RelayTransport, TransportError};

/// One step of a scripted relay connection, consumed per transport read.
pub enum ScriptEvent {
    /// Deliver this message to the next read.
    Msg(RelayMessage),
    /// Deliver several messages in a single read, to exercise over-reads.
    Batch(Vec<RelayMessage>),
    /// Deliver these bytes exactly as given, e.g. a torn frame.
    Raw(Bytes),
    /// The relay closes the connection with a close code.
    CloseWith(CloseCode),
    /// The connection dies without any close handshake.
    Abrupt,
}

enum DeadEnd {
    Closed(CloseCode),
    Abrupt,
}

/// A relay connection driven by a script. Reads pop script events; when the
/// script runs dry the read parks until `push_event`, `remote_close` or a
/// local close wakes it. Writes are decoded and recorded for assertions.
pub struct MockTransport {
    script: Mutex<VecDeque<ScriptEvent>>,
    carry: Mutex<BytesMut>,
    writes: Mutex<Vec<RelayMessage>>,
    fail_write: Mutex<Option<(usize, CloseCode)>>,
    reject_write: Mutex<Option<CloseCode>>,
    died: Mutex<Option<DeadEnd>>,
    locally_closed: AtomicBool,
    read_half_dead: AtomicBool,
    write_gate: AtomicBool,
    notify: Notify,
}

impl MockTransport {
    pub fn scripted(events: Vec<ScriptEvent>) -> Arc<Self> {
        Arc::new(MockTransport {
            script: Mutex::new(events.into_iter().collect()),
            carry: Mutex::new(BytesMut::new()),
            writes: Mutex::new(Vec::new()),
            fail_write: Mutex::new(None),
            reject_write: Mutex::new(None),
            died: Mutex::new(None),
            locally_closed: AtomicBool::new(false),
            read_half_dead: AtomicBool::new(false),
            write_gate: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// The first `successes` writes succeed; the next one fails with `code`
    /// and the connection stays dead.
    pub fn fail_write_after(&self, successes: usize, code: CloseCode) {
        *self.fail_write.lock().unwrap() = Some((successes, code));
    }

    /// Fails the next write with `code` without killing the connection:
    /// later reads and writes still follow the script.
    pub fn reject_next_write(&self, code: CloseCode) {
        *self.reject_write.lock().unwrap() = Some(code);
    }

    /// Reads observe EOF from now on while writes keep succeeding, like a
    /// socket whose receive half closed first.
    pub fn kill_read_half(&self) {
        self.read_half_dead.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Parks writes until `release_writes`, to hold one in flight.
    pub fn hold_writes(&self) {
        self.write_gate.store(true, Ordering::SeqCst);
    }

    pub fn release_writes(&self) {
        self.write_gate.store(false, Ordering::SeqCst);
    }

    pub fn push_event(&self, event: ScriptEvent) {
        self.script.lock().unwrap().push_back(event);
        self.notify.notify_one();
    }

    pub fn remote_close(&self, code: CloseCode) {
        *self.died.lock().unwrap() = Some(DeadEnd::Closed(code));
        self.notify.notify_one();
    }

    /// Messages the client wrote to this connection, in order.
    pub fn sent(&self) -> Vec<RelayMessage> {
        self.writes.lock().unwrap().clone()
    }

    /// Payloads of the Data messages the client wrote, in order.
    pub fn sent_data_payloads(&self) -> Vec<Bytes> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                RelayMessage::Data { payload } => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn is_locally_closed(&self) -> bool {
        self.locally_closed.load(Ordering::SeqCst)
    }

    fn try_read(&self, buf: &mut [u8]) -> Option<Result<usize, TransportError>> {
        if self.locally_closed.load(Ordering::SeqCst) {
            return Some(Err(TransportError::LocallyClosed));
        }
        {
            let mut carry = self.carry.lock().unwrap();
            if !carry.is_empty() {
                let n = carry.len().min(buf.len());
                buf[..n].copy_from_slice(&carry[..n]);
                carry.advance(n);
                return Some(Ok(n));
            }
        }
        if self.read_half_dead.load(Ordering::SeqCst) {
            return Some(Ok(0));
        }
        if let Some(dead) = &*self.died.lock().unwrap() {
            return Some(match dead {
                DeadEnd::Closed(code) => Err(TransportError::closed(*code)),
                DeadEnd::Abrupt => Ok(0),
            });
        }
        let event = self.script.lock().unwrap().pop_front();
        match event {
            Some(ScriptEvent::Msg(msg)) => Some(Ok(self.deliver(&[msg], buf))),
            Some(ScriptEvent::Batch(msgs)) => Some(Ok(self.deliver(&msgs, buf))),
            Some(ScriptEvent::Raw(bytes)) => {
                Some(Ok(self.deliver_bytes(BytesMut::from(&bytes[..]), buf)))
            }
            Some(ScriptEvent::CloseWith(code)) => {
                *self.died.lock().unwrap() = Some(DeadEnd::Closed(code));
                Some(Err(TransportError::closed(code)))
            }
            Some(ScriptEvent::Abrupt) => {
                *self.died.lock().unwrap() = Some(DeadEnd::Abrupt);
                Some(Ok(0))
            }
            None => None,
        }
    }

    fn deliver(&self, msgs: &[RelayMessage], buf: &mut [u8]) -> usize {
        let mut bytes = BytesMut::new();
        for msg in msgs {
            protocol::encode_into(msg, &mut bytes).unwrap();
        }
        self.deliver_bytes(bytes, buf)
    }

    fn deliver_bytes(&self, mut bytes: BytesMut, buf: &mut [u8]) -> usize {
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        if n < bytes.len() {
            bytes.advance(n);
            *self.carry.lock().unwrap() = bytes;
        }
        n
    }
}

impl RelayTransport for MockTransport {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, TransportError>> {
        Box::pin(async move {
            loop {
                if let Some(result) = self.try_read(buf) {
                    return result;
                }
                self.notify.notified().await;
            }
        })
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            while self.write_gate.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if self.locally_closed.load(Ordering::SeqCst) {
                return Err(TransportError::LocallyClosed);
            }
            if let Some(dead) = &*self.died.lock().unwrap() {
                return Err(match dead {
                    DeadEnd::Closed(code) => TransportError::closed(*code),
                    DeadEnd::Abrupt => {
                        TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe))
                    }
                });
            }
            if let Some(code) = self.reject_write.lock().unwrap().take() {
                return Err(TransportError::closed(code));
            }
            {
                let mut fail = self.fail_write.lock().unwrap();
                if let Some((remaining, code)) = fail.as_mut() {
                    if *remaining == 0 {
                        let code = *code;
                        *fail = None;
                        *self.died.lock().unwrap() = Some(DeadEnd::Closed(code));
                        self.notify.notify_one();
                        return Err(TransportError::closed(code));
                    }
                    *remaining -= 1;
                }
            }
            let (msg, _) = protocol::decode(buf).expect("client sent a malformed frame");
            self.writes.lock().unwrap().push(msg);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.locally_closed.store(true, Ordering::SeqCst);
            self.notify.notify_one();
        })
    }
}

/// What a scripted dial attempt resolves to.
pub enum Dial {
    Ok(Arc<MockTransport>),
    Closed(CloseCode),
    Refused,
    /// Never resolves; for timeout tests.
    Pending,
}

/// A relay target whose connect/reconnect calls pop scripted dial results
/// and record call counts and arguments.
#[derive(Default)]
pub struct MockTarget {
    connects: Mutex<VecDeque<Dial>>,
    reconnects: Mutex<VecDeque<Dial>>,
    connect_calls: AtomicUsize,
    reconnect_calls: AtomicUsize,
    reconnect_args: Mutex<Vec<(String, u64)>>,
}

impl MockTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTarget::default())
    }

    pub fn expect_connect(&self, dial: Dial) {
        self.connects.lock().unwrap().push_back(dial);
    }

    pub fn expect_reconnect(&self, dial: Dial) {
        self.reconnects.lock().unwrap().push_back(dial);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    /// `(sid, last_consumed)` pairs passed to reconnect, in order.
    pub fn reconnect_args(&self) -> Vec<(String, u64)> {
        self.reconnect_args.lock().unwrap().clone()
    }
}

async fn resolve_dial(dial: Option<Dial>, op: &str) -> Result<Box<dyn RelayTransport>, TransportError> {
    match dial {
        Some(Dial::Ok(transport)) => Ok(Box::new(transport) as Box<dyn RelayTransport>),
        Some(Dial::Closed(code)) => Err(TransportError::closed(code)),
        Some(Dial::Refused) => Err(TransportError::Io(io::Error::from(
            io::ErrorKind::ConnectionRefused,
        ))),
        Some(Dial::Pending) => {
            futures::future::pending::<()>().await;
            unreachable!()
        }
        None => panic!("unexpected {} call with no scripted dial", op),
    }
}

impl RelayTarget for MockTarget {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn RelayTransport>, TransportError>> {
        Box::pin(async move {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let dial = self.connects.lock().unwrap().pop_front();
            resolve_dial(dial, "connect").await
        })
    }

    fn reconnect<'a>(
        &'a self,
        sid: &'a str,
        last_consumed: u64,
    ) -> BoxFuture<'a, Result<Box<dyn RelayTransport>, TransportError>> {
        Box::pin(async move {
            self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
            self.reconnect_args
                .lock()
                .unwrap()
                .push((sid.to_string(), last_consumed));
            let dial = self.reconnects.lock().unwrap().pop_front();
            resolve_dial(dial, "reconnect").await
        })
    }
}

// Message shorthands for scripts and assertions.

pub fn connect_success(sid: &str) -> RelayMessage {
    RelayMessage::ConnectSuccess {
        sid: sid.to_string(),
    }
}

pub fn reconnect_ack(ack: u64) -> RelayMessage {
    RelayMessage::ReconnectSuccessAck { ack }
}

pub fn ack(ack: u64) -> RelayMessage {
    RelayMessage::Ack { ack }
}

pub fn data(payload: &[u8]) -> RelayMessage {
    RelayMessage::Data {
        payload: Bytes::copy_from_slice(payload),
    }
}

pub fn long_close(code: CloseCode, reason: &str) -> RelayMessage {
    RelayMessage::Close {
        code,
        reason: reason.to_string(),
    }
}

/// Timeouts generous enough that happy-path tests never trip them.
pub fn test_timeouts() -> RelayTimeouts {
    RelayTimeouts {
        connect: Duration::from_secs(5),
        reconnect: Duration::from_secs(5),
        close: Duration::from_secs(1),
    }
}

pub fn stream_for(target: &Arc<MockTarget>) -> RelayStream<Arc<MockTarget>> {
    RelayStream::with_timeouts(target.clone(), test_timeouts())
}

pub fn read_buf() -> Vec<u8> {
    vec![0u8; crate::protocol::MIN_READ_SIZE]
}

/// Polls `cond` until it holds or `deadline` passes.
pub async fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
