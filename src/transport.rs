// Transport abstraction - disposable duplex connections dialed by a target.

use crate::close_code::CloseCode;
use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Failure conditions a transport keeps distinguishable for the stream's
/// recovery policy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote end closed the connection and supplied a close code.
    #[error("Closed by remote: {code:?} ({reason})")]
    Closed { code: CloseCode, reason: String },

    /// The local side closed the connection.
    #[error("Closed locally")]
    LocallyClosed,

    /// The connection died without a close handshake.
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Remote close without reason text.
    pub fn closed(code: CloseCode) -> Self {
        TransportError::Closed {
            code,
            reason: String::new(),
        }
    }
}

/// One disposable duplex connection to the relay.
///
/// A single in-flight `read` may run concurrently with a single in-flight
/// `write`. Reads may return any number of bytes; message boundaries need
/// not be preserved. A read returning 0 means the connection ended without a
/// close handshake. Writes deliver the whole buffer or fail. `close` is
/// idempotent and wakes parked reads with `LocallyClosed`. Dropping the
/// future returned by `read` or `write` abandons that attempt.
pub trait RelayTransport: Send + Sync {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, TransportError>>;

    fn write<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Produces transport connections for one logical relay session.
///
/// `connect` establishes a brand-new session; `reconnect` re-attaches to an
/// existing one, reporting how many relay bytes the client has consumed so
/// the relay can resume its send stream at the right offset.
pub trait RelayTarget: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn RelayTransport>, TransportError>>;

    fn reconnect<'a>(
        &'a self,
        sid: &'a str,
        last_consumed: u64,
    ) -> BoxFuture<'a, Result<Box<dyn RelayTransport>, TransportError>>;
}

impl<T: RelayTransport + ?Sized> RelayTransport for Arc<T> {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, TransportError>> {
        (**self).read(buf)
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        (**self).write(buf)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        (**self).close()
    }
}

impl<T: RelayTarget + ?Sized> RelayTarget for Arc<T> {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn RelayTransport>, TransportError>> {
        (**self).connect()
    }

    fn reconnect<'a>(
        &'a self,
        sid: &'a str,
        last_consumed: u64,
    ) -> BoxFuture<'a, Result<Box<dyn RelayTransport>, TransportError>> {
        (**self).reconnect(sid, last_consumed)
    }
}
