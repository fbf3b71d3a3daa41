// relay-tunnel: reliable duplex byte streams over disposable relay
// transports, plus a local TCP listener front end for plain TCP clients.

pub mod buffer_pool;
pub mod close_code;
pub mod error;
pub mod listener;
pub mod logger;
pub mod models;
pub mod protocol;
pub mod runtime;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod tests;

pub use close_code::{CloseClass, CloseCode, ClosePhase};
pub use error::RelayError;
pub use listener::{ListenerHandle, RelayListener};
pub use models::{AdmissionPolicy, AllowAll, ConnectionStats, RelayTimeouts, TunnelStats};
pub use protocol::{
    RelayMessage, Tag, MAX_MESSAGE_SIZE, MAX_PAYLOAD_LEN, MAX_WRITE_SIZE, MIN_READ_SIZE,
};
pub use stream::RelayStream;
pub use transport::{RelayTarget, RelayTransport, TransportError};
