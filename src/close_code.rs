// Close-code registry and the retry classification that drives recovery.

/// Close codes observed on relay transports, either inside a LongClose
/// message or as the transport-level close reason.
///
/// WebSocket-level codes keep their RFC 6455 values; relay application codes
/// live in the 4000 private-use range. Codes this build does not know decode
/// as `Other` and classify as recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    NormalClosure,
    EndpointUnavailable,
    ProtocolError,
    InvalidMessageType,
    ErrorUnknown,
    Normal,
    LookupFailed,
    LookupFailedReconnect,
    NotAuthorized,
    FailedToConnectToBackend,
    BadAck,
    InvalidTag,
    SidUnknown,
    SidInUse,
    DestinationReadFailed,
    DestinationWriteFailed,
    InvalidWebSocketOpcode,
    ReauthenticationRequired,
    Other(u32),
}

/// Session phase a close code was observed in. Classification of
/// `FailedToConnectToBackend` depends on whether a SID was ever established
/// for the logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePhase {
    /// No session id has ever been established.
    Connecting,
    /// A session id exists (or existed) on the relay side.
    Active,
}

/// What the stream does about a close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Orderly end of stream. Reads return EOF, never reconnect.
    Graceful,
    /// Authorization rejected. Terminal, never retried.
    Denied,
    /// The relay could not locate the backend. Terminal.
    BackendNotFound,
    /// Establishing a session failed before one ever existed. Terminal.
    ConnectFailed,
    /// Re-attaching to an existing session failed. Terminal.
    ReconnectFailed,
    /// Transient loss. Recover via connect/reconnect and resend.
    Recoverable,
}

impl CloseCode {
    /// Maps a raw wire code to a close code. Total; unrecognized values
    /// become `Other`.
    pub fn from_code(code: u32) -> CloseCode {
        match code {
            1000 => CloseCode::NormalClosure,
            1001 => CloseCode::EndpointUnavailable,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::InvalidMessageType,
            4000 => CloseCode::ErrorUnknown,
            4001 => CloseCode::Normal,
            4002 => CloseCode::LookupFailed,
            4003 => CloseCode::LookupFailedReconnect,
            4004 => CloseCode::NotAuthorized,
            4005 => CloseCode::FailedToConnectToBackend,
            4006 => CloseCode::BadAck,
            4007 => CloseCode::InvalidTag,
            4008 => CloseCode::SidUnknown,
            4009 => CloseCode::SidInUse,
            4010 => CloseCode::DestinationReadFailed,
            4011 => CloseCode::DestinationWriteFailed,
            4012 => CloseCode::InvalidWebSocketOpcode,
            4013 => CloseCode::ReauthenticationRequired,
            other => CloseCode::Other(other),
        }
    }

    /// The wire value of this code.
    pub fn code(self) -> u32 {
        match self {
            CloseCode::NormalClosure => 1000,
            CloseCode::EndpointUnavailable => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::InvalidMessageType => 1003,
            CloseCode::ErrorUnknown => 4000,
            CloseCode::Normal => 4001,
            CloseCode::LookupFailed => 4002,
            CloseCode::LookupFailedReconnect => 4003,
            CloseCode::NotAuthorized => 4004,
            CloseCode::FailedToConnectToBackend => 4005,
            CloseCode::BadAck => 4006,
            CloseCode::InvalidTag => 4007,
            CloseCode::SidUnknown => 4008,
            CloseCode::SidInUse => 4009,
            CloseCode::DestinationReadFailed => 4010,
            CloseCode::DestinationWriteFailed => 4011,
            CloseCode::InvalidWebSocketOpcode => 4012,
            CloseCode::ReauthenticationRequired => 4013,
            CloseCode::Other(code) => code,
        }
    }

    /// Classifies the code for the given session phase. Computed once per
    /// close event; call sites branch on the class only.
    pub fn classify(self, phase: ClosePhase) -> CloseClass {
        match self {
            CloseCode::NormalClosure
            | CloseCode::Normal
            | CloseCode::DestinationReadFailed
            | CloseCode::DestinationWriteFailed => CloseClass::Graceful,
            CloseCode::NotAuthorized => CloseClass::Denied,
            CloseCode::LookupFailed | CloseCode::LookupFailedReconnect => {
                CloseClass::BackendNotFound
            }
            CloseCode::FailedToConnectToBackend => match phase {
                ClosePhase::Connecting => CloseClass::ConnectFailed,
                ClosePhase::Active => CloseClass::Recoverable,
            },
            CloseCode::SidUnknown | CloseCode::SidInUse => CloseClass::ReconnectFailed,
            CloseCode::EndpointUnavailable
            | CloseCode::ProtocolError
            | CloseCode::InvalidMessageType
            | CloseCode::ErrorUnknown
            | CloseCode::BadAck
            | CloseCode::InvalidTag
            | CloseCode::InvalidWebSocketOpcode
            | CloseCode::ReauthenticationRequired
            | CloseCode::Other(_) => CloseClass::Recoverable,
        }
    }
}
