use crate::error::{Error, Result};

/// CQL native protocol versions supported by this driver.
///
/// v1/v2 are long dead; the driver speaks v3, v4 and v5 (v5 optionally with
/// the BETA flag for servers that only advertise it as beta).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    pub const fn request_byte(self) -> u8 {
        self as u8
    }

    pub const fn response_byte(self) -> u8 {
        self as u8 | 0x80
    }

    /// The next lower version to try during negotiation.
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::V5 => Some(Self::V4),
            Self::V4 => Some(Self::V3),
            Self::V3 => None,
        }
    }

    pub fn from_response_byte(byte: u8) -> Result<Self> {
        match byte & 0x7F {
            3 => Ok(Self::V3),
            4 => Ok(Self::V4),
            5 => Ok(Self::V5),
            v => Err(Error::UnableToDetermineProtocol(v)),
        }
    }

    /// v5 moved query-parameter flags from `[byte]` to `[int]`.
    pub const fn uses_int_query_flags(self) -> bool {
        matches!(self, Self::V5)
    }
}

/// Frame opcodes, shared between requests and responses.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x00 => Self::Error,
            0x01 => Self::Startup,
            0x02 => Self::Ready,
            0x03 => Self::Authenticate,
            0x05 => Self::Options,
            0x06 => Self::Supported,
            0x07 => Self::Query,
            0x08 => Self::Result,
            0x09 => Self::Prepare,
            0x0A => Self::Execute,
            0x0B => Self::Register,
            0x0C => Self::Event,
            0x0D => Self::Batch,
            0x0E => Self::AuthChallenge,
            0x0F => Self::AuthResponse,
            0x10 => Self::AuthSuccess,
            _ => return Err(Error::InvalidFrame("unknown opcode")),
        })
    }
}

bitflags::bitflags! {
    /// Frame header flags (byte 1 of the header).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Body is compressed with the algorithm negotiated in STARTUP
        const COMPRESSION = 0x01;
        /// Client requests tracing / server included a tracing id
        const TRACING = 0x02;
        /// Body is prefixed with a bytes-map custom payload (v4+)
        const CUSTOM_PAYLOAD = 0x04;
        /// Body is prefixed with a string-list of warnings (v4+)
        const WARNING = 0x08;
        /// Frame uses a beta version of the protocol
        const BETA = 0x10;
    }
}

bitflags::bitflags! {
    /// QUERY/EXECUTE parameter flags. Written as `[byte]` on v3/v4 and
    /// `[int]` on v5.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// Values follow the consistency
        const VALUES = 0x01;
        /// Skip the result metadata in the ROWS response
        const SKIP_METADATA = 0x02;
        /// A page-size int follows
        const PAGE_SIZE = 0x04;
        /// A paging-state blob follows
        const WITH_PAGING_STATE = 0x08;
        /// A serial-consistency short follows
        const WITH_SERIAL_CONSISTENCY = 0x10;
        /// A default-timestamp long follows
        const WITH_DEFAULT_TIMESTAMP = 0x20;
        /// Values are preceded by their names
        const WITH_NAMES = 0x40;
        /// A keyspace string follows (v5)
        const WITH_KEYSPACE = 0x80;
    }
}

bitflags::bitflags! {
    /// BATCH parameter flags. Bit values are shared with [`QueryFlags`];
    /// only the serial-consistency/timestamp/keyspace bits are meaningful.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BatchFlags: u32 {
        const WITH_SERIAL_CONSISTENCY = 0x10;
        const WITH_DEFAULT_TIMESTAMP = 0x20;
        const WITH_NAMES = 0x40;
        const WITH_KEYSPACE = 0x80;
    }
}

bitflags::bitflags! {
    /// RESULT(rows) metadata flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResultMetadataFlags: u32 {
        /// One (keyspace, table) pair applies to every column
        const GLOBAL_TABLES_SPEC = 0x01;
        /// A paging state follows; absent means the last page
        const HAS_MORE_PAGES = 0x02;
        /// Column specs were skipped (client asked SKIP_METADATA)
        const NO_METADATA = 0x04;
        /// A new result-metadata id follows (v5)
        const METADATA_CHANGED = 0x08;
    }
}

/// RESULT body kinds.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Void = 0x0001,
    Rows = 0x0002,
    SetKeyspace = 0x0003,
    Prepared = 0x0004,
    SchemaChange = 0x0005,
}

impl ResultKind {
    pub fn from_i32(kind: i32) -> Result<Self> {
        Ok(match kind {
            0x0001 => Self::Void,
            0x0002 => Self::Rows,
            0x0003 => Self::SetKeyspace,
            0x0004 => Self::Prepared,
            0x0005 => Self::SchemaChange,
            _ => return Err(Error::InvalidFrame("unknown result kind")),
        })
    }
}

/// Consistency levels, wire values per the native protocol.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl Consistency {
    pub fn from_u16(value: u16) -> Result<Self> {
        Ok(match value {
            0x0000 => Self::Any,
            0x0001 => Self::One,
            0x0002 => Self::Two,
            0x0003 => Self::Three,
            0x0004 => Self::Quorum,
            0x0005 => Self::All,
            0x0006 => Self::LocalQuorum,
            0x0007 => Self::EachQuorum,
            0x0008 => Self::Serial,
            0x0009 => Self::LocalSerial,
            0x000A => Self::LocalOne,
            _ => return Err(Error::InvalidFrame("unknown consistency")),
        })
    }

    /// `LOCAL_ONE`, `LOCAL_QUORUM` and `LOCAL_SERIAL` must never leave the
    /// local data center.
    pub const fn is_dc_local(self) -> bool {
        matches!(self, Self::LocalOne | Self::LocalQuorum | Self::LocalSerial)
    }
}

/// Server error codes (ERROR body, first `[int]`). Codes this driver does
/// not know yet land in `Other` so a newer server never fails a decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ServerError,
    ProtocolError,
    BadCredentials,
    Unavailable,
    Overloaded,
    IsBootstrapping,
    TruncateError,
    WriteTimeout,
    ReadTimeout,
    ReadFailure,
    FunctionFailure,
    WriteFailure,
    SyntaxError,
    Unauthorized,
    InvalidQuery,
    ConfigError,
    AlreadyExists,
    Unprepared,
    Other(i32),
}

impl ErrorCode {
    /// Unknown codes map to `Other` with a warning; the message and any
    /// trailing body bytes still reach the caller.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0x0000 => Self::ServerError,
            0x000A => Self::ProtocolError,
            0x0100 => Self::BadCredentials,
            0x1000 => Self::Unavailable,
            0x1001 => Self::Overloaded,
            0x1002 => Self::IsBootstrapping,
            0x1003 => Self::TruncateError,
            0x1100 => Self::WriteTimeout,
            0x1200 => Self::ReadTimeout,
            0x1300 => Self::ReadFailure,
            0x1400 => Self::FunctionFailure,
            0x1500 => Self::WriteFailure,
            0x2000 => Self::SyntaxError,
            0x2100 => Self::Unauthorized,
            0x2200 => Self::InvalidQuery,
            0x2300 => Self::ConfigError,
            0x2400 => Self::AlreadyExists,
            0x2500 => Self::Unprepared,
            other => {
                tracing::warn!(code = other, "unknown server error code");
                Self::Other(other)
            }
        }
    }
}

/// The write operation a WriteTimeout/WriteFailure error was about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Unknown,
}

impl WriteType {
    /// Unknown strings map to `Unknown` with a warning, so a new server-side
    /// write type never fails the whole response decode.
    pub fn parse(s: &str) -> Self {
        match s {
            "SIMPLE" => Self::Simple,
            "BATCH" => Self::Batch,
            "UNLOGGED_BATCH" => Self::UnloggedBatch,
            "COUNTER" => Self::Counter,
            "BATCH_LOG" => Self::BatchLog,
            "CAS" => Self::Cas,
            "VIEW" => Self::View,
            "CDC" => Self::Cdc,
            other => {
                tracing::warn!(write_type = other, "unknown write type");
                Self::Unknown
            }
        }
    }

    /// Write types the default retry policy considers safe to retry.
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Simple | Self::Batch | Self::BatchLog | Self::UnloggedBatch
        )
    }
}

/// BATCH kinds (first byte of the BATCH body).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchType {
    Logged = 0x00,
    Unlogged = 0x01,
    Counter = 0x02,
}

/// Server event classes a connection can REGISTER for.
pub const EVENT_TOPOLOGY_CHANGE: &str = "TOPOLOGY_CHANGE";
pub const EVENT_STATUS_CHANGE: &str = "STATUS_CHANGE";
pub const EVENT_SCHEMA_CHANGE: &str = "SCHEMA_CHANGE";

/// STARTUP option keys.
pub const STARTUP_CQL_VERSION_KEY: &str = "CQL_VERSION";
pub const STARTUP_CQL_VERSION: &str = "3.0.0";

/// Streams per connection (v3+ streams are signed 16-bit; negative ids are
/// reserved for server-initiated frames).
pub const MAX_STREAMS: usize = 32_768;
