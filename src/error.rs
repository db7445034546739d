use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TamperError {
    /* COMMAND ERROR */
    #[error("privileged access was denied for command [{cmd}]")]
    PermissionDenied { cmd: String },
    #[error("privileged command [{cmd}] did not finish within {timeout_ms}ms")]
    CommandTimeout { cmd: String, timeout_ms: u128 },
    #[error("privileged command [{cmd}] exited with status {status}")]
    CommandFailed { cmd: String, status: i32 },
    #[error("privileged command [{cmd}] was killed by a signal")]
    CommandKilled { cmd: String },

    /* CHANNEL ERROR */
    #[error("helper did not connect back to {addr} within {timeout_ms}ms")]
    HelperAcceptTimeout { addr: String, timeout_ms: u128 },
    #[error("helper exited with status {status} before connecting back")]
    HelperExited { status: i32 },
    #[error("probe channel is closed")]
    ChannelClosed,
    #[error("no answer to request {seq} within {timeout_ms}ms")]
    ProbeTimeout { seq: u32, timeout_ms: u128 },
    #[error("malformed helper frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("frame of {len} bytes exceeds the {max} bytes limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("source {src} and destination {dst} are not of the same address family")]
    AddressFamilyMismatch { src: IpAddr, dst: IpAddr },

    /* INSTALL ERROR */
    #[error("helper binary {path} is missing and no bundle is configured")]
    HelperMissing { path: String },
    #[error("no helper payload for architecture {arch}")]
    UnsupportedArch { arch: String },
    #[error("helper payload [{entry}] not found in bundle")]
    PayloadNotFound { entry: String },
    #[error("installed helper crc32 {actual:08x} does not match bundle {expected:08x}")]
    PayloadChecksumMismatch { expected: u32, actual: u32 },

    /* NETWORK ERROR */
    #[error("can not resolve host [{host}]")]
    UnknownHost { host: String },

    /* CONFIG ERROR */
    #[error("invalid config field {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    /* OTHER ERROR */
    #[error("std error")]
    IOError(#[from] std::io::Error),
    #[error("serde json error")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("zip error")]
    ZipError(#[from] zip::result::ZipError),
    #[error("address parse error")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("init the logger error: {e}")]
    InitLoggerError { e: String },
    #[error("try lock {var_name} failed: {e}")]
    LockFailed { var_name: String, e: String },
    #[error("the run worker exited without a report")]
    WorkerLost,
}
