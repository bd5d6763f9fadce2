use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ZkPath;

/// Result codes returned in ZooKeeper reply headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SystemError,
    RuntimeInconsistency,
    DataInconsistency,
    ConnectionLoss,
    MarshallingError,
    Unimplemented,
    OperationTimeout,
    BadArguments,
    NoNode,
    NoAuth,
    BadVersion,
    NoChildrenForEphemerals,
    NodeExists,
    NotEmpty,
    SessionExpired,
    InvalidCallback,
    InvalidAcl,
    AuthFailed,
    SessionMoved,
    NotReadOnly,
    Unknown(i32),
}

impl ErrorCode {
    /// `None` for the success code 0.
    pub fn from_code(code: i32) -> Option<Self> {
        let mapped = match code {
            0 => return None,
            -1 => Self::SystemError,
            -2 => Self::RuntimeInconsistency,
            -3 => Self::DataInconsistency,
            -4 => Self::ConnectionLoss,
            -5 => Self::MarshallingError,
            -6 => Self::Unimplemented,
            -7 => Self::OperationTimeout,
            -8 => Self::BadArguments,
            -101 => Self::NoNode,
            -102 => Self::NoAuth,
            -103 => Self::BadVersion,
            -108 => Self::NoChildrenForEphemerals,
            -110 => Self::NodeExists,
            -111 => Self::NotEmpty,
            -112 => Self::SessionExpired,
            -113 => Self::InvalidCallback,
            -114 => Self::InvalidAcl,
            -115 => Self::AuthFailed,
            -118 => Self::SessionMoved,
            -119 => Self::NotReadOnly,
            other => Self::Unknown(other),
        };
        Some(mapped)
    }

    pub fn code(self) -> i32 {
        match self {
            Self::SystemError => -1,
            Self::RuntimeInconsistency => -2,
            Self::DataInconsistency => -3,
            Self::ConnectionLoss => -4,
            Self::MarshallingError => -5,
            Self::Unimplemented => -6,
            Self::OperationTimeout => -7,
            Self::BadArguments => -8,
            Self::NoNode => -101,
            Self::NoAuth => -102,
            Self::BadVersion => -103,
            Self::NoChildrenForEphemerals => -108,
            Self::NodeExists => -110,
            Self::NotEmpty => -111,
            Self::SessionExpired => -112,
            Self::InvalidCallback => -113,
            Self::InvalidAcl => -114,
            Self::AuthFailed => -115,
            Self::SessionMoved => -118,
            Self::NotReadOnly => -119,
            Self::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path '{0}' is not absolute")]
    NotAbsolute(String),
    #[error("path '{0}' ends with '/'")]
    TrailingSlash(String),
    #[error("path '{0}' contains an empty segment")]
    EmptySegment(String),
    #[error("path '{0}' contains a relative segment")]
    RelativeSegment(String),
    #[error("path '{0}' contains a NUL character")]
    NulCharacter(String),
    #[error("'{0}' is not a valid node name")]
    InvalidSegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AclParseError {
    #[error("ACL '{0}' is not in scheme:id:perms form")]
    Malformed(String),
    #[error("unknown ACL permission '{0}'")]
    UnknownPermission(char),
}

/// Failures while encoding or decoding wire frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("frame length {0} exceeds the client limit")]
    FrameTooLarge(usize),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("unexpected null field '{0}'")]
    UnexpectedNull(&'static str),
    #[error("unknown op code {0}")]
    UnknownOpCode(i32),
}

/// Transport-level failure of a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("server replied with {0:?}")]
    Code(ErrorCode),
    #[error("connection to the server was lost")]
    ConnectionLoss,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("no session established within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("unable to reach {hosts}: {reason}")]
    Unreachable { hosts: String, reason: String },
    #[error("authentication failed for {hosts}")]
    AuthFailed { hosts: String },
    #[error("server at {host} rejected the session")]
    SessionRejected { host: String },
    #[error("invalid connection string '{raw}': {reason}")]
    InvalidConnectString { raw: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseError {
    #[error("session is already closed")]
    AlreadyClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node {path} does not exist")]
    NoSuchNode { path: ZkPath },
    #[error("node {path} already exists")]
    NodeExists { path: ZkPath },
    #[error("node {path} has children")]
    NotEmpty { path: ZkPath },
    #[error(
        "removal of {path} stopped at {failed} after deleting {}: {source}",
        .last_deleted.as_ref().map(ZkPath::as_str).unwrap_or("nothing")
    )]
    PartialDeleteFailure {
        path: ZkPath,
        last_deleted: Option<ZkPath>,
        failed: ZkPath,
        source: Box<NodeError>,
    },
    #[error("session is not connected")]
    SessionExpired,
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("not authorized to access {path}")]
    NoAuth { path: ZkPath },
    #[error("version mismatch on {path}")]
    BadVersion { path: ZkPath },
    #[error("invalid ACL for {path}")]
    InvalidAcl { path: ZkPath },
    #[error("request on {path} failed with {code:?}")]
    Server { path: ZkPath, code: ErrorCode },
}

impl NodeError {
    /// Maps a transport failure onto the node-level error for `path`.
    pub fn from_server(path: &ZkPath, err: ServerError) -> Self {
        let path = path.clone();
        match err {
            ServerError::Code(ErrorCode::NoNode) => Self::NoSuchNode { path },
            ServerError::Code(ErrorCode::NodeExists) => Self::NodeExists { path },
            ServerError::Code(ErrorCode::NotEmpty) => Self::NotEmpty { path },
            ServerError::Code(ErrorCode::NoAuth) => Self::NoAuth { path },
            ServerError::Code(ErrorCode::BadVersion) => Self::BadVersion { path },
            ServerError::Code(ErrorCode::InvalidAcl) => Self::InvalidAcl { path },
            ServerError::Code(ErrorCode::SessionExpired)
            | ServerError::Code(ErrorCode::ConnectionLoss)
            | ServerError::ConnectionLoss => Self::SessionExpired,
            ServerError::Code(code) => Self::Server { path, code },
            ServerError::Protocol(_) => Self::Server {
                path,
                code: ErrorCode::MarshallingError,
            },
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::NoSuchNode { .. })
    }
}

impl From<PathError> for NodeError {
    fn from(value: PathError) -> Self {
        let path = match &value {
            PathError::NotAbsolute(p)
            | PathError::TrailingSlash(p)
            | PathError::EmptySegment(p)
            | PathError::RelativeSegment(p)
            | PathError::NulCharacter(p)
            | PathError::InvalidSegment(p) => p.clone(),
        };
        Self::invalid_path(path, value)
    }
}
