//! ZooKeeper binary (Jute) encoding for the request/response subset this
//! client speaks. Every frame on the wire is a 4-byte big-endian length
//! followed by the payload.

use crate::{
    domain::{AclEntry, Perms, Stat},
    error::ProtocolError,
};

/// Largest frame accepted from a server (matches the server-side packet limit).
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub const NOTIFICATION_XID: i32 = -1;
pub const PING_XID: i32 = -2;
pub const AUTH_XID: i32 = -4;

const SESSION_PASSWORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Create,
    Delete,
    Exists,
    GetData,
    SetData,
    GetAcl,
    SetAcl,
    GetChildren2,
    Ping,
    CloseSession,
}

impl OpCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Create => 1,
            Self::Delete => 2,
            Self::Exists => 3,
            Self::GetData => 4,
            Self::SetData => 5,
            Self::GetAcl => 6,
            Self::SetAcl => 7,
            Self::GetChildren2 => 12,
            Self::Ping => 11,
            Self::CloseSession => -11,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Create),
            2 => Some(Self::Delete),
            3 => Some(Self::Exists),
            4 => Some(Self::GetData),
            5 => Some(Self::SetData),
            6 => Some(Self::GetAcl),
            7 => Some(Self::SetAcl),
            12 => Some(Self::GetChildren2),
            11 => Some(Self::Ping),
            -11 => Some(Self::CloseSession),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct JuteWriter {
    buf: Vec<u8>,
}

impl JuteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(u8::from(value));
        self
    }

    pub fn write_buffer(&mut self, value: Option<&[u8]>) -> &mut Self {
        match value {
            Some(bytes) => {
                self.write_i32(bytes.len() as i32);
                self.buf.extend_from_slice(bytes);
            }
            None => {
                self.write_i32(-1);
            }
        }
        self
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_buffer(Some(value.as_bytes()))
    }

    pub fn write_acl(&mut self, acl: &[AclEntry]) -> &mut Self {
        self.write_i32(acl.len() as i32);
        for entry in acl {
            self.write_i32(entry.perms.bits());
            self.write_str(&entry.scheme);
            self.write_str(&entry.id);
        }
        self
    }

    pub fn write_stat(&mut self, stat: &Stat) -> &mut Self {
        self.write_i64(stat.czxid)
            .write_i64(stat.mzxid)
            .write_i64(stat.ctime)
            .write_i64(stat.mtime)
            .write_i32(stat.version)
            .write_i32(stat.cversion)
            .write_i32(stat.aversion)
            .write_i64(stat.ephemeral_owner)
            .write_i32(stat.data_length)
            .write_i32(stat.num_children)
            .write_i64(stat.pzxid)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Payload prefixed with its length, ready for the socket.
    pub fn into_frame(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.buf.len() + 4);
        frame.extend_from_slice(&(self.buf.len() as i32).to_be_bytes());
        frame.extend_from_slice(&self.buf);
        frame
    }
}

pub struct JuteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JuteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_be_bytes(raw))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_buffer(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let len = self.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    pub fn read_str(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let bytes = self
            .read_buffer()?
            .ok_or(ProtocolError::UnexpectedNull(field))?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn read_acl(&mut self) -> Result<Vec<AclEntry>, ProtocolError> {
        let count = self.read_i32()?;
        if count < 0 {
            return Ok(Vec::new());
        }
        let mut acl = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let perms = Perms::from_bits_truncate(self.read_i32()?);
            let scheme = self.read_str("acl.scheme")?;
            let id = self.read_str("acl.id")?;
            acl.push(AclEntry { scheme, id, perms });
        }
        Ok(acl)
    }

    pub fn read_stat(&mut self) -> Result<Stat, ProtocolError> {
        Ok(Stat {
            czxid: self.read_i64()?,
            mzxid: self.read_i64()?,
            ctime: self.read_i64()?,
            mtime: self.read_i64()?,
            version: self.read_i32()?,
            cversion: self.read_i32()?,
            aversion: self.read_i32()?,
            ephemeral_owner: self.read_i64()?,
            data_length: self.read_i32()?,
            num_children: self.read_i32()?,
            pzxid: self.read_i64()?,
        })
    }
}

/// Validates a length prefix read from the socket.
pub fn check_frame_len(len: i32) -> Result<usize, ProtocolError> {
    if len < 0 {
        return Err(ProtocolError::NegativeLength(len));
    }
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
    pub read_only: bool,
}

impl ConnectRequest {
    pub fn new_session(timeout_ms: i32) -> Self {
        Self {
            protocol_version: 0,
            last_zxid_seen: 0,
            timeout_ms,
            session_id: 0,
            password: vec![0; SESSION_PASSWORD_LEN],
            read_only: false,
        }
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = JuteWriter::new();
        w.write_i32(self.protocol_version)
            .write_i64(self.last_zxid_seen)
            .write_i32(self.timeout_ms)
            .write_i64(self.session_id)
            .write_buffer(Some(self.password.as_slice()))
            .write_bool(self.read_only);
        w.into_frame()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = JuteReader::new(payload);
        Ok(Self {
            protocol_version: r.read_i32()?,
            last_zxid_seen: r.read_i64()?,
            timeout_ms: r.read_i32()?,
            session_id: r.read_i64()?,
            password: r.read_buffer()?.unwrap_or_default(),
            read_only: if r.remaining() > 0 { r.read_bool()? } else { false },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
    pub read_only: bool,
}

impl ConnectResponse {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = JuteReader::new(payload);
        Ok(Self {
            protocol_version: r.read_i32()?,
            timeout_ms: r.read_i32()?,
            session_id: r.read_i64()?,
            password: r.read_buffer()?.unwrap_or_default(),
            // pre-3.4 servers omit the read-only flag
            read_only: if r.remaining() > 0 { r.read_bool()? } else { false },
        })
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = JuteWriter::new();
        w.write_i32(self.protocol_version)
            .write_i32(self.timeout_ms)
            .write_i64(self.session_id)
            .write_buffer(Some(self.password.as_slice()))
            .write_bool(self.read_only);
        w.into_frame()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetChildren { path: String, watch: bool },
    GetData { path: String, watch: bool },
    Exists { path: String, watch: bool },
    SetData { path: String, data: Vec<u8>, version: i32 },
    GetAcl { path: String },
    SetAcl { path: String, acl: Vec<AclEntry>, version: i32 },
    Create { path: String, data: Vec<u8>, acl: Vec<AclEntry>, flags: i32 },
    Delete { path: String, version: i32 },
    Ping,
    CloseSession,
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Self::GetChildren { .. } => OpCode::GetChildren2,
            Self::GetData { .. } => OpCode::GetData,
            Self::Exists { .. } => OpCode::Exists,
            Self::SetData { .. } => OpCode::SetData,
            Self::GetAcl { .. } => OpCode::GetAcl,
            Self::SetAcl { .. } => OpCode::SetAcl,
            Self::Create { .. } => OpCode::Create,
            Self::Delete { .. } => OpCode::Delete,
            Self::Ping => OpCode::Ping,
            Self::CloseSession => OpCode::CloseSession,
        }
    }

    pub fn to_frame(&self, xid: i32) -> Vec<u8> {
        let mut w = JuteWriter::new();
        w.write_i32(xid).write_i32(self.op_code().code());
        match self {
            Self::GetChildren { path, watch }
            | Self::GetData { path, watch }
            | Self::Exists { path, watch } => {
                w.write_str(path).write_bool(*watch);
            }
            Self::SetData {
                path,
                data,
                version,
            } => {
                w.write_str(path)
                    .write_buffer(Some(data.as_slice()))
                    .write_i32(*version);
            }
            Self::GetAcl { path } => {
                w.write_str(path);
            }
            Self::SetAcl { path, acl, version } => {
                w.write_str(path).write_acl(acl).write_i32(*version);
            }
            Self::Create {
                path,
                data,
                acl,
                flags,
            } => {
                w.write_str(path)
                    .write_buffer(Some(data.as_slice()))
                    .write_acl(acl)
                    .write_i32(*flags);
            }
            Self::Delete { path, version } => {
                w.write_str(path).write_i32(*version);
            }
            Self::Ping | Self::CloseSession => {}
        }
        w.into_frame()
    }

    /// Parses a request payload (without length prefix) into its xid and body.
    pub fn decode(payload: &[u8]) -> Result<(i32, Self), ProtocolError> {
        let mut r = JuteReader::new(payload);
        let xid = r.read_i32()?;
        let op = r.read_i32()?;
        let request = match OpCode::from_code(op) {
            Some(OpCode::GetChildren2) => Self::GetChildren {
                path: r.read_str("path")?,
                watch: r.read_bool()?,
            },
            Some(OpCode::GetData) => Self::GetData {
                path: r.read_str("path")?,
                watch: r.read_bool()?,
            },
            Some(OpCode::Exists) => Self::Exists {
                path: r.read_str("path")?,
                watch: r.read_bool()?,
            },
            Some(OpCode::SetData) => Self::SetData {
                path: r.read_str("path")?,
                data: r.read_buffer()?.unwrap_or_default(),
                version: r.read_i32()?,
            },
            Some(OpCode::GetAcl) => Self::GetAcl {
                path: r.read_str("path")?,
            },
            Some(OpCode::SetAcl) => Self::SetAcl {
                path: r.read_str("path")?,
                acl: r.read_acl()?,
                version: r.read_i32()?,
            },
            Some(OpCode::Create) => Self::Create {
                path: r.read_str("path")?,
                data: r.read_buffer()?.unwrap_or_default(),
                acl: r.read_acl()?,
                flags: r.read_i32()?,
            },
            Some(OpCode::Delete) => Self::Delete {
                path: r.read_str("path")?,
                version: r.read_i32()?,
            },
            Some(OpCode::Ping) => Self::Ping,
            Some(OpCode::CloseSession) => Self::CloseSession,
            None => return Err(ProtocolError::UnknownOpCode(op)),
        };
        Ok((xid, request))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    pub fn read(r: &mut JuteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            xid: r.read_i32()?,
            zxid: r.read_i64()?,
            err: r.read_i32()?,
        })
    }

    pub fn write(&self, w: &mut JuteWriter) {
        w.write_i32(self.xid).write_i64(self.zxid).write_i32(self.err);
    }
}

/// Notification body as delivered, before any validation of its codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWatchEvent {
    pub event_type: i32,
    pub state: i32,
    pub path: String,
}

impl RawWatchEvent {
    pub const NONE_TYPE: i32 = -1;

    pub fn session_state(state: i32) -> Self {
        Self {
            event_type: Self::NONE_TYPE,
            state,
            path: String::new(),
        }
    }

    pub fn decode(r: &mut JuteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            event_type: r.read_i32()?,
            state: r.read_i32()?,
            path: r.read_buffer()?.map_or_else(String::new, |bytes| {
                String::from_utf8_lossy(&bytes).into_owned()
            }),
        })
    }

    pub fn write(&self, w: &mut JuteWriter) {
        w.write_i32(self.event_type)
            .write_i32(self.state)
            .write_str(&self.path);
    }
}

pub fn decode_children(body: &[u8]) -> Result<(Vec<String>, Stat), ProtocolError> {
    let mut r = JuteReader::new(body);
    let count = r.read_i32()?;
    let mut children = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count.max(0) {
        children.push(r.read_str("children")?);
    }
    let stat = r.read_stat()?;
    Ok((children, stat))
}

pub fn decode_data(body: &[u8]) -> Result<(Vec<u8>, Stat), ProtocolError> {
    let mut r = JuteReader::new(body);
    let data = r.read_buffer()?.unwrap_or_default();
    let stat = r.read_stat()?;
    Ok((data, stat))
}

pub fn decode_stat(body: &[u8]) -> Result<Stat, ProtocolError> {
    JuteReader::new(body).read_stat()
}

pub fn decode_acl(body: &[u8]) -> Result<(Vec<AclEntry>, Stat), ProtocolError> {
    let mut r = JuteReader::new(body);
    let acl = r.read_acl()?;
    let stat = r.read_stat()?;
    Ok((acl, stat))
}

pub fn decode_created_path(body: &[u8]) -> Result<String, ProtocolError> {
    JuteReader::new(body).read_str("path")
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
