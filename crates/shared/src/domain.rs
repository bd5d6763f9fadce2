use std::{fmt, str::FromStr};

use bitflags::bitflags;
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::error::{AclParseError, ConnectError, PathError};

/// Absolute, slash-delimited znode path. Root is `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ZkPath(String);

impl ZkPath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, PathError> {
        let raw = raw.into();
        if !raw.starts_with('/') {
            return Err(PathError::NotAbsolute(raw));
        }
        if raw == "/" {
            return Ok(Self(raw));
        }
        if raw.ends_with('/') {
            return Err(PathError::TrailingSlash(raw));
        }
        if raw.contains('\0') {
            return Err(PathError::NulCharacter(raw));
        }
        for segment in raw[1..].split('/') {
            match segment {
                "" => return Err(PathError::EmptySegment(raw)),
                "." | ".." => return Err(PathError::RelativeSegment(raw)),
                _ => {}
            }
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Last segment; empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    pub fn parent(&self) -> Option<ZkPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Joins a single child segment, never doubling the separator under `/`.
    pub fn child(&self, name: &str) -> Result<ZkPath, PathError> {
        if name.is_empty() || name.contains('/') {
            return Err(PathError::InvalidSegment(name.to_string()));
        }
        if self.is_root() {
            Self::parse(format!("/{name}"))
        } else {
            Self::parse(format!("{}/{name}", self.0))
        }
    }

    /// True when `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &ZkPath) -> bool {
        if self == ancestor {
            return false;
        }
        if ancestor.is_root() {
            return true;
        }
        self.0.starts_with(ancestor.as_str())
            && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/')
    }

    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches('/').count()
        }
    }
}

impl fmt::Display for ZkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ZkPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ZkPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ZkPath> for String {
    fn from(value: ZkPath) -> Self {
        value.0
    }
}

impl AsRef<str> for ZkPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Comma-separated `host:port` list, kept verbatim alongside the parsed hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectString {
    raw: String,
    hosts: Vec<HostPort>,
}

impl ConnectString {
    pub fn parse(raw: &str) -> Result<Self, ConnectError> {
        let invalid = |reason: &str| ConnectError::InvalidConnectString {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty connection string"));
        }
        if trimmed.contains('/') {
            return Err(invalid("chroot suffixes are not supported"));
        }

        let mut hosts = Vec::new();
        for entry in trimmed.split(',') {
            let entry = entry.trim();
            let Some((host, port)) = entry.rsplit_once(':') else {
                return Err(invalid(&format!("entry '{entry}' is missing a port")));
            };
            if host.is_empty() {
                return Err(invalid(&format!("entry '{entry}' is missing a host")));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid(&format!("entry '{entry}' has an invalid port")))?;
            hosts.push(HostPort {
                host: host.to_string(),
                port,
            });
        }

        Ok(Self {
            raw: trimmed.to_string(),
            hosts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn hosts(&self) -> &[HostPort] {
        &self.hosts
    }
}

impl fmt::Display for ConnectString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Expired,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Expired => "expired",
        };
        f.write_str(label)
    }
}

/// Server-side session state carried by state-only notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeeperState {
    Disconnected,
    SyncConnected,
    AuthFailed,
    ConnectedReadOnly,
    Expired,
    Closed,
}

impl KeeperState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Disconnected),
            3 => Some(Self::SyncConnected),
            4 => Some(Self::AuthFailed),
            5 => Some(Self::ConnectedReadOnly),
            -112 => Some(Self::Expired),
            7 => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Disconnected => 0,
            Self::SyncConnected => 3,
            Self::AuthFailed => 4,
            Self::ConnectedReadOnly => 5,
            Self::Expired => -112,
            Self::Closed => 7,
        }
    }

    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::SyncConnected | Self::ConnectedReadOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
}

impl ChangeKind {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Created),
            2 => Some(Self::Deleted),
            3 => Some(Self::DataChanged),
            4 => Some(Self::ChildrenChanged),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Created => 1,
            Self::Deleted => 2,
            Self::DataChanged => 3,
            Self::ChildrenChanged => 4,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "NODE_CREATED",
            Self::Deleted => "NODE_DELETED",
            Self::DataChanged => "NODE_DATA_CHANGED",
            Self::ChildrenChanged => "NODE_CHILDREN_CHANGED",
        };
        write!(f, "{label}[{}]", self.code())
    }
}

/// Structured notification consumed by the tree cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: ZkPath,
    pub kind: ChangeKind,
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

/// One row of the node attribute table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatField {
    pub name: &'static str,
    pub value: String,
    pub real_value: String,
    pub description: &'static str,
}

impl Stat {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }

    pub fn describe(&self) -> Vec<StatField> {
        let zxid = |name, value: i64, description| StatField {
            name,
            value: format!("0x{value:x}"),
            real_value: value.to_string(),
            description,
        };
        let time = |name, value: i64, description| StatField {
            name,
            value: format_epoch_millis(value),
            real_value: value.to_string(),
            description,
        };
        let plain = |name, value: i64, description| StatField {
            name,
            value: value.to_string(),
            real_value: value.to_string(),
            description,
        };

        vec![
            zxid("cZxid", self.czxid, "transaction id that created the node"),
            time("ctime", self.ctime, "creation time"),
            zxid("mZxid", self.mzxid, "transaction id of the last data change"),
            time("mtime", self.mtime, "last data modification time"),
            zxid("pZxid", self.pzxid, "transaction id of the last child change"),
            plain(
                "cversion",
                self.cversion.into(),
                "number of changes to the children",
            ),
            plain("dataVersion", self.version.into(), "number of data changes"),
            plain("aclVersion", self.aversion.into(), "number of ACL changes"),
            zxid(
                "ephemeralOwner",
                self.ephemeral_owner,
                "owning session id for ephemeral nodes, 0 otherwise",
            ),
            plain("dataLength", self.data_length.into(), "payload length in bytes"),
            plain("numChildren", self.num_children.into(), "number of children"),
        ]
    }
}

fn format_epoch_millis(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => millis.to_string(),
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Perms: i32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const DELETE = 1 << 3;
        const ADMIN = 1 << 4;
    }
}

impl Perms {
    const LETTERS: [(char, Perms); 5] = [
        ('c', Perms::CREATE),
        ('d', Perms::DELETE),
        ('r', Perms::READ),
        ('w', Perms::WRITE),
        ('a', Perms::ADMIN),
    ];

    pub fn parse_letters(raw: &str) -> Result<Self, AclParseError> {
        let mut perms = Perms::empty();
        for ch in raw.chars() {
            let Some((_, bit)) = Self::LETTERS
                .iter()
                .find(|(letter, _)| *letter == ch.to_ascii_lowercase())
            else {
                return Err(AclParseError::UnknownPermission(ch));
            };
            perms |= *bit;
        }
        Ok(perms)
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (letter, bit) in Self::LETTERS {
            if self.contains(bit) {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

/// ACL entry in `scheme:id:perms` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub scheme: String,
    pub id: String,
    pub perms: Perms,
}

impl AclEntry {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>, perms: Perms) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
            perms,
        }
    }

    /// `world:anyone:cdrwa`
    pub fn open_unsafe() -> Vec<AclEntry> {
        vec![Self::new("world", "anyone", Perms::all())]
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scheme, self.id, self.perms)
    }
}

impl FromStr for AclEntry {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ids such as `ip:10.0.0.1` or digests may themselves contain ':'
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| AclParseError::Malformed(s.to_string()))?;
        let (id, perms) = rest
            .rsplit_once(':')
            .ok_or_else(|| AclParseError::Malformed(s.to_string()))?;
        if scheme.is_empty() || id.is_empty() {
            return Err(AclParseError::Malformed(s.to_string()));
        }
        Ok(Self::new(scheme, id, Perms::parse_letters(perms)?))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    #[default]
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn flags(self) -> i32 {
        match self {
            Self::Persistent => 0,
            Self::Ephemeral => 1,
            Self::PersistentSequential => 2,
            Self::EphemeralSequential => 3,
        }
    }

    pub fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            0 => Some(Self::Persistent),
            1 => Some(Self::Ephemeral),
            2 => Some(Self::PersistentSequential),
            3 => Some(Self::EphemeralSequential),
            _ => None,
        }
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
