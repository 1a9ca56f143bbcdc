//! Typed requests and responses exchanged with the coordination engine.
//!
//! The engine consumes and produces these objects as-is; framing them for the
//! wire is the transport's business. Numeric values follow the ZooKeeper
//! protocol so that an outer codec can map them directly.

use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::CreateMode;
use crate::Stat;
use crate::Version;
use crate::Xid;
use crate::Zxid;

// See ZooDefs.java

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[derive(ToPrimitive)]
#[derive(IntoStaticStr, EnumIter)]
pub enum OpCode {
    Create = 1,
    Remove = 2,
    Exists = 3,
    Get = 4,
    Set = 5,
    SimpleList = 8,
    Heartbeat = 11,
    List = 12,
    Check = 13,
    Multi = 14,
    Close = -11,
    Error = -1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd)]
#[derive(Serialize, Deserialize)]
#[derive(ToPrimitive)]
#[derive(IntoStaticStr, EnumIter)]
pub enum ErrorCode {
    /// Everything is OK
    Ok = 0,

    /// System and server-side errors.
    /// This is never thrown by the server, it shouldn't be used other than
    /// to indicate a range. Specifically error codes greater than this
    /// value, but lesser than `APIError`, are system errors.
    SystemError = -1,

    /// A runtime inconsistency was found
    RuntimeInconsistency = -2,
    /// A data inconsistency was found
    DataInconsistency = -3,
    /// Connection to the server has been lost
    ConnectionLoss = -4,
    /// Error while marshalling or unmarshalling data
    MarshallingError = -5,
    /// Operation is unimplemented
    Unimplemented = -6,
    /// Operation timeout
    OperationTimeout = -7,
    /// Invalid arguments
    BadArguments = -8,
    /// Unknown session (internal server use only)
    UnknownSession = -12,

    /// API errors.
    /// This is never thrown by the server, it shouldn't be used other than
    /// to indicate a range. Specifically error codes greater than this
    /// value are API errors (while values less than this indicate a `SystemError`).
    APIError = -100,

    /// Node does not exist
    NoNode = -101,
    /// Not authenticated
    NoAuth = -102,
    /// Version conflict
    BadVersion = -103,
    /// Ephemeral nodes may not have children
    NoChildrenForEphemerals = -108,
    /// The node already exists
    NodeExists = -110,
    /// The node has children
    NotEmpty = -111,
    /// The session has been expired by the server
    SessionExpired = -112,
    /// Invalid callback specified
    InvalidCallback = -113,
    /// Client authentication failed
    AuthFailed = -115,
    /// Attempts to remove a non-existing watcher
    NoWatcher = -121,
}

impl ErrorCode {
    pub fn is_system_error(&self) -> bool {
        self < &ErrorCode::SystemError && self > &ErrorCode::APIError
    }

    pub fn is_api_error(&self) -> bool {
        self < &ErrorCode::APIError
    }
}

// See Watcher.java
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum WatcherEventType {
    NotWatching = -2,
    /// Session event; the state field carries the details
    Session = -1,
    NodeCreated = 1,
    NodeDeleted = 2,
    NodeDataChanged = 3,
    NodeChildrenChanged = 4,
}

// See Watcher.java
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum KeeperState {
    /// The client is in the disconnected state - it is not connected
    /// to any server in the ensemble.
    Disconnected = 0,

    /// The client is in the connected state - it is connected
    /// to a server in the ensemble (one of the servers specified
    /// in the host connection parameter during ZooKeeper client
    /// creation).
    SyncConnected = 3,

    /// Auth failed state
    AuthFailed = 4,

    /// The serving cluster has expired this session. The ZooKeeper
    /// client connection (the session) is no longer valid. You must
    /// create a new client connection (instantiate a new ZooKeeper
    /// instance) if you with to access the ensemble.
    Expired = -112,
}

//----- Requests

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CreateRequest {
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub flags: CreateMode,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct RemoveRequest {
    pub path: String,
    /// Expected data version, or `ANY_VERSION`
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct ExistsRequest {
    pub path: String,
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct GetRequest {
    pub path: String,
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct SetRequest {
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct ListRequest {
    pub path: String,
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CheckRequest {
    pub path: String,
    /// Expected data version, or `ANY_VERSION`
    pub version: Version,
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct MultiRequest {
    pub requests: Vec<Op>,
}

/// An operation submitted to the engine.
///
/// `List` returns children along with the listed node's stat, `SimpleList`
/// the children only; both share the same processing and watch semantics.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub enum Op {
    Heartbeat,
    Create(CreateRequest),
    Remove(RemoveRequest),
    Exists(ExistsRequest),
    Get(GetRequest),
    Set(SetRequest),
    List(ListRequest),
    SimpleList(ListRequest),
    Check(CheckRequest),
    Multi(MultiRequest),
    Close,
}

impl Op {
    pub fn op_code(&self) -> OpCode {
        match self {
            Op::Heartbeat => OpCode::Heartbeat,
            Op::Create(_) => OpCode::Create,
            Op::Remove(_) => OpCode::Remove,
            Op::Exists(_) => OpCode::Exists,
            Op::Get(_) => OpCode::Get,
            Op::Set(_) => OpCode::Set,
            Op::List(_) => OpCode::List,
            Op::SimpleList(_) => OpCode::SimpleList,
            Op::Check(_) => OpCode::Check,
            Op::Multi(_) => OpCode::Multi,
            Op::Close => OpCode::Close,
        }
    }

    /// The path this operation targets, or `""` for path-less operations
    /// (heartbeat, multi, close).
    pub fn path(&self) -> &str {
        match self {
            Op::Create(r) => &r.path,
            Op::Remove(r) => &r.path,
            Op::Exists(r) => &r.path,
            Op::Get(r) => &r.path,
            Op::Set(r) => &r.path,
            Op::List(r) | Op::SimpleList(r) => &r.path,
            Op::Check(r) => &r.path,
            Op::Heartbeat | Op::Multi(_) | Op::Close => "",
        }
    }

    pub fn has_watch(&self) -> bool {
        match self {
            Op::Exists(r) => r.watch,
            Op::Get(r) => r.watch,
            Op::List(r) | Op::SimpleList(r) => r.watch,
            Op::Check(r) => r.watch,
            _ => false,
        }
    }

    /// Response body of this operation's kind with empty payload.
    ///
    /// Used wherever a response must be produced without processing the
    /// request: error envelopes and expired-session answers.
    pub fn empty_response(&self) -> ResponseBody {
        match self {
            Op::Heartbeat => ResponseBody::Heartbeat,
            Op::Create(_) => ResponseBody::Create(CreateResponse::default()),
            Op::Remove(_) => ResponseBody::Remove,
            Op::Exists(_) => ResponseBody::Exists(ExistsResponse::default()),
            Op::Get(_) => ResponseBody::Get(GetResponse::default()),
            Op::Set(_) => ResponseBody::Set(SetResponse::default()),
            Op::List(_) => ResponseBody::List(ListResponse::default()),
            Op::SimpleList(_) => ResponseBody::SimpleList(SimpleListResponse::default()),
            Op::Check(_) => ResponseBody::Check,
            Op::Multi(_) => ResponseBody::Multi(MultiResponse::default()),
            Op::Close => ResponseBody::Close,
        }
    }
}

/// A request as submitted by a session: an operation plus its exchange id.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct Request {
    pub xid: Xid,
    pub op: Op,
}

//----- Responses

#[derive(Debug, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct CreateResponse {
    pub path_created: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct ExistsResponse {
    pub stat: Stat,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct GetResponse {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub stat: Stat,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct SetResponse {
    pub stat: Stat,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct ListResponse {
    /// Name of children (not the full path)
    pub children: Vec<String>,
    pub stat: Stat,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct SimpleListResponse {
    /// Name of children (not the full path)
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct MultiResponse {
    pub responses: Vec<OpResult>,
}

// See Watcher.java
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct WatcherEvent {
    #[serde(rename = "type")]
    pub typ: WatcherEventType,
    /// State of the session the event is delivered to
    pub state: KeeperState,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub enum ResponseBody {
    Heartbeat,
    Create(CreateResponse),
    Remove,
    Exists(ExistsResponse),
    Get(GetResponse),
    Set(SetResponse),
    List(ListResponse),
    SimpleList(SimpleListResponse),
    Check,
    Multi(MultiResponse),
    Close,
    /// Error envelope, standing in for a failed sub-operation of a multi
    Error,
    Watch(WatcherEvent),
}

/// Outcome of one operation: the protocol-level error code plus the body of
/// the operation's kind. Sub-operations of a multi are reported this way,
/// without the envelope fields of a full [`Response`].
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct OpResult {
    pub error: ErrorCode,
    pub body: ResponseBody,
}

/// A full response as handed back to the transport.
///
/// `xid` is copied from the request and `zxid` stamped by the engine; watch
/// notifications carry `-1` for both.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct Response {
    pub xid: Xid,
    pub zxid: Zxid,
    pub error: ErrorCode,
    pub body: ResponseBody,
}
