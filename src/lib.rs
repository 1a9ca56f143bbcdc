#[macro_use]
extern crate strum_macros;

#[macro_use]
extern crate num_derive;

#[macro_use]
extern crate failure;

#[macro_use]
extern crate slog;

pub mod proto;
pub mod storage;

use serde_derive::Deserialize;
use serde_derive::Serialize;

/// ZooKeeper transaction id
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
pub struct Zxid(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
pub struct Timestamp(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
pub struct Version(pub i32);
pub const ANY_VERSION: Version = Version(-1);

/// Session id supplied by the transport layer. Owns ephemerals and watches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize)]
pub struct SessionId(pub i64);

/// Exchange id, a correlation id sent by a request and returned in its response.
///
/// It starts at 1, but can be negative for server-generated notifications (see
/// `FinalRequestProcessor` in ZK server)
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
pub struct Xid(pub i32);

// See CreateMode.java
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum CreateMode {
    Persistent = 0,
    Ephemeral = 1,
    PersistentSequential = 2,
    EphemeralSequential = 3,
}

use CreateMode::*;
impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        match self {
            Ephemeral | EphemeralSequential => true,
            _ => false,
        }
    }

    pub fn is_sequential(&self) -> bool {
        match self {
            PersistentSequential | EphemeralSequential => true,
            _ => false,
        }
    }
}

/// Information shared with the client
#[derive(Debug, Copy, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct Stat {
    /// Created zxid
    pub czxid: Zxid,
    /// Last modified zxid
    pub mzxid: Zxid,
    /// Created time
    pub ctime: Timestamp,
    /// Last modified time
    pub mtime: Timestamp,
    /// Version
    pub version: Version,
    /// Child version
    pub cversion: Version,
    /// ACL version
    pub aversion: Version,
    /// Owner id if ephemeral, 0 otherwise
    pub ephemeral_owner: SessionId,
    /// Length of the data in the node
    pub data_length: i32,
    /// Number of children of this node
    pub num_children: i32,
}
