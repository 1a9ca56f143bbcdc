use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::SessionId;
use crate::Stat;

/// A node of the tree: payload plus the bookkeeping the protocol exposes.
#[derive(Debug, Clone, PartialEq, Default)]
#[derive(Serialize, Deserialize)]
pub struct Node {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub is_ephemeral: bool,
    pub is_sequential: bool,
    /// Counter appended to sequential children. Moves forward on every
    /// creation under this node, sequential or not.
    pub seq_num: i32,
    pub stat: Stat,
}

/// The tree, keyed by absolute path. Ordered so that the children of a path
/// can be enumerated with a range scan from `path + "/"`.
pub type Container = BTreeMap<String, Node>;

/// Paths of the ephemeral nodes owned by each session.
pub type Ephemerals = HashMap<SessionId, BTreeSet<String>>;

/// Armed watchers per path. Entries disappear when they fire: watches are
/// one-shot.
pub type Watches = BTreeMap<String, Vec<SessionId>>;

/// Reverse index of [`Watches`]: the paths each session currently watches,
/// in either map.
pub type SessionsAndWatchers = HashMap<SessionId, BTreeSet<String>>;

/// Parent of an absolute path; the root is its own parent.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) if pos > 0 => &path[..pos],
        _ => "/",
    }
}

/// Last component of an absolute path.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_nested_paths() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn base_name_of_paths() {
        assert_eq!(base_name("/a/b/c"), "c");
        assert_eq!(base_name("/a"), "a");
        assert_eq!(base_name("/"), "");
    }
}
