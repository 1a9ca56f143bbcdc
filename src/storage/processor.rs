//! Per-operation processors.
//!
//! Each processor applies one operation to the tree and reports an
//! [`OpResult`] plus an [`Undo`] journal entry that reverts the edit. The
//! multi coordinator applies its sub-operations in order and replays the
//! journal in reverse when one of them fails, so a multi is all-or-nothing.
//!
//! Protocol failures (`NoNode`, `BadVersion`, ...) are ordinary result
//! values; `Err` is reserved for contract violations that must unwind out of
//! the engine.

use std::ops::Bound;

use failure::Error;
use itertools::Itertools;

use super::node::base_name;
use super::node::parent_path;
use super::node::Container;
use super::node::Ephemerals;
use super::node::Node;
use crate::proto::CheckRequest;
use crate::proto::CreateRequest;
use crate::proto::CreateResponse;
use crate::proto::ErrorCode;
use crate::proto::ExistsRequest;
use crate::proto::ExistsResponse;
use crate::proto::GetRequest;
use crate::proto::GetResponse;
use crate::proto::ListRequest;
use crate::proto::ListResponse;
use crate::proto::MultiResponse;
use crate::proto::Op;
use crate::proto::OpResult;
use crate::proto::RemoveRequest;
use crate::proto::ResponseBody;
use crate::proto::SetRequest;
use crate::proto::SetResponse;
use crate::proto::SimpleListResponse;
use crate::proto::WatcherEventType;
use crate::SessionId;
use crate::Stat;
use crate::Timestamp;
use crate::Version;
use crate::Zxid;
use crate::ANY_VERSION;

/// One reversible edit, recorded by a processor and replayed by the multi
/// coordinator when a later sub-operation fails.
pub(crate) enum UndoAction {
    /// Revert a create: drop the node and roll back the parent's counters.
    RemoveCreated {
        path: String,
        parent: String,
        is_ephemeral: bool,
        session_id: SessionId,
    },
    /// Revert a remove: put the node snapshot back, including its ephemeral
    /// bookkeeping, and roll back the parent's counters.
    RestoreRemoved {
        path: String,
        parent: String,
        node: Node,
    },
    /// Revert a data change: restore the node snapshot and the parent's
    /// child-list version.
    RestoreData {
        path: String,
        parent: String,
        node: Node,
    },
}

pub(crate) type Undo = Option<UndoAction>;

impl UndoAction {
    pub(crate) fn apply(self, container: &mut Container, ephemerals: &mut Ephemerals) {
        match self {
            UndoAction::RemoveCreated {
                path,
                parent,
                is_ephemeral,
                session_id,
            } => {
                container.remove(&path);
                if is_ephemeral {
                    if let Some(paths) = ephemerals.get_mut(&session_id) {
                        paths.remove(&path);
                    }
                }
                if let Some(parent_node) = container.get_mut(&parent) {
                    parent_node.stat.cversion.0 -= 1;
                    parent_node.stat.num_children -= 1;
                    parent_node.seq_num -= 1;
                }
            }
            UndoAction::RestoreRemoved { path, parent, node } => {
                if node.is_ephemeral {
                    ephemerals
                        .entry(node.stat.ephemeral_owner)
                        .or_default()
                        .insert(path.clone());
                }
                container.insert(path, node);
                if let Some(parent_node) = container.get_mut(&parent) {
                    parent_node.stat.num_children += 1;
                    parent_node.stat.cversion.0 -= 1;
                }
            }
            UndoAction::RestoreData { path, parent, node } => {
                // Parent first: when the path is the root, the snapshot below
                // overwrites the node the counter lives on.
                if let Some(parent_node) = container.get_mut(&parent) {
                    parent_node.stat.cversion.0 -= 1;
                }
                container.insert(path, node);
            }
        }
    }
}

/// A processor bound to one typed request.
pub(crate) enum Processor<'a> {
    Heartbeat,
    Create(&'a CreateRequest),
    Remove(&'a RemoveRequest),
    Exists(&'a ExistsRequest),
    Get(&'a GetRequest),
    Set(&'a SetRequest),
    List {
        request: &'a ListRequest,
        with_stat: bool,
    },
    Check(&'a CheckRequest),
    Multi(Vec<Processor<'a>>),
    Close,
}

/// Resolve the processor for an operation.
///
/// The operation set is closed, so op-code resolution cannot fail at runtime;
/// what can fail is a malformed request: a relative path, or a multi carrying
/// an operation that is not Create/Remove/Set/Check. Those are contract
/// violations, not protocol errors.
pub(crate) fn dispatch(op: &Op) -> Result<Processor<'_>, Error> {
    match op {
        Op::Heartbeat | Op::Multi(_) | Op::Close => {}
        _ => ensure!(
            op.path().starts_with('/'),
            "Invalid path {:?}: paths must be absolute",
            op.path()
        ),
    }

    let processor = match op {
        Op::Heartbeat => Processor::Heartbeat,
        Op::Create(request) => Processor::Create(request),
        Op::Remove(request) => Processor::Remove(request),
        Op::Exists(request) => Processor::Exists(request),
        Op::Get(request) => Processor::Get(request),
        Op::Set(request) => Processor::Set(request),
        Op::List(request) => Processor::List {
            request,
            with_stat: true,
        },
        Op::SimpleList(request) => Processor::List {
            request,
            with_stat: false,
        },
        Op::Check(request) => Processor::Check(request),
        Op::Multi(request) => {
            let subs = request
                .requests
                .iter()
                .map(|sub| match sub {
                    Op::Create(_) | Op::Remove(_) | Op::Set(_) | Op::Check(_) => dispatch(sub),
                    other => {
                        let name: &'static str = other.op_code().into();
                        Err(format_err!("Illegal command as part of multi request: {}", name))
                    }
                })
                .fold_results(Vec::new(), |mut subs, processor| {
                    subs.push(processor);
                    subs
                })?;
            Processor::Multi(subs)
        }
        Op::Close => Processor::Close,
    };
    Ok(processor)
}

impl<'a> Processor<'a> {
    pub(crate) fn process(
        &self,
        container: &mut Container,
        ephemerals: &mut Ephemerals,
        zxid: Zxid,
        session_id: SessionId,
    ) -> Result<(OpResult, Undo), Error> {
        match self {
            Processor::Heartbeat => Ok((ok_result(ResponseBody::Heartbeat), None)),
            Processor::Create(request) => {
                process_create(request, container, ephemerals, zxid, session_id)
            }
            Processor::Remove(request) => process_remove(request, container, ephemerals),
            Processor::Exists(request) => Ok(process_exists(request, container)),
            Processor::Get(request) => Ok(process_get(request, container)),
            Processor::Set(request) => process_set(request, container, zxid),
            Processor::List { request, with_stat } => {
                process_list(request, *with_stat, container)
            }
            Processor::Check(request) => Ok(process_check(request, container)),
            Processor::Multi(subs) => {
                process_multi(subs, container, ephemerals, zxid, session_id)
            }
            Processor::Close => bail!("Called process on close request"),
        }
    }

    /// Watch events this request fires once committed, as `(path, event)`
    /// pairs in emission order. Creates fire on the path as requested, before
    /// any sequential suffix.
    pub(crate) fn watch_events(&self, result: &OpResult) -> Vec<(String, WatcherEventType)> {
        match self {
            Processor::Create(request) => {
                vec![(request.path.clone(), WatcherEventType::NodeCreated)]
            }
            Processor::Remove(request) => {
                vec![(request.path.clone(), WatcherEventType::NodeDeleted)]
            }
            Processor::Set(request) => {
                vec![(request.path.clone(), WatcherEventType::NodeDataChanged)]
            }
            Processor::Multi(subs) => {
                let responses = match &result.body {
                    ResponseBody::Multi(multi) => &multi.responses,
                    _ => return Vec::new(),
                };
                // A failed multi was rolled back and must not notify anyone.
                if responses.iter().any(|sub| sub.error != ErrorCode::Ok) {
                    return Vec::new();
                }
                subs.iter()
                    .zip(responses)
                    .flat_map(|(sub, sub_result)| sub.watch_events(sub_result))
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

fn ok_result(body: ResponseBody) -> OpResult {
    OpResult {
        error: ErrorCode::Ok,
        body,
    }
}

fn current_time_ms() -> Timestamp {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp(since_epoch.as_millis() as u64)
}

/// Fetch a node that the current operation requires to be present.
fn node_mut<'c>(container: &'c mut Container, path: &str) -> Result<&'c mut Node, Error> {
    container
        .get_mut(path)
        .ok_or_else(|| format_err!("Node {} disappeared from the tree", path))
}

fn process_create(
    request: &CreateRequest,
    container: &mut Container,
    ephemerals: &mut Ephemerals,
    zxid: Zxid,
    session_id: SessionId,
) -> Result<(OpResult, Undo), Error> {
    let failed = |error| {
        (
            OpResult {
                error,
                body: ResponseBody::Create(CreateResponse::default()),
            },
            None,
        )
    };

    let parent = parent_path(&request.path).to_owned();
    let (parent_is_ephemeral, seq_num) = match container.get(&parent) {
        None => return Ok(failed(ErrorCode::NoNode)),
        Some(node) => (node.is_ephemeral, node.seq_num),
    };
    if parent_is_ephemeral {
        return Ok(failed(ErrorCode::NoChildrenForEphemerals));
    }
    let is_sequential = request.flags.is_sequential();
    if !is_sequential && container.contains_key(&request.path) {
        return Ok(failed(ErrorCode::NodeExists));
    }

    let mut path_created = request.path.clone();
    if is_sequential {
        path_created.push_str(&format!("{:010}", seq_num));
    }

    let is_ephemeral = request.flags.is_ephemeral();
    let now = current_time_ms();
    let created = Node {
        data: request.data.clone(),
        is_ephemeral,
        is_sequential,
        seq_num: 0,
        stat: Stat {
            czxid: zxid,
            mzxid: zxid,
            ctime: now,
            mtime: now,
            version: Version(0),
            cversion: Version(0),
            aversion: Version(0),
            ephemeral_owner: if is_ephemeral { session_id } else { SessionId(0) },
            data_length: request.data.len() as i32,
            num_children: 0,
        },
    };

    {
        let parent_node = node_mut(container, &parent)?;
        // The counter moves forward whether or not the child is sequential.
        parent_node.seq_num += 1;
        parent_node.stat.cversion.0 += 1;
        parent_node.stat.num_children += 1;
    }

    container.insert(path_created.clone(), created);
    if is_ephemeral {
        ephemerals
            .entry(session_id)
            .or_default()
            .insert(path_created.clone());
    }

    let undo = UndoAction::RemoveCreated {
        path: path_created.clone(),
        parent,
        is_ephemeral,
        session_id,
    };

    Ok((
        ok_result(ResponseBody::Create(CreateResponse { path_created })),
        Some(undo),
    ))
}

fn process_remove(
    request: &RemoveRequest,
    container: &mut Container,
    ephemerals: &mut Ephemerals,
) -> Result<(OpResult, Undo), Error> {
    let failed = |error| {
        (
            OpResult {
                error,
                body: ResponseBody::Remove,
            },
            None,
        )
    };

    if request.path == "/" {
        return Ok(failed(ErrorCode::BadArguments));
    }
    let prev_node = match container.get(&request.path) {
        None => return Ok(failed(ErrorCode::NoNode)),
        Some(node) => node.clone(),
    };
    if request.version != ANY_VERSION && request.version != prev_node.stat.version {
        return Ok(failed(ErrorCode::BadVersion));
    }
    if prev_node.stat.num_children != 0 {
        return Ok(failed(ErrorCode::NotEmpty));
    }

    container.remove(&request.path);
    if prev_node.is_ephemeral {
        // The node goes away for whoever removes it, so the bookkeeping of
        // the owning session is what must be updated.
        if let Some(paths) = ephemerals.get_mut(&prev_node.stat.ephemeral_owner) {
            paths.remove(&request.path);
        }
    }

    let parent = parent_path(&request.path).to_owned();
    {
        let parent_node = node_mut(container, &parent)?;
        parent_node.stat.num_children -= 1;
        parent_node.stat.cversion.0 += 1;
    }

    let undo = UndoAction::RestoreRemoved {
        path: request.path.clone(),
        parent,
        node: prev_node,
    };

    Ok((ok_result(ResponseBody::Remove), Some(undo)))
}

fn process_exists(request: &ExistsRequest, container: &Container) -> (OpResult, Undo) {
    let result = match container.get(&request.path) {
        Some(node) => ok_result(ResponseBody::Exists(ExistsResponse { stat: node.stat })),
        None => OpResult {
            error: ErrorCode::NoNode,
            body: ResponseBody::Exists(ExistsResponse::default()),
        },
    };
    (result, None)
}

fn process_get(request: &GetRequest, container: &Container) -> (OpResult, Undo) {
    let result = match container.get(&request.path) {
        Some(node) => ok_result(ResponseBody::Get(GetResponse {
            data: node.data.clone(),
            stat: node.stat,
        })),
        None => OpResult {
            error: ErrorCode::NoNode,
            body: ResponseBody::Get(GetResponse::default()),
        },
    };
    (result, None)
}

fn process_set(
    request: &SetRequest,
    container: &mut Container,
    zxid: Zxid,
) -> Result<(OpResult, Undo), Error> {
    let failed = |error| {
        (
            OpResult {
                error,
                body: ResponseBody::Set(SetResponse::default()),
            },
            None,
        )
    };

    let prev_node = match container.get(&request.path) {
        None => return Ok(failed(ErrorCode::NoNode)),
        Some(node) => node.clone(),
    };
    if request.version != ANY_VERSION && request.version != prev_node.stat.version {
        return Ok(failed(ErrorCode::BadVersion));
    }

    {
        let node = node_mut(container, &request.path)?;
        node.data = request.data.clone();
        node.stat.version.0 += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = current_time_ms();
        node.stat.data_length = request.data.len() as i32;
    }
    let parent = parent_path(&request.path).to_owned();
    node_mut(container, &parent)?.stat.cversion.0 += 1;

    // Re-read after the parent bump: for the root they are the same node.
    let stat = node_mut(container, &request.path)?.stat;

    let undo = UndoAction::RestoreData {
        path: request.path.clone(),
        parent,
        node: prev_node,
    };

    Ok((
        ok_result(ResponseBody::Set(SetResponse { stat })),
        Some(undo),
    ))
}

fn process_list(
    request: &ListRequest,
    with_stat: bool,
    container: &Container,
) -> Result<(OpResult, Undo), Error> {
    ensure!(!request.path.is_empty(), "Logical error: path cannot be empty");

    let empty_body = || {
        if with_stat {
            ResponseBody::List(ListResponse::default())
        } else {
            ResponseBody::SimpleList(SimpleListResponse::default())
        }
    };

    let stat = match container.get(&request.path) {
        None => {
            return Ok((
                OpResult {
                    error: ErrorCode::NoNode,
                    body: empty_body(),
                },
                None,
            ));
        }
        Some(node) => node.stat,
    };

    let mut path_prefix = request.path.clone();
    if !path_prefix.ends_with('/') {
        path_prefix.push('/');
    }

    let mut children = Vec::new();
    let after_prefix = (Bound::Excluded(path_prefix.as_str()), Bound::Unbounded);
    for (child_path, _) in container.range::<str, _>(after_prefix) {
        if !child_path.starts_with(&path_prefix) {
            break;
        }
        if parent_path(child_path) == request.path {
            children.push(base_name(child_path).to_owned());
        }
    }

    let body = if with_stat {
        ResponseBody::List(ListResponse { children, stat })
    } else {
        ResponseBody::SimpleList(SimpleListResponse { children })
    };
    Ok((ok_result(body), None))
}

fn process_check(request: &CheckRequest, container: &Container) -> (OpResult, Undo) {
    let error = match container.get(&request.path) {
        None => ErrorCode::NoNode,
        Some(node) if request.version != ANY_VERSION && request.version != node.stat.version => {
            ErrorCode::BadVersion
        }
        Some(_) => ErrorCode::Ok,
    };
    (
        OpResult {
            error,
            body: ResponseBody::Check,
        },
        None,
    )
}

fn process_multi(
    subs: &[Processor<'_>],
    container: &mut Container,
    ephemerals: &mut Ephemerals,
    zxid: Zxid,
    session_id: SessionId,
) -> Result<(OpResult, Undo), Error> {
    let mut responses: Vec<OpResult> = Vec::with_capacity(subs.len());
    let mut undo_actions: Vec<Undo> = Vec::new();

    for (i, sub) in subs.iter().enumerate() {
        let (result, undo) = match sub.process(container, ephemerals, zxid, session_id) {
            Ok(outcome) => outcome,
            Err(err) => {
                rollback(undo_actions, container, ephemerals);
                return Err(err);
            }
        };
        responses.push(result);

        if responses[i].error != ErrorCode::Ok {
            // Completed sub-operations report their own code in an error
            // envelope; the rest were never attempted. The outer error stays
            // Ok, the per-sub errors carry the failure.
            for sub_result in responses.iter_mut() {
                *sub_result = OpResult {
                    error: sub_result.error,
                    body: ResponseBody::Error,
                };
            }
            for _ in i + 1..subs.len() {
                responses.push(OpResult {
                    error: ErrorCode::RuntimeInconsistency,
                    body: ResponseBody::Error,
                });
            }
            rollback(undo_actions, container, ephemerals);
            return Ok((
                ok_result(ResponseBody::Multi(MultiResponse { responses })),
                None,
            ));
        }
        undo_actions.push(undo);
    }

    Ok((
        ok_result(ResponseBody::Multi(MultiResponse { responses })),
        None,
    ))
}

fn rollback(undo_actions: Vec<Undo>, container: &mut Container, ephemerals: &mut Ephemerals) {
    for action in undo_actions.into_iter().rev().flatten() {
        action.apply(container, ephemerals);
    }
}
