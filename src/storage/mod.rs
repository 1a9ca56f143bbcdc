//! The coordination storage engine.
//!
//! [`KeeperStorage`] is a single-writer state machine over a tree of
//! versioned nodes, mimicking a single ZooKeeper server for one in-process
//! consumer: ephemeral and sequential nodes, one-shot watches, atomic
//! multi-requests and session lifecycle all behave as they would against a
//! real server, without any network or disk underneath.
//!
//! Processing is synchronous; every call returns the full set of responses
//! it produced, watch notifications to other sessions included. Callers
//! serialize requests themselves (or wrap the storage in a lock).

pub mod node;
mod processor;

use failure::Error;
use slog::Logger;

use self::node::parent_path;
use self::node::Container;
use self::node::Ephemerals;
use self::node::Node;
use self::node::SessionsAndWatchers;
use self::node::Watches;
use crate::proto::ErrorCode;
use crate::proto::KeeperState;
use crate::proto::Op;
use crate::proto::OpCode;
use crate::proto::Request;
use crate::proto::Response;
use crate::proto::ResponseBody;
use crate::proto::WatcherEvent;
use crate::proto::WatcherEventType;
use crate::SessionId;
use crate::Xid;
use crate::Zxid;

/// Responses produced by one call, each one targeted at a session: the
/// requester's own answer plus any watch notifications fired along the way.
pub type SessionResponses = Vec<(SessionId, Response)>;

/// In-process coordination storage, the moral equivalent of a single
/// ZooKeeper server for one embedded consumer.
pub struct KeeperStorage {
    container: Container,
    ephemerals: Ephemerals,
    watches: Watches,
    list_watches: Watches,
    sessions_and_watchers: SessionsAndWatchers,
    zxid: i64,
    finalized: bool,
    logger: Logger,
}

fn watch_response(
    path: String,
    typ: WatcherEventType,
    state: KeeperState,
    error: ErrorCode,
) -> Response {
    Response {
        xid: Xid(-1),
        zxid: Zxid(-1),
        error,
        body: ResponseBody::Watch(WatcherEvent { typ, state, path }),
    }
}

impl KeeperStorage {
    pub fn new(logger: Logger) -> KeeperStorage {
        let mut container = Container::new();
        container.insert("/".to_owned(), Node::default());
        KeeperStorage {
            container,
            ephemerals: Ephemerals::new(),
            watches: Watches::new(),
            list_watches: Watches::new(),
            sessions_and_watchers: SessionsAndWatchers::new(),
            zxid: 0,
            finalized: false,
            logger,
        }
    }

    /// Current transaction id, for transports that compose their own
    /// responses.
    pub fn zxid(&self) -> Zxid {
        Zxid(self.zxid)
    }

    fn next_zxid(&mut self) -> Zxid {
        let zxid = self.zxid;
        self.zxid += 1;
        Zxid(zxid)
    }

    /// Apply one request on behalf of a session.
    ///
    /// The returned list carries any watch notifications fired by the
    /// request, followed by the requester's own response. An `Err` means the
    /// request violated the engine's contract (not a protocol-level failure,
    /// which is reported in the response's error field).
    pub fn process_request(
        &mut self,
        request: &Request,
        session_id: SessionId,
    ) -> Result<SessionResponses, Error> {
        let op_name: &'static str = request.op.op_code().into();
        debug!(self.logger, "Processing request"; "op" => op_name, "session" => session_id.0);

        // Close never goes through a processor; it is the whole-session
        // teardown, handled here.
        if let Op::Close = request.op {
            return Ok(self.close_session(request, session_id));
        }

        let processor = processor::dispatch(&request.op)?;
        let zxid = Zxid(self.zxid);
        let (result, _undo) =
            processor.process(&mut self.container, &mut self.ephemerals, zxid, session_id)?;

        let mut results = SessionResponses::new();

        if request.op.has_watch() {
            let path = request.op.path();
            if result.error == ErrorCode::Ok {
                let watches = match request.op.op_code() {
                    OpCode::List | OpCode::SimpleList => &mut self.list_watches,
                    _ => &mut self.watches,
                };
                watches.entry(path.to_owned()).or_default().push(session_id);
                self.sessions_and_watchers
                    .entry(session_id)
                    .or_default()
                    .insert(path.to_owned());
            } else if result.error == ErrorCode::NoNode
                && request.op.op_code() == OpCode::Exists
            {
                // The node is not there yet, but its creation must still wake
                // the watcher up.
                self.watches.entry(path.to_owned()).or_default().push(session_id);
                self.sessions_and_watchers
                    .entry(session_id)
                    .or_default()
                    .insert(path.to_owned());
            } else {
                results.push((
                    session_id,
                    watch_response(
                        path.to_owned(),
                        WatcherEventType::NotWatching,
                        KeeperState::SyncConnected,
                        result.error,
                    ),
                ));
            }
        }

        if result.error == ErrorCode::Ok {
            for (path, event_type) in processor.watch_events(&result) {
                let notifications = self.process_watches(&path, event_type);
                results.extend(notifications);
            }
        }

        let zxid = self.next_zxid();
        results.push((
            session_id,
            Response {
                xid: request.xid,
                zxid,
                error: result.error,
                body: result.body,
            },
        ));
        Ok(results)
    }

    fn close_session(&mut self, request: &Request, session_id: SessionId) -> SessionResponses {
        let mut results = SessionResponses::new();

        if let Some(paths) = self.ephemerals.remove(&session_id) {
            info!(self.logger, "Closing session";
                "session" => session_id.0, "ephemerals" => paths.len());
            for path in paths {
                if self.container.remove(&path).is_some() {
                    // Keep the parent's bookkeeping in line with the removal.
                    let parent = parent_path(&path).to_owned();
                    if let Some(parent_node) = self.container.get_mut(&parent) {
                        parent_node.stat.num_children -= 1;
                        parent_node.stat.cversion.0 += 1;
                    }
                }
                let notifications = self.process_watches(&path, WatcherEventType::NodeDeleted);
                results.extend(notifications);
            }
        }
        self.clear_dead_watches(session_id);

        let zxid = self.next_zxid();
        results.push((
            session_id,
            Response {
                xid: request.xid,
                zxid,
                error: ErrorCode::Ok,
                body: ResponseBody::Close,
            },
        ));
        results
    }

    /// Pop and notify the watchers concerned by `event_type` on `path`: the
    /// data watchers of the path itself, then the child watchers of its
    /// parent. Both entries are one-shot.
    fn process_watches(&mut self, path: &str, event_type: WatcherEventType) -> SessionResponses {
        let mut result = SessionResponses::new();

        if let Some(watchers) = self.watches.remove(path) {
            for watcher_session in watchers {
                self.forget_watcher(watcher_session, path);
                result.push((
                    watcher_session,
                    watch_response(
                        path.to_owned(),
                        event_type,
                        KeeperState::SyncConnected,
                        ErrorCode::Ok,
                    ),
                ));
            }
        }

        // The child set only changes on create and delete; a data change
        // stays quiet for the parent's list watchers.
        if event_type == WatcherEventType::NodeDataChanged {
            return result;
        }

        let parent = parent_path(path).to_owned();
        if let Some(watchers) = self.list_watches.remove(&parent) {
            for watcher_session in watchers {
                self.forget_watcher(watcher_session, &parent);
                result.push((
                    watcher_session,
                    watch_response(
                        parent.clone(),
                        WatcherEventType::NodeChildrenChanged,
                        KeeperState::SyncConnected,
                        ErrorCode::Ok,
                    ),
                ));
            }
        }

        result
    }

    /// Drop the reverse-index entry of a fired watch. The entry stays as
    /// long as the session still watches the path through the other map.
    fn forget_watcher(&mut self, session_id: SessionId, path: &str) {
        let still_data = self
            .watches
            .get(path)
            .map_or(false, |watchers| watchers.contains(&session_id));
        let still_list = self
            .list_watches
            .get(path)
            .map_or(false, |watchers| watchers.contains(&session_id));
        if still_data || still_list {
            return;
        }
        if let Some(paths) = self.sessions_and_watchers.get_mut(&session_id) {
            paths.remove(path);
            if paths.is_empty() {
                self.sessions_and_watchers.remove(&session_id);
            }
        }
    }

    fn clear_dead_watches(&mut self, session_id: SessionId) {
        let watched_paths = match self.sessions_and_watchers.remove(&session_id) {
            None => return,
            Some(paths) => paths,
        };
        for path in watched_paths {
            if let Some(watchers) = self.watches.get_mut(&path) {
                watchers.retain(|watcher| *watcher != session_id);
                if watchers.is_empty() {
                    self.watches.remove(&path);
                }
            }
            if let Some(watchers) = self.list_watches.get_mut(&path) {
                watchers.retain(|watcher| *watcher != session_id);
                if watchers.is_empty() {
                    self.list_watches.remove(&path);
                }
            }
        }
    }

    /// Shut the storage down, once.
    ///
    /// Every armed watch is flushed as a session-expiration notification and
    /// every request in `expired_requests` is answered with its natural
    /// response kind and `SessionExpired`. Calling this a second time is a
    /// contract violation.
    pub fn finalize(
        &mut self,
        expired_requests: Vec<(SessionId, Request)>,
    ) -> Result<SessionResponses, Error> {
        ensure!(!self.finalized, "Keeper storage already finalized");
        self.finalized = true;

        info!(self.logger, "Finalizing storage";
            "data_watches" => self.watches.len(),
            "list_watches" => self.list_watches.len(),
            "expired_requests" => expired_requests.len());

        fn expire_watches(watches: &mut Watches, results: &mut SessionResponses) {
            for (_path, watchers) in std::mem::replace(watches, Watches::new()) {
                for watcher_session in watchers {
                    results.push((
                        watcher_session,
                        watch_response(
                            String::new(),
                            WatcherEventType::Session,
                            KeeperState::Expired,
                            ErrorCode::SessionExpired,
                        ),
                    ));
                }
            }
        }

        let mut results = SessionResponses::new();
        expire_watches(&mut self.watches, &mut results);
        expire_watches(&mut self.list_watches, &mut results);
        self.sessions_and_watchers.clear();

        for (session_id, request) in expired_requests {
            results.push((
                session_id,
                Response {
                    xid: request.xid,
                    zxid: self.zxid(),
                    error: ErrorCode::SessionExpired,
                    body: request.op.empty_response(),
                },
            ));
        }
        Ok(results)
    }
}

#[cfg(test)]
impl KeeperStorage {
    /// Check every structural invariant of the engine. Test-only; meant to
    /// hold after any accepted request.
    fn assert_consistent(&self) {
        let root = self.container.get("/").expect("root must exist");
        assert!(!root.is_ephemeral, "root must not be ephemeral");

        for (path, node) in &self.container {
            if path != "/" {
                let parent = self
                    .container
                    .get(parent_path(path))
                    .unwrap_or_else(|| panic!("parent of {} missing", path));
                assert!(
                    !parent.is_ephemeral,
                    "{} is a child of an ephemeral node",
                    path
                );
            }
            let child_count = self
                .container
                .keys()
                .filter(|child| child.as_str() != "/" && parent_path(child) == path)
                .count();
            assert_eq!(
                node.stat.num_children as usize, child_count,
                "numChildren mismatch at {}",
                path
            );
            if node.is_ephemeral {
                let owned = self
                    .ephemerals
                    .get(&node.stat.ephemeral_owner)
                    .map_or(false, |paths| paths.contains(path));
                assert!(owned, "ephemeral {} not indexed under its owner", path);
            }
        }

        for (session, paths) in &self.ephemerals {
            for path in paths {
                let node = self
                    .container
                    .get(path)
                    .unwrap_or_else(|| panic!("indexed ephemeral {} missing", path));
                assert!(node.is_ephemeral, "{} indexed but not ephemeral", path);
                assert_eq!(node.stat.ephemeral_owner, *session);
            }
        }

        for (path, watchers) in self.watches.iter().chain(self.list_watches.iter()) {
            for watcher in watchers {
                let known = self
                    .sessions_and_watchers
                    .get(watcher)
                    .map_or(false, |paths| paths.contains(path));
                assert!(known, "watch on {} missing from the reverse index", path);
            }
        }
        for (session, paths) in &self.sessions_and_watchers {
            for path in paths {
                let in_data = self
                    .watches
                    .get(path)
                    .map_or(false, |watchers| watchers.contains(session));
                let in_list = self
                    .list_watches
                    .get(path)
                    .map_or(false, |watchers| watchers.contains(session));
                assert!(
                    in_data || in_list,
                    "reverse index entry {} without a watch",
                    path
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CheckRequest;
    use crate::proto::CreateRequest;
    use crate::proto::ExistsRequest;
    use crate::proto::GetRequest;
    use crate::proto::ListRequest;
    use crate::proto::MultiRequest;
    use crate::proto::RemoveRequest;
    use crate::proto::SetRequest;
    use crate::CreateMode;
    use crate::Version;
    use crate::ANY_VERSION;

    use proptest::prelude::*;

    fn storage() -> KeeperStorage {
        KeeperStorage::new(Logger::root(slog::Discard, o!()))
    }

    fn request(op: Op) -> Request {
        Request { xid: Xid(1), op }
    }

    fn create_op(path: &str, data: &[u8], flags: CreateMode) -> Op {
        Op::Create(CreateRequest {
            path: path.to_owned(),
            data: data.to_vec(),
            flags,
        })
    }

    fn exists_op(path: &str, watch: bool) -> Op {
        Op::Exists(ExistsRequest {
            path: path.to_owned(),
            watch,
        })
    }

    fn get_op(path: &str, watch: bool) -> Op {
        Op::Get(GetRequest {
            path: path.to_owned(),
            watch,
        })
    }

    /// Process a request and return the full response list.
    fn submit(storage: &mut KeeperStorage, session: i64, op: Op) -> SessionResponses {
        storage
            .process_request(&request(op), SessionId(session))
            .unwrap()
    }

    /// Process a request and return the requester's own response (the last
    /// one emitted).
    fn reply(storage: &mut KeeperStorage, session: i64, op: Op) -> Response {
        let mut responses = submit(storage, session, op);
        let (session_id, response) = responses.pop().unwrap();
        assert_eq!(session_id, SessionId(session));
        response
    }

    #[test]
    fn create_then_get_roundtrip() {
        let mut storage = storage();

        let created = reply(&mut storage, 1, create_op("/d", b"hello", CreateMode::Persistent));
        assert_eq!(created.error, ErrorCode::Ok);
        match created.body {
            ResponseBody::Create(body) => assert_eq!(body.path_created, "/d"),
            other => panic!("unexpected body {:?}", other),
        }

        let fetched = reply(&mut storage, 1, get_op("/d", false));
        assert_eq!(fetched.error, ErrorCode::Ok);
        match fetched.body {
            ResponseBody::Get(body) => {
                assert_eq!(body.data, b"hello".to_vec());
                assert_eq!(body.stat.data_length, 5);
                assert_eq!(body.stat.version, Version(0));
                assert_eq!(body.stat.czxid, created.zxid);
            }
            other => panic!("unexpected body {:?}", other),
        }
        storage.assert_consistent();
    }

    #[test]
    fn zxid_grows_with_every_request() {
        let mut storage = storage();

        let first = reply(&mut storage, 1, create_op("/a", b"", CreateMode::Persistent));
        let heartbeat = reply(&mut storage, 1, Op::Heartbeat);
        let second = reply(&mut storage, 1, create_op("/b", b"", CreateMode::Persistent));

        assert_eq!(heartbeat.body, ResponseBody::Heartbeat);
        assert!(first.zxid < heartbeat.zxid);
        assert!(heartbeat.zxid < second.zxid);
        assert_eq!(storage.zxid(), Zxid(second.zxid.0 + 1));
    }

    #[test]
    fn ephemeral_nodes_die_with_their_session() {
        let mut storage = storage();

        reply(&mut storage, 7, create_op("/e", b"", CreateMode::Ephemeral));
        let watcher = reply(&mut storage, 8, exists_op("/e", true));
        assert_eq!(watcher.error, ErrorCode::Ok);

        let responses = submit(&mut storage, 7, Op::Close);
        assert_eq!(responses.len(), 2);
        let (watcher_session, notification) = &responses[0];
        assert_eq!(*watcher_session, SessionId(8));
        assert_eq!(notification.xid, Xid(-1));
        assert_eq!(notification.zxid, Zxid(-1));
        match &notification.body {
            ResponseBody::Watch(event) => {
                assert_eq!(event.typ, WatcherEventType::NodeDeleted);
                assert_eq!(event.state, KeeperState::SyncConnected);
                assert_eq!(event.path, "/e");
            }
            other => panic!("unexpected body {:?}", other),
        }
        let (closer_session, close) = &responses[1];
        assert_eq!(*closer_session, SessionId(7));
        assert_eq!(close.body, ResponseBody::Close);

        let gone = reply(&mut storage, 8, exists_op("/e", false));
        assert_eq!(gone.error, ErrorCode::NoNode);
        storage.assert_consistent();
    }

    #[test]
    fn close_restores_parent_bookkeeping() {
        let mut storage = storage();

        reply(&mut storage, 1, create_op("/parent", b"", CreateMode::Persistent));
        reply(&mut storage, 5, create_op("/parent/e", b"", CreateMode::Ephemeral));
        assert_eq!(storage.container.get("/parent").unwrap().stat.num_children, 1);

        submit(&mut storage, 5, Op::Close);

        let parent = storage.container.get("/parent").unwrap();
        assert_eq!(parent.stat.num_children, 0);
        assert_eq!(parent.stat.cversion, Version(2));
        storage.assert_consistent();
    }

    #[test]
    fn exists_watch_on_missing_node_fires_on_create() {
        let mut storage = storage();

        let missing = reply(&mut storage, 8, exists_op("/k", true));
        assert_eq!(missing.error, ErrorCode::NoNode);

        let responses = submit(&mut storage, 1, create_op("/k", b"", CreateMode::Persistent));
        assert_eq!(responses.len(), 2);
        let (watcher_session, notification) = &responses[0];
        assert_eq!(*watcher_session, SessionId(8));
        match &notification.body {
            ResponseBody::Watch(event) => {
                assert_eq!(event.typ, WatcherEventType::NodeCreated);
                assert_eq!(event.path, "/k");
            }
            other => panic!("unexpected body {:?}", other),
        }
        storage.assert_consistent();
    }

    #[test]
    fn watches_fire_exactly_once() {
        let mut storage = storage();

        reply(&mut storage, 1, create_op("/w", b"", CreateMode::Persistent));
        reply(&mut storage, 2, get_op("/w", true));

        let first_set = submit(
            &mut storage,
            1,
            Op::Set(SetRequest {
                path: "/w".to_owned(),
                data: b"1".to_vec(),
                version: ANY_VERSION,
            }),
        );
        assert_eq!(first_set.len(), 2);
        assert_eq!(first_set[0].0, SessionId(2));

        let second_set = submit(
            &mut storage,
            1,
            Op::Set(SetRequest {
                path: "/w".to_owned(),
                data: b"2".to_vec(),
                version: ANY_VERSION,
            }),
        );
        assert_eq!(second_set.len(), 1, "fired watch must not fire again");
        storage.assert_consistent();
    }

    #[test]
    fn set_fires_data_watch_but_not_child_watch() {
        let mut storage = storage();

        reply(&mut storage, 1, create_op("/a", b"", CreateMode::Persistent));
        reply(&mut storage, 1, create_op("/a/n", b"", CreateMode::Persistent));
        reply(&mut storage, 2, get_op("/a/n", true));
        reply(
            &mut storage,
            3,
            Op::List(ListRequest {
                path: "/a".to_owned(),
                watch: true,
            }),
        );

        let responses = submit(
            &mut storage,
            1,
            Op::Set(SetRequest {
                path: "/a/n".to_owned(),
                data: b"x".to_vec(),
                version: ANY_VERSION,
            }),
        );
        let notified: Vec<SessionId> = responses[..responses.len() - 1]
            .iter()
            .map(|(session, _)| *session)
            .collect();
        assert_eq!(notified, vec![SessionId(2)]);
        storage.assert_consistent();
    }

    #[test]
    fn child_watch_fires_on_create_and_remove() {
        let mut storage = storage();

        reply(&mut storage, 1, create_op("/a", b"", CreateMode::Persistent));
        reply(
            &mut storage,
            3,
            Op::List(ListRequest {
                path: "/a".to_owned(),
                watch: true,
            }),
        );

        let responses = submit(&mut storage, 1, create_op("/a/n", b"", CreateMode::Persistent));
        assert_eq!(responses.len(), 2);
        let (watcher_session, notification) = &responses[0];
        assert_eq!(*watcher_session, SessionId(3));
        match &notification.body {
            ResponseBody::Watch(event) => {
                assert_eq!(event.typ, WatcherEventType::NodeChildrenChanged);
                assert_eq!(event.path, "/a");
            }
            other => panic!("unexpected body {:?}", other),
        }

        // One-shot: re-arm before the remove.
        reply(
            &mut storage,
            3,
            Op::SimpleList(ListRequest {
                path: "/a".to_owned(),
                watch: true,
            }),
        );
        let responses = submit(
            &mut storage,
            1,
            Op::Remove(RemoveRequest {
                path: "/a/n".to_owned(),
                version: ANY_VERSION,
            }),
        );
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].0, SessionId(3));
        storage.assert_consistent();
    }

    #[test]
    fn failed_watched_read_answers_not_watching() {
        let mut storage = storage();

        let responses = submit(&mut storage, 4, get_op("/nowhere", true));
        assert_eq!(responses.len(), 2);

        let (session, notification) = &responses[0];
        assert_eq!(*session, SessionId(4));
        assert_eq!(notification.xid, Xid(-1));
        assert_eq!(notification.error, ErrorCode::NoNode);
        match &notification.body {
            ResponseBody::Watch(event) => {
                assert_eq!(event.typ, WatcherEventType::NotWatching);
                assert_eq!(event.path, "/nowhere");
            }
            other => panic!("unexpected body {:?}", other),
        }

        let (_, response) = &responses[1];
        assert_eq!(response.error, ErrorCode::NoNode);
        assert!(storage.watches.is_empty());
        storage.assert_consistent();
    }

    #[test]
    fn multi_fires_watch_events_in_sub_order() {
        let mut storage = storage();

        reply(&mut storage, 2, exists_op("/m1", true));
        reply(&mut storage, 3, exists_op("/m2", true));

        let multi = Op::Multi(MultiRequest {
            requests: vec![
                create_op("/m1", b"", CreateMode::Persistent),
                create_op("/m2", b"", CreateMode::Persistent),
            ],
        });
        let responses = submit(&mut storage, 1, multi);
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].0, SessionId(2));
        assert_eq!(responses[1].0, SessionId(3));
        assert_eq!(responses[2].0, SessionId(1));
        storage.assert_consistent();
    }

    #[test]
    fn failed_multi_leaves_watches_unfired() {
        let mut storage = storage();

        reply(&mut storage, 2, exists_op("/m1", true));
        let multi = Op::Multi(MultiRequest {
            requests: vec![
                create_op("/m1", b"", CreateMode::Persistent),
                Op::Check(CheckRequest {
                    path: "/absent".to_owned(),
                    version: ANY_VERSION,
                    watch: false,
                }),
            ],
        });

        let responses = submit(&mut storage, 1, multi);
        // No notification: the create was rolled back.
        assert_eq!(responses.len(), 1);
        assert!(!storage.container.contains_key("/m1"));
        assert!(storage.watches.contains_key("/m1"));
        storage.assert_consistent();
    }

    #[test]
    fn close_discards_the_sessions_watches() {
        let mut storage = storage();

        reply(&mut storage, 1, create_op("/a", b"", CreateMode::Persistent));
        reply(&mut storage, 6, get_op("/a", true));
        reply(
            &mut storage,
            6,
            Op::List(ListRequest {
                path: "/a".to_owned(),
                watch: true,
            }),
        );

        submit(&mut storage, 6, Op::Close);
        assert!(storage.watches.is_empty());
        assert!(storage.list_watches.is_empty());

        // Nothing left to fire.
        let responses = submit(
            &mut storage,
            1,
            Op::Set(SetRequest {
                path: "/a".to_owned(),
                data: b"x".to_vec(),
                version: ANY_VERSION,
            }),
        );
        assert_eq!(responses.len(), 1);
        storage.assert_consistent();
    }

    #[test]
    fn finalize_expires_outstanding_watches() {
        let mut storage = storage();

        reply(&mut storage, 1, create_op("/k", b"", CreateMode::Persistent));
        reply(&mut storage, 1, get_op("/k", true));

        let responses = storage.finalize(Vec::new()).unwrap();
        assert_eq!(responses.len(), 1);
        let (session, notification) = &responses[0];
        assert_eq!(*session, SessionId(1));
        assert_eq!(notification.error, ErrorCode::SessionExpired);
        match &notification.body {
            ResponseBody::Watch(event) => {
                assert_eq!(event.typ, WatcherEventType::Session);
                assert_eq!(event.state, KeeperState::Expired);
            }
            other => panic!("unexpected body {:?}", other),
        }

        assert!(storage.finalize(Vec::new()).is_err());
    }

    #[test]
    fn finalize_answers_expired_requests_in_kind() {
        let mut storage = storage();

        let pending = Request {
            xid: Xid(17),
            op: get_op("/whatever", false),
        };
        let responses = storage.finalize(vec![(SessionId(9), pending)]).unwrap();
        assert_eq!(responses.len(), 1);
        let (session, response) = &responses[0];
        assert_eq!(*session, SessionId(9));
        assert_eq!(response.xid, Xid(17));
        assert_eq!(response.error, ErrorCode::SessionExpired);
        match &response.body {
            ResponseBody::Get(body) => assert_eq!(body.data, Vec::<u8>::new()),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn multi_rollback_through_the_facade() {
        let mut storage = storage();

        reply(&mut storage, 1, create_op("/x", b"orig", CreateMode::Persistent));
        let multi = Op::Multi(MultiRequest {
            requests: vec![
                Op::Set(SetRequest {
                    path: "/x".to_owned(),
                    data: b"a".to_vec(),
                    version: Version(0),
                }),
                create_op("/x/child", b"v", CreateMode::Persistent),
                Op::Check(CheckRequest {
                    path: "/x".to_owned(),
                    version: Version(5),
                    watch: false,
                }),
            ],
        });

        let response = reply(&mut storage, 1, multi);
        let responses = match response.body {
            ResponseBody::Multi(multi) => multi.responses,
            other => panic!("unexpected body {:?}", other),
        };
        assert_eq!(responses[2].error, ErrorCode::BadVersion);

        let node = storage.container.get("/x").unwrap();
        assert_eq!(node.stat.version, Version(0));
        assert_eq!(node.data, b"orig".to_vec());
        assert!(!storage.container.contains_key("/x/child"));
        storage.assert_consistent();
    }

    //----- Property tests

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["/a", "/b", "/a/x", "/a/y", "/b/z", "/missing"])
            .prop_map(str::to_owned)
    }

    fn mode_strategy() -> impl Strategy<Value = CreateMode> {
        prop::sample::select(vec![
            CreateMode::Persistent,
            CreateMode::Ephemeral,
            CreateMode::PersistentSequential,
            CreateMode::EphemeralSequential,
        ])
    }

    fn version_strategy() -> impl Strategy<Value = Version> {
        prop::sample::select(vec![-1i32, 0, 1, 2]).prop_map(Version)
    }

    /// Operations legal inside a multi.
    fn sub_op_strategy() -> impl Strategy<Value = Op> {
        let data = prop::collection::vec(any::<u8>(), 0..4);
        prop_oneof![
            (path_strategy(), data.clone(), mode_strategy()).prop_map(|(path, data, flags)| {
                Op::Create(CreateRequest { path, data, flags })
            }),
            (path_strategy(), version_strategy())
                .prop_map(|(path, version)| Op::Remove(RemoveRequest { path, version })),
            (path_strategy(), data, version_strategy()).prop_map(|(path, data, version)| {
                Op::Set(SetRequest {
                    path,
                    data,
                    version,
                })
            }),
            (path_strategy(), version_strategy()).prop_map(|(path, version)| {
                Op::Check(CheckRequest {
                    path,
                    version,
                    watch: false,
                })
            }),
        ]
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => sub_op_strategy(),
            1 => (path_strategy(), any::<bool>())
                .prop_map(|(path, watch)| Op::Exists(ExistsRequest { path, watch })),
            1 => (path_strategy(), any::<bool>())
                .prop_map(|(path, watch)| Op::Get(GetRequest { path, watch })),
            1 => (path_strategy(), any::<bool>())
                .prop_map(|(path, watch)| Op::List(ListRequest { path, watch })),
            1 => prop::collection::vec(sub_op_strategy(), 1..4)
                .prop_map(|requests| Op::Multi(MultiRequest { requests })),
            1 => Just(Op::Heartbeat),
            1 => Just(Op::Close),
        ]
    }

    proptest! {
        /// Whatever sequence of requests comes in, the structural invariants
        /// hold after every step and a failed multi leaves no trace.
        #[test]
        fn any_request_sequence_keeps_the_tree_consistent(
            steps in prop::collection::vec((1i64..4, op_strategy()), 1..30)
        ) {
            let mut storage = storage();
            for (session, op) in steps {
                let snapshot = match op {
                    Op::Multi(_) => {
                        Some((storage.container.clone(), storage.ephemerals.clone()))
                    }
                    _ => None,
                };

                let responses = storage
                    .process_request(&request(op), SessionId(session))
                    .unwrap();
                storage.assert_consistent();

                if let Some((container, ephemerals)) = snapshot {
                    let (_, response) = responses.last().unwrap();
                    if let ResponseBody::Multi(multi) = &response.body {
                        let failed =
                            multi.responses.iter().any(|sub| sub.error != ErrorCode::Ok);
                        if failed {
                            prop_assert_eq!(&storage.container, &container);
                            prop_assert_eq!(&storage.ephemerals, &ephemerals);
                        }
                    }
                }
            }
        }

        /// Versions observed through Set strictly increase.
        #[test]
        fn set_versions_strictly_increase(count in 1usize..8) {
            let mut storage = storage();
            reply(&mut storage, 1, create_op("/v", b"", CreateMode::Persistent));

            let mut last = Version(0);
            for i in 0..count {
                let response = reply(&mut storage, 1, Op::Set(SetRequest {
                    path: "/v".to_owned(),
                    data: vec![i as u8],
                    version: ANY_VERSION,
                }));
                match response.body {
                    ResponseBody::Set(body) => {
                        prop_assert!(body.stat.version > last);
                        last = body.stat.version;
                    }
                    other => panic!("unexpected body {:?}", other),
                }
            }
        }
    }
}
