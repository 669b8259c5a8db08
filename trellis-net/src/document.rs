//! Document orchestration.
//!
//! One document = one actor task. Every runtime callback, socket
//! attach/detach, inbound frame, load, and dispose flows through a
//! single command channel and is processed sequentially, which is the
//! whole concurrency story: visible-set mutation needs no locking
//! because nothing about one document is ever concurrent.
//!
//! Reload lifecycle: `Unloaded → Loading → Loaded → Reloading → Loaded →
//! Disposed`. A reload retains the canonical tree and every session,
//! tears the old runtime down, and on the new instance's first snapshot
//! runs the reload differ and replays the resulting mutations through
//! the ordinary per-session diff path. Messages from a torn-down
//! instance are dropped by generation tag. Sockets attaching and remote
//! events arriving mid-load are queued, never dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use trellis_core::diff::{apply_mutation, resync_view, snapshot_view};
use trellis_core::reload::{diff_snapshots, replay};
use trellis_core::subjectivity::ConnectionId;
use trellis_core::tree::{NodeSnapshot, NodeStore};
use trellis_core::RawMutation;

use crate::protocol::{ClientMessage, InboundFrame, OutboundFrame, ProtocolVersion, ServerMessage};
use crate::runtime::{DomRuntimeFactory, DomRuntimeMessage, ObservableDom, RemoteEvent};
use crate::session::Session;

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Heartbeat cadence for `ping` messages carrying document time.
    pub ping_interval: Duration,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
        }
    }
}

pub(crate) enum Command {
    Runtime {
        instance: Uuid,
        message: DomRuntimeMessage,
    },
    Attach {
        session_id: u64,
        version: ProtocolVersion,
        outbound: UnboundedSender<OutboundFrame>,
    },
    Frame {
        session_id: u64,
        frame: InboundFrame,
    },
    Detach {
        session_id: u64,
    },
    Load {
        source: String,
    },
    Dispose,
}

/// Pre-tagged channel a runtime instance reports through. The tag pins
/// messages to the instance generation that produced them; a disposed
/// instance flushing late callbacks is silently discarded.
#[derive(Clone)]
pub struct RuntimeSender {
    instance: Uuid,
    commands: UnboundedSender<Command>,
}

impl RuntimeSender {
    pub fn send(&self, message: DomRuntimeMessage) {
        // A closed channel means the document is gone; late runtime
        // callbacks are expected then.
        let _ = self.commands.send(Command::Runtime {
            instance: self.instance,
            message,
        });
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }
}

/// Handle to a live synchronized document. Cheap to clone; all methods
/// enqueue onto the document's actor.
///
/// Operations on a disposed document panic: a disposed document still
/// receiving traffic is a collaborator bug, not a recoverable state.
#[derive(Clone)]
pub struct NetworkedDocument {
    commands: UnboundedSender<Command>,
    next_session_id: Arc<AtomicU64>,
}

impl NetworkedDocument {
    /// Start a document with a single live instance loaded from
    /// `source`.
    pub fn new(factory: Arc<dyn DomRuntimeFactory>, config: DocumentConfig, source: &str) -> Self {
        let doc = Self::spawn(factory, config);
        doc.command(Command::Load {
            source: source.to_string(),
        });
        doc
    }

    fn spawn(factory: Arc<dyn DomRuntimeFactory>, config: DocumentConfig) -> Self {
        let (commands, receiver) = unbounded_channel();
        let actor = DocumentActor::new(factory, config, commands.clone());
        tokio::spawn(actor.run(receiver));
        Self {
            commands,
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a socket that finished subprotocol negotiation. Returns
    /// the session id used for subsequent frames. The snapshot is sent
    /// once the document is loaded (immediately, if it already is).
    pub fn attach_socket(
        &self,
        version: ProtocolVersion,
        outbound: UnboundedSender<OutboundFrame>,
    ) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.command(Command::Attach {
            session_id,
            version,
            outbound,
        });
        session_id
    }

    pub fn receive_frame(&self, session_id: u64, frame: InboundFrame) {
        self.command(Command::Frame { session_id, frame });
    }

    pub fn detach_socket(&self, session_id: u64) {
        self.command(Command::Detach { session_id });
    }

    /// Terminal. Tears down the runtime and every session.
    pub fn dispose(&self) {
        self.command(Command::Dispose);
    }

    pub(crate) fn command(&self, command: Command) {
        self.commands
            .send(command)
            .unwrap_or_else(|_| panic!("operation on a disposed document"));
    }

    /// Transport-side variant: a socket racing a dispose is normal, not
    /// a collaborator bug. Returns whether the document was still live.
    pub(crate) fn try_command(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// A [`NetworkedDocument`] whose source can be hot-replaced. Existing
/// connections survive a [`load`](Self::load): each receives the
/// minimal diff between what it saw and the new document.
#[derive(Clone)]
pub struct EditableNetworkedDocument {
    inner: NetworkedDocument,
}

impl EditableNetworkedDocument {
    /// Start unloaded; call [`load`](Self::load) to bring up the first
    /// instance.
    pub fn new(factory: Arc<dyn DomRuntimeFactory>, config: DocumentConfig) -> Self {
        Self {
            inner: NetworkedDocument::spawn(factory, config),
        }
    }

    /// Load or hot-replace the document source.
    pub fn load(&self, source: impl Into<String>) {
        self.inner.command(Command::Load {
            source: source.into(),
        });
    }

    pub fn document(&self) -> &NetworkedDocument {
        &self.inner
    }

    pub fn attach_socket(
        &self,
        version: ProtocolVersion,
        outbound: UnboundedSender<OutboundFrame>,
    ) -> u64 {
        self.inner.attach_socket(version, outbound)
    }

    pub fn receive_frame(&self, session_id: u64, frame: InboundFrame) {
        self.inner.receive_frame(session_id, frame);
    }

    pub fn detach_socket(&self, session_id: u64) {
        self.inner.detach_socket(session_id);
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unloaded,
    Loading,
    Loaded,
    Reloading,
    Disposed,
}

struct DocumentActor {
    factory: Arc<dyn DomRuntimeFactory>,
    config: DocumentConfig,
    commands: UnboundedSender<Command>,
    state: Lifecycle,
    store: NodeStore,
    runtime: Option<Box<dyn ObservableDom>>,
    instance: Option<Uuid>,
    sessions: HashMap<u64, Session>,
    /// Sockets that attached before the (re)loaded instance produced
    /// its first snapshot.
    pending_sessions: Vec<(u64, ProtocolVersion, UnboundedSender<OutboundFrame>)>,
    /// Remote events held back during a reload.
    pending_events: Vec<(u64, ClientMessage)>,
    /// Visible tree of the previous instance, retained across a reload
    /// for the differ.
    old_root: Option<NodeSnapshot>,
    document_time: u64,
    ping_id: u64,
}

impl DocumentActor {
    fn new(
        factory: Arc<dyn DomRuntimeFactory>,
        config: DocumentConfig,
        commands: UnboundedSender<Command>,
    ) -> Self {
        Self {
            factory,
            config,
            commands,
            state: Lifecycle::Unloaded,
            store: NodeStore::new(),
            runtime: None,
            instance: None,
            sessions: HashMap::new(),
            pending_sessions: Vec::new(),
            pending_events: Vec::new(),
            old_root: None,
            document_time: 0,
            ping_id: 0,
        }
    }

    async fn run(mut self, mut receiver: UnboundedReceiver<Command>) {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // immediate first tick carries no heartbeat
        loop {
            tokio::select! {
                command = receiver.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command) {
                        break;
                    }
                }
                _ = ping.tick() => self.send_ping(),
            }
        }
    }

    /// Returns `false` when the actor should stop (dispose).
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Load { source } => self.begin_load(source),
            Command::Runtime { instance, message } => {
                if self.instance != Some(instance) {
                    log::debug!("dropping message from stale runtime instance {instance}");
                } else {
                    self.on_runtime_message(message);
                }
            }
            Command::Attach {
                session_id,
                version,
                outbound,
            } => self.on_attach(session_id, version, outbound),
            Command::Frame { session_id, frame } => self.on_frame(session_id, frame),
            Command::Detach { session_id } => {
                self.pending_sessions.retain(|(id, _, _)| *id != session_id);
                if self.sessions.remove(&session_id).is_some() {
                    log::info!("session {session_id} detached");
                }
            }
            Command::Dispose => {
                if let Some(mut runtime) = self.runtime.take() {
                    runtime.dispose();
                }
                self.sessions.clear();
                self.pending_sessions.clear();
                self.pending_events.clear();
                self.state = Lifecycle::Disposed;
                log::info!("document disposed");
                return false;
            }
        }
        true
    }

    fn begin_load(&mut self, source: String) {
        assert!(
            self.state != Lifecycle::Disposed,
            "load on a disposed document"
        );
        if self.state == Lifecycle::Loaded {
            let tree = self
                .store
                .snapshot_tree()
                .unwrap_or_else(|e| panic!("loaded document has no canonical tree: {e}"));
            self.old_root = Some(tree);
        }
        if let Some(mut runtime) = self.runtime.take() {
            runtime.dispose();
        }
        self.state = if self.old_root.is_some() {
            Lifecycle::Reloading
        } else {
            Lifecycle::Loading
        };
        let instance = Uuid::new_v4();
        self.instance = Some(instance);
        log::info!("starting runtime instance {instance}");
        let sender = RuntimeSender {
            instance,
            commands: self.commands.clone(),
        };
        self.runtime = Some(self.factory.spawn(&source, sender));
    }

    fn on_runtime_message(&mut self, message: DomRuntimeMessage) {
        match message {
            DomRuntimeMessage::Snapshot {
                root,
                document_time,
            } => self.on_snapshot(root, document_time),
            DomRuntimeMessage::Mutation(raw) => self.on_mutation(raw),
            DomRuntimeMessage::DocumentTime(time) => {
                self.document_time = time;
                for session in self.sessions.values_mut() {
                    session.queue(ServerMessage::DocumentTime {
                        document_time: time,
                    });
                    session.flush();
                }
            }
            DomRuntimeMessage::Log { level, message } => {
                log::log!(level, "document: {message}");
            }
        }
    }

    fn on_snapshot(&mut self, root: NodeSnapshot, document_time: u64) {
        self.document_time = document_time;
        match self.state {
            Lifecycle::Loading => {
                self.store.load_snapshot(&root);
                self.state = Lifecycle::Loaded;
                log::info!("document loaded, {} nodes", self.store.node_count());
                let ids: Vec<u64> = self.sessions.keys().copied().collect();
                for session_id in ids {
                    self.send_fresh_snapshot(session_id);
                }
                self.drain_queues();
            }
            Lifecycle::Reloading => {
                let before = self
                    .old_root
                    .take()
                    .unwrap_or_else(|| panic!("reloading without a retained tree"));
                let diff = diff_snapshots(&before, &root);
                let mutations = replay(&mut self.store, &diff)
                    .unwrap_or_else(|e| panic!("reload replay diverged from canonical tree: {e}"));
                log::info!(
                    "reload: {} ops, {} id remappings",
                    diff.ops.len(),
                    diff.remappings.len()
                );
                let root_id = self.store.root().expect("replayed tree has a root");
                for session in self.sessions.values_mut() {
                    let mut produced = false;
                    for mutation in &mutations {
                        match apply_mutation(&self.store, &mut session.view, mutation) {
                            Ok(Some(diff)) => {
                                session.queue_diff(diff);
                                produced = true;
                            }
                            Ok(None) => {}
                            Err(e) => panic!("session view diverged during reload: {e}"),
                        }
                    }
                    if produced {
                        session.queue(ServerMessage::DocumentTime { document_time });
                    } else {
                        // Nothing visible changed; the document time still
                        // rides along on an empty children diff.
                        session.queue(ServerMessage::ChildrenChanged {
                            node_id: root_id,
                            previous_node_id: None,
                            added: vec![],
                            removed: vec![],
                            document_time: Some(document_time),
                        });
                    }
                    session.flush();
                }
                self.state = Lifecycle::Loaded;
                self.drain_queues();
            }
            Lifecycle::Loaded => {
                log::warn!("ignoring unexpected extra snapshot from the live instance");
            }
            Lifecycle::Unloaded | Lifecycle::Disposed => {
                panic!("snapshot delivered to a document in {:?} state", self.state)
            }
        }
    }

    fn on_mutation(&mut self, raw: RawMutation) {
        assert!(
            self.state == Lifecycle::Loaded,
            "runtime sent a mutation before its first snapshot"
        );
        let mutation = self
            .store
            .apply_raw(&raw)
            .unwrap_or_else(|e| panic!("canonical tree diverged: {e}"));
        for session in self.sessions.values_mut() {
            match apply_mutation(&self.store, &mut session.view, &mutation) {
                Ok(Some(diff)) => {
                    session.queue_diff(diff);
                    session.flush();
                }
                Ok(None) => {}
                Err(e) => panic!("session view diverged: {e}"),
            }
        }
    }

    fn on_attach(
        &mut self,
        session_id: u64,
        version: ProtocolVersion,
        outbound: UnboundedSender<OutboundFrame>,
    ) {
        assert!(
            self.state != Lifecycle::Disposed,
            "socket attached to a disposed document"
        );
        if self.state == Lifecycle::Loaded {
            self.register_session(session_id, version, outbound);
        } else {
            log::debug!("queueing session {session_id} until the document loads");
            self.pending_sessions.push((session_id, version, outbound));
        }
    }

    fn register_session(
        &mut self,
        session_id: u64,
        version: ProtocolVersion,
        outbound: UnboundedSender<OutboundFrame>,
    ) {
        let session = Session::new(session_id, version, outbound);
        self.sessions.insert(session_id, session);
        log::info!(
            "session {session_id} attached ({})",
            version.subprotocol()
        );
        self.send_fresh_snapshot(session_id);
    }

    fn send_fresh_snapshot(&mut self, session_id: u64) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let root = snapshot_view(&self.store, &mut session.view)
            .unwrap_or_else(|e| panic!("snapshot of canonical tree failed: {e}"));
        session.queue(ServerMessage::Snapshot {
            root,
            document_time: self.document_time,
        });
        session.flush();
    }

    fn drain_queues(&mut self) {
        let pending = std::mem::take(&mut self.pending_sessions);
        for (session_id, version, outbound) in pending {
            self.register_session(session_id, version, outbound);
        }
        let events = std::mem::take(&mut self.pending_events);
        for (session_id, message) in events {
            self.on_client_message(session_id, message);
        }
    }

    fn on_frame(&mut self, session_id: u64, frame: InboundFrame) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            log::debug!("frame for unknown session {session_id}");
            return;
        };
        let messages = match session.decode(&frame) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("session {session_id} sent a malformed frame: {e}");
                session.queue(ServerMessage::Warning {
                    message: format!("malformed frame: {e}"),
                });
                session.flush();
                return;
            }
        };
        for message in messages {
            self.on_client_message(session_id, message);
        }
    }

    fn on_client_message(&mut self, session_id: u64, message: ClientMessage) {
        match message {
            ClientMessage::ConnectUsers { connection_ids } => {
                self.connect_users(session_id, connection_ids)
            }
            ClientMessage::DisconnectUsers { connection_ids } => {
                self.disconnect_users(session_id, connection_ids)
            }
            event @ ClientMessage::Event { .. } => self.client_event(session_id, event),
            ClientMessage::Pong { ping_id } => {
                log::trace!("session {session_id} pong {ping_id}");
            }
        }
    }

    fn connect_users(&mut self, session_id: u64, connection_ids: Vec<ConnectionId>) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let mut seen = BTreeSet::new();
        for id in &connection_ids {
            if !seen.insert(*id) || session.view.external_ids.contains(id) {
                log::warn!("session {session_id}: connection id {id} already connected");
                session.queue(ServerMessage::Error {
                    message: format!("connection id {id} is already connected"),
                });
                session.flush();
                return;
            }
        }
        session.view.external_ids.extend(connection_ids);
        match resync_view(&self.store, &mut session.view) {
            Ok(diffs) => {
                for diff in diffs {
                    session.queue_diff(diff);
                }
                session.flush();
            }
            Err(e) => panic!("session view diverged on connectUsers: {e}"),
        }
    }

    fn disconnect_users(&mut self, session_id: u64, connection_ids: Vec<ConnectionId>) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        for id in &connection_ids {
            if !session.view.external_ids.contains(id) {
                log::warn!("session {session_id}: connection id {id} is not connected");
                session.queue(ServerMessage::Error {
                    message: format!("connection id {id} is not connected"),
                });
                session.flush();
                return;
            }
        }
        for id in &connection_ids {
            session.view.external_ids.remove(id);
        }
        match resync_view(&self.store, &mut session.view) {
            Ok(diffs) => {
                for diff in diffs {
                    session.queue_diff(diff);
                }
                session.flush();
            }
            Err(e) => panic!("session view diverged on disconnectUsers: {e}"),
        }
    }

    fn client_event(&mut self, session_id: u64, message: ClientMessage) {
        if self.state == Lifecycle::Reloading {
            // Reload race: hold the event until the new instance is up.
            self.pending_events.push((session_id, message));
            return;
        }
        assert!(
            self.state == Lifecycle::Loaded,
            "remote event dispatched to a document that was never loaded"
        );
        let ClientMessage::Event {
            connection_id,
            node_id,
            name,
            bubbles,
            params,
        } = message
        else {
            unreachable!("client_event only receives events");
        };
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !session.view.external_ids.contains(&connection_id) {
            session.queue(ServerMessage::Warning {
                message: format!("event from unconnected connection id {connection_id}"),
            });
            session.flush();
            return;
        }
        if !session.view.can_reference(node_id) {
            log::warn!(
                "session {session_id} event references node {node_id} outside its view"
            );
            session.queue(ServerMessage::Warning {
                message: format!("event references unknown node {node_id}"),
            });
            session.flush();
            return;
        }
        let event = RemoteEvent {
            node_id: self.store.resolve_outbound(node_id),
            name,
            bubbles,
            params,
        };
        self.runtime
            .as_mut()
            .unwrap_or_else(|| panic!("loaded document without a runtime instance"))
            .dispatch_remote_event(connection_id, event);
    }

    fn send_ping(&mut self) {
        if self.state != Lifecycle::Loaded {
            return;
        }
        self.ping_id += 1;
        for session in self.sessions.values_mut() {
            session.queue(ServerMessage::Ping {
                ping_id: self.ping_id,
                document_time: self.document_time,
            });
            session.flush();
        }
    }
}
