// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! The coordinator facade.
//!
//! One coordinator owns one node's replication state: peer registry,
//! channel aggregates, entry store, clocks and the two protocol state
//! machines. All mutation is serialized through a single lock held for
//! the duration of a message handler, so the engine behaves like a
//! single logical event loop regardless of how many tasks feed it.
//!
//! Lifecycle: stopped → running ⇄ paused → stopped → disposed. While
//! paused, inbound frames are buffered (bounded) and processed on
//! resume. Disposed is terminal.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt as _};
use parking_lot::Mutex;
use rand::{seq::IteratorRandom as _, Rng as _};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use weft_async::{Spawner, Task};

use crate::{
    channel::{Channel, Materializer, Retention, State as MaterializedState},
    clock::{self, Anchored, Clock},
    config::Config,
    ident::{ChannelId, NodeId, StreamId},
    log::Entry,
    net::{
        codec::{self, Message},
        transport::{Inbound, Priority, Transport},
    },
    peer::{Registry, Status, Traffic},
    protocol::{
        error::SyncError,
        event::Event,
        phone::Phone,
        swim::{self, Detector},
        sync,
    },
    rtt::{Timings, Tracker},
    storage::{self, Storage},
    store::EntryStore,
};

#[derive(Debug, Error)]
pub enum Error {
    /// The coordinator was disposed; it cannot be used again.
    #[error("coordinator is disposed")]
    Disposed,

    /// Constructed outside an async runtime.
    #[error("no async runtime available")]
    NoRuntime,

    /// The local node cannot be registered as its own peer.
    #[error("local node cannot be its own peer")]
    LocalPeer,

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// The hybrid logical clock overflowed: the wall clock is stuck.
    #[error(transparent)]
    Clock(#[from] clock::Error),

    /// Identity could not be resolved from storage at construction.
    #[error(transparent)]
    Storage(#[from] storage::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Running,
    Paused,
    Disposed,
}

/// Snapshot for app-side diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Health {
    pub lifecycle: Lifecycle,
    pub peers_reachable: usize,
    pub peers_suspected: usize,
    pub peers_unreachable: usize,
    pub channels: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceUsage {
    pub entries: usize,
    pub entry_bytes: u64,
    pub pending_sends: u32,
    pub buffered_inbound: usize,
}

/// Sweep cadence for time-bounded retention without traffic.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const SWEEP_JITTER: Duration = Duration::from_secs(5);

enum Control {
    Expired { seq: u32 },
}

/// Everything behind the one big lock.
struct Core {
    lifecycle: Lifecycle,
    registry: Registry,
    channels: sync::Channels,
    store: EntryStore,
    rtt: Tracker,
    detector: Detector<Pcg64Mcg>,
    rng: Pcg64Mcg,
    buffered: VecDeque<Inbound>,
}

#[derive(Default)]
struct Tasks {
    pump: Option<Task<()>>,
    gossip: Option<Task<()>>,
    probe: Option<Task<()>>,
    sweep: Option<Task<()>>,
    timers: HashMap<u32, Task<()>>,
}

/// Side effects computed under the lock, performed after releasing it.
#[derive(Default)]
#[must_use = "actions must be performed"]
struct Actions {
    events: Vec<Event>,
    errors: Vec<SyncError>,
    sends: Vec<(NodeId, Message, Priority)>,
    arms: Vec<(u32, Duration)>,
    persist_incarnation: Option<u64>,
    persist_entries: Vec<(ChannelId, StreamId, Entry)>,
}

impl Actions {
    fn from_swim(out: swim::Output) -> Self {
        let mut actions = Self {
            events: out.transitions.into_iter().map(Event::from).collect(),
            ..Self::default()
        };
        for tock in out.tocks {
            match tock {
                swim::Tock::Send {
                    to,
                    message,
                    priority,
                } => actions.sends.push((to, message, priority)),
                swim::Tock::Arm { seq, after } => actions.arms.push((seq, after)),
                swim::Tock::PersistIncarnation { incarnation } => {
                    actions.persist_incarnation = Some(incarnation)
                },
            }
        }
        actions
    }
}

struct Inner {
    local: NodeId,
    config: Config,
    clock: Clock,
    transport: Arc<dyn Transport>,
    storage: Storage,
    phone: Phone,
    spawner: Spawner,
    control: mpsc::UnboundedSender<Control>,
    core: Mutex<Core>,
    tasks: Mutex<Tasks>,
}

/// The replication engine facade. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Wire up a coordinator. Resolves the local identity (from storage
    /// when present, freshly generated otherwise) and subscribes to the
    /// transport; call [`start`][Self::start] to begin gossiping.
    pub async fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        storage: Storage,
    ) -> Result<Self, Error> {
        let spawner = Spawner::from_current().ok_or(Error::NoRuntime)?;

        let (local, incarnation) = match &storage.local {
            Some(repo) => {
                let id = repo.resolve_node_id().await?;
                let incarnation = repo.load_incarnation().await?;
                (id, incarnation)
            },
            None => (generate_node_id(), 0),
        };

        let seed = rand::random::<u128>();
        let incoming = transport.incoming();
        let (control, control_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            local: local.clone(),
            config,
            clock: Clock::new(Arc::new(Anchored::now())),
            transport,
            storage,
            phone: Phone::new(),
            spawner,
            control,
            core: Mutex::new(Core {
                lifecycle: Lifecycle::Stopped,
                registry: Registry::new(local, incarnation),
                channels: sync::Channels::new(),
                store: EntryStore::new(),
                rtt: Tracker::new(),
                detector: Detector::new(Pcg64Mcg::new(seed)),
                rng: Pcg64Mcg::new(seed.wrapping_add(1)),
                buffered: VecDeque::new(),
            }),
            tasks: Mutex::new(Tasks::default()),
        });

        let pump = inner
            .spawner
            .spawn(pump(inner.clone(), incoming, control_rx));
        inner.tasks.lock().pump = Some(pump);

        Ok(Self { inner })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.inner.local
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.core.lock().lifecycle
    }

    /// Subscribe to domain events. Lossy for slow consumers.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.phone.events()
    }

    /// Subscribe to the errors stream.
    pub fn errors(&self) -> broadcast::Receiver<SyncError> {
        self.inner.phone.errors()
    }

    // ----- lifecycle -------------------------------------------------

    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut core = self.inner.core.lock();
            match core.lifecycle {
                Lifecycle::Disposed => return Err(Error::Disposed),
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped | Lifecycle::Paused => core.lifecycle = Lifecycle::Running,
            }
        }
        tracing::info!("starting");
        self.spawn_schedulers();
        self.drain_buffered().await;
        Ok(())
    }

    /// Suspend processing: schedulers are cancelled, inbound frames are
    /// buffered until [`resume`][Self::resume].
    pub async fn pause(&self) -> Result<(), Error> {
        {
            let mut core = self.inner.core.lock();
            match core.lifecycle {
                Lifecycle::Disposed => return Err(Error::Disposed),
                Lifecycle::Running => {},
                _ => return Ok(()),
            }
            core.lifecycle = Lifecycle::Paused;
            core.detector.reset();
        }
        tracing::info!("pausing");
        self.cancel_schedulers();
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), Error> {
        {
            let mut core = self.inner.core.lock();
            match core.lifecycle {
                Lifecycle::Disposed => return Err(Error::Disposed),
                Lifecycle::Paused => core.lifecycle = Lifecycle::Running,
                _ => return Ok(()),
            }
        }
        tracing::info!("resuming");
        self.spawn_schedulers();
        self.drain_buffered().await;
        Ok(())
    }

    /// Cancel all periodic work and pending probe timers; state is
    /// preserved and [`start`][Self::start] brings the node back.
    pub async fn stop(&self) -> Result<(), Error> {
        {
            let mut core = self.inner.core.lock();
            match core.lifecycle {
                Lifecycle::Disposed => return Err(Error::Disposed),
                Lifecycle::Stopped => return Ok(()),
                _ => core.lifecycle = Lifecycle::Stopped,
            }
            core.detector.reset();
            core.buffered.clear();
        }
        tracing::info!("stopping");
        self.cancel_schedulers();
        Ok(())
    }

    /// Stop and release everything. Terminal: any later operation
    /// fails with [`Error::Disposed`].
    pub async fn dispose(&self) {
        {
            let mut core = self.inner.core.lock();
            if core.lifecycle == Lifecycle::Disposed {
                return;
            }
            core.lifecycle = Lifecycle::Disposed;
            core.detector.reset();
            core.buffered.clear();
        }
        tracing::info!("disposing");
        self.cancel_schedulers();
        self.inner.tasks.lock().pump.take();
        self.inner.transport.close().await;
    }

    // ----- peers -----------------------------------------------------

    pub async fn add_peer(
        &self,
        id: NodeId,
        display_name: Option<String>,
    ) -> Result<(), Error> {
        self.guard()?;

        // restore the last known incarnation so stale suspicions about
        // this peer cannot win after our restart
        let restored = match &self.inner.storage.peers {
            Some(repo) => repo.find_by_id(&id).await.unwrap_or_else(|e| {
                self.emit_storage_error(e);
                None
            }),
            None => None,
        };

        let (added, snapshot) = {
            let mut core = self.inner.core.lock();
            let added = core
                .registry
                .add(id.clone(), display_name)
                .map_err(|_| Error::LocalPeer)?;
            if let (Some(restored), Some(peer)) = (restored, core.registry.get_mut(&id)) {
                peer.incarnation = peer.incarnation.max(restored.incarnation);
                if peer.display_name.is_none() {
                    peer.display_name = restored.display_name;
                }
            }
            (added, core.registry.get(&id).cloned())
        };

        if let (Some(repo), Some(peer)) = (&self.inner.storage.peers, &snapshot) {
            if let Err(e) = repo.save(peer).await {
                self.emit_storage_error(e);
            }
        }
        if added {
            self.inner.phone.emit(Event::PeerAdded(id));
        }
        Ok(())
    }

    pub async fn remove_peer(&self, id: &NodeId) -> Result<(), Error> {
        self.guard()?;

        let removed = {
            let mut core = self.inner.core.lock();
            core.rtt.forget(id);
            core.registry.remove(id).is_some()
        };

        if let Some(repo) = &self.inner.storage.peers {
            if let Err(e) = repo.delete(id).await {
                self.emit_storage_error(e);
            }
        }
        if removed {
            self.inner.phone.emit(Event::PeerRemoved(id.clone()));
        }
        Ok(())
    }

    // ----- channels & streams ---------------------------------------

    /// Create (or restore from storage) a channel. Idempotent.
    pub async fn create_channel(&self, id: ChannelId) -> Result<(), Error> {
        self.guard()?;

        let restored = match &self.inner.storage.channels {
            Some(repo) => repo.find_by_id(&id).await.unwrap_or_else(|e| {
                self.emit_storage_error(e);
                None
            }),
            None => None,
        };
        let was_restored = restored.is_some();

        // hydrate entry logs for restored streams before taking the lock
        let mut hydrated: Vec<(StreamId, Vec<Entry>)> = Vec::new();
        if let (Some(channel), Some(repo)) = (&restored, &self.inner.storage.entries) {
            for stream_id in channel.streams.keys() {
                match repo.get_all(&id, stream_id).await {
                    Ok(entries) => hydrated.push((stream_id.clone(), entries)),
                    Err(e) => self.emit_storage_error(e),
                }
            }
        }

        let (created, snapshot) = {
            let mut core = self.inner.core.lock();
            if core.channels.contains_key(&id) {
                return Ok(());
            }

            let mut channel =
                restored.unwrap_or_else(|| Channel::new(id.clone(), self.inner.local.clone()));
            channel.add_member(self.inner.local.clone());

            for (stream_id, entries) in hydrated {
                let stream = match channel.stream_mut(&stream_id) {
                    None => continue,
                    Some(stream) => stream,
                };
                for entry in entries {
                    stream.version.observe(&entry.author, entry.sequence);
                    let _ = core.store.append(&id, &stream_id, entry);
                }
            }

            core.channels.insert(id.clone(), channel.clone());
            (true, channel)
        };

        if created && !was_restored {
            if let Some(repo) = &self.inner.storage.channels {
                if let Err(e) = repo.save(&snapshot).await {
                    self.emit_storage_error(e);
                }
            }
        }
        self.inner.phone.emit(Event::ChannelCreated(id));
        Ok(())
    }

    /// Remove a channel; its entries are deleted with it.
    pub async fn remove_channel(&self, id: &ChannelId) -> Result<(), Error> {
        self.guard()?;

        let removed = {
            let mut core = self.inner.core.lock();
            let removed = core.channels.remove(id).is_some();
            if removed {
                core.store.clear_channel(id);
            }
            removed
        };
        if !removed {
            return Ok(());
        }

        if let Some(repo) = &self.inner.storage.channels {
            if let Err(e) = repo.delete(id).await {
                self.emit_storage_error(e);
            }
        }
        if let Some(repo) = &self.inner.storage.entries {
            if let Err(e) = repo.clear_channel(id).await {
                self.emit_storage_error(e);
            }
        }
        self.inner.phone.emit(Event::ChannelRemoved(id.clone()));
        Ok(())
    }

    pub async fn add_member(&self, channel: &ChannelId, member: NodeId) -> Result<(), Error> {
        self.guard()?;

        let (added, snapshot) = {
            let mut core = self.inner.core.lock();
            let ch = core
                .channels
                .get_mut(channel)
                .ok_or_else(|| Error::UnknownChannel(channel.clone()))?;
            (ch.add_member(member.clone()), ch.clone())
        };

        if added {
            self.mirror_channel(&snapshot).await;
            self.inner.phone.emit(Event::MemberAdded {
                channel: channel.clone(),
                member,
            });
        }
        Ok(())
    }

    pub async fn remove_member(
        &self,
        channel: &ChannelId,
        member: &NodeId,
    ) -> Result<(), Error> {
        self.guard()?;

        let (removed, snapshot) = {
            let mut core = self.inner.core.lock();
            let ch = core
                .channels
                .get_mut(channel)
                .ok_or_else(|| Error::UnknownChannel(channel.clone()))?;
            (ch.remove_member(member), ch.clone())
        };

        if removed {
            self.mirror_channel(&snapshot).await;
            self.inner.phone.emit(Event::MemberRemoved {
                channel: channel.clone(),
                member: member.clone(),
            });
        }
        Ok(())
    }

    /// Create a stream in a channel. Idempotent; restores persisted
    /// entries when an entry repository is attached.
    pub async fn create_stream(
        &self,
        channel: &ChannelId,
        stream: StreamId,
        retention: Retention,
    ) -> Result<(), Error> {
        self.guard()?;

        let persisted = match &self.inner.storage.entries {
            Some(repo) => repo.get_all(channel, &stream).await.unwrap_or_else(|e| {
                self.emit_storage_error(e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let (created, snapshot) = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            let ch = core
                .channels
                .get_mut(channel)
                .ok_or_else(|| Error::UnknownChannel(channel.clone()))?;
            let created = ch.create_stream(stream.clone(), retention);
            if created && !persisted.is_empty() {
                let st = ch.stream_mut(&stream).expect("stream just created");
                for entry in persisted {
                    st.version.observe(&entry.author, entry.sequence);
                    let _ = core.store.append(channel, &stream, entry);
                }
            }
            (created, ch.clone())
        };

        if created {
            self.mirror_channel(&snapshot).await;
            self.inner.phone.emit(Event::StreamCreated {
                channel: channel.clone(),
                stream,
            });
        }
        Ok(())
    }

    /// Attach a materializer to a stream. Materializers are runtime
    /// state: they do not survive a reload and must be re-registered.
    pub fn register_materializer(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        materializer: Materializer,
    ) -> Result<(), Error> {
        self.guard()?;

        let mut core = self.inner.core.lock();
        let ch = core
            .channels
            .get_mut(channel)
            .ok_or_else(|| Error::UnknownChannel(channel.clone()))?;
        let st = ch
            .stream_mut(stream)
            .ok_or_else(|| Error::UnknownStream(stream.clone()))?;
        st.set_materializer(materializer);
        Ok(())
    }

    // ----- entries ---------------------------------------------------

    /// Append a locally-authored entry.
    ///
    /// `Ok(None)` when the channel or stream does not exist; reported
    /// on the errors stream, per the recoverable-error contract.
    pub async fn append(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        payload: Bytes,
    ) -> Result<Option<Entry>, Error> {
        self.guard()?;
        let now_ms = self.inner.clock.now_ms();

        let (entry, compacted) = {
            let mut core = self.inner.core.lock();
            let local = self.inner.local.clone();

            let retention = core
                .channels
                .get(channel)
                .and_then(|ch| ch.stream(stream))
                .map(|st| st.retention);
            let retention = match retention {
                None => {
                    drop(core);
                    self.inner.phone.emit_error(SyncError::Channel {
                        occurred_at_ms: now_ms,
                        channel: channel.clone(),
                        message: format!("append to unknown channel or stream {stream}"),
                    });
                    return Ok(None);
                },
                Some(retention) => retention,
            };

            let sequence = core.store.latest_sequence(channel, stream, &local) + 1;
            let timestamp = self.inner.clock.tick()?;
            let entry = Entry::new(local.clone(), sequence, timestamp, payload)
                .expect("sequence starts at 1");

            core.store
                .append(channel, stream, entry.clone())
                .expect("sequence validated");
            let ch = core.channels.get_mut(channel).expect("channel exists");
            let st = ch.stream_mut(stream).expect("stream exists");
            st.version.observe(&local, sequence);

            let compacted = core.store.compact(channel, stream, &retention, now_ms);
            (entry, compacted)
        };

        if let Some(repo) = &self.inner.storage.entries {
            if let Err(e) = repo.append(channel, stream, &entry).await {
                self.emit_storage_error(e);
            }
        }
        self.inner.phone.emit(Event::EntryAppended {
            channel: channel.clone(),
            stream: stream.clone(),
            entry: entry.clone(),
        });
        if compacted > 0 {
            self.inner.phone.emit(Event::StreamCompacted {
                channel: channel.clone(),
                stream: stream.clone(),
                removed: compacted,
            });
        }
        Ok(Some(entry))
    }

    /// All entries of a stream in read order. Unknown streams read as
    /// empty.
    pub fn entries(&self, channel: &ChannelId, stream: &StreamId) -> Result<Vec<Entry>, Error> {
        self.guard()?;
        Ok(self.inner.core.lock().store.entries(channel, stream))
    }

    /// Derived state from the stream's materializer, or `None` when no
    /// materializer is registered (or it failed, see errors stream).
    pub fn state(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
    ) -> Result<Option<MaterializedState>, Error> {
        self.guard()?;

        let core = self.inner.core.lock();
        let ch = core
            .channels
            .get(channel)
            .ok_or_else(|| Error::UnknownChannel(channel.clone()))?;
        let st = ch
            .stream(stream)
            .ok_or_else(|| Error::UnknownStream(stream.clone()))?;

        let entries = core.store.entries(channel, stream);
        match st.materialize(entries.iter()) {
            Ok(state) => Ok(state),
            Err(e) => {
                let now_ms = self.inner.clock.now_ms();
                drop(core);
                self.inner.phone.emit_error(SyncError::Transform {
                    occurred_at_ms: now_ms,
                    message: format!("materializer for {channel}/{stream} failed: {e}"),
                });
                Ok(None)
            },
        }
    }

    // ----- diagnostics ----------------------------------------------

    pub fn health(&self) -> Health {
        let core = self.inner.core.lock();
        Health {
            lifecycle: core.lifecycle,
            peers_reachable: core.registry.count_by_status(Status::Reachable),
            peers_suspected: core.registry.count_by_status(Status::Suspected),
            peers_unreachable: core.registry.count_by_status(Status::Unreachable),
            channels: core.channels.len(),
        }
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        let core = self.inner.core.lock();
        let (entries, entry_bytes) = core.store.usage();
        ResourceUsage {
            entries,
            entry_bytes,
            pending_sends: self.inner.transport.total_pending_send_count(),
            buffered_inbound: core.buffered.len(),
        }
    }

    /// Bytes exchanged with `peer` over the sliding traffic window.
    pub fn peer_traffic(&self, peer: &NodeId) -> Option<Traffic> {
        let mut core = self.inner.core.lock();
        core.registry.get(peer)?;
        let now_ms = self.inner.clock.now_ms();
        let window_ms = self.inner.config.traffic_window.as_millis() as u64;
        Some(core.registry.traffic(peer, now_ms, window_ms))
    }

    /// The RTT-derived timings currently in effect.
    pub fn adaptive_timing(&self) -> Timings {
        self.inner.core.lock().rtt.timings()
    }

    pub fn pending_send_count(&self) -> u32 {
        self.inner.transport.total_pending_send_count()
    }

    // ----- internals -------------------------------------------------

    fn guard(&self) -> Result<(), Error> {
        if self.inner.core.lock().lifecycle == Lifecycle::Disposed {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    fn emit_storage_error(&self, e: storage::Error) {
        self.inner.phone.emit_error(SyncError::Storage {
            occurred_at_ms: self.inner.clock.now_ms(),
            message: e.to_string(),
        });
    }

    async fn mirror_channel(&self, channel: &Channel) {
        if let Some(repo) = &self.inner.storage.channels {
            if let Err(e) = repo.save(channel).await {
                self.emit_storage_error(e);
            }
        }
    }

    fn spawn_schedulers(&self) {
        let mut tasks = self.inner.tasks.lock();
        tasks.gossip = Some(
            self.inner
                .spawner
                .spawn(gossip_loop(self.inner.clone())),
        );
        tasks.probe = Some(self.inner.spawner.spawn(probe_loop(self.inner.clone())));
        tasks.sweep = Some(self.inner.spawner.spawn(sweep_loop(self.inner.clone())));
    }

    fn cancel_schedulers(&self) {
        let mut tasks = self.inner.tasks.lock();
        tasks.gossip.take();
        tasks.probe.take();
        tasks.sweep.take();
        tasks.timers.clear();
    }

    async fn drain_buffered(&self) {
        loop {
            let next = {
                let mut core = self.inner.core.lock();
                if core.lifecycle != Lifecycle::Running {
                    return;
                }
                core.buffered.pop_front()
            };
            match next {
                None => return,
                Some(inbound) => self.inner.process_frame(inbound).await,
            }
        }
    }
}

impl Inner {
    async fn on_inbound(&self, inbound: Inbound) {
        let lifecycle = self.core.lock().lifecycle;
        match lifecycle {
            Lifecycle::Running => self.process_frame(inbound).await,

            Lifecycle::Paused => {
                let overflowed = {
                    let mut core = self.core.lock();
                    core.buffered.push_back(inbound);
                    if core.buffered.len() > self.config.inbound_buffer {
                        core.buffered.pop_front();
                        true
                    } else {
                        false
                    }
                };
                if overflowed {
                    let now_ms = self.clock.now_ms();
                    self.phone.emit(Event::BufferOverflowOccurred { dropped: 1 });
                    self.phone.emit_error(SyncError::BufferOverflow {
                        occurred_at_ms: now_ms,
                        dropped: 1,
                    });
                }
            },

            // stopped: quietly drop; disposed: the pump is going away
            Lifecycle::Stopped | Lifecycle::Disposed => {},
        }
    }

    async fn process_frame(&self, inbound: Inbound) {
        let Inbound {
            peer,
            frame,
            received_at_ms,
        } = inbound;
        let now_ms = self.clock.now_ms();

        let message = match codec::decode(&frame) {
            Err(e) => {
                self.phone.emit_error(SyncError::Peer {
                    occurred_at_ms: now_ms,
                    peer,
                    message: format!("malformed frame: {e}"),
                });
                return;
            },
            Ok(None) => {
                tracing::debug!(peer = %peer, "dropping frame of unknown kind");
                return;
            },
            Ok(Some(message)) => message,
        };

        let actions = {
            let mut core = self.core.lock();
            let window_ms = self.config.traffic_window.as_millis() as u64;
            core.registry
                .record_received(&peer, frame.len() as u64, now_ms, window_ms);
            self.dispatch(&mut core, peer, message, received_at_ms.max(now_ms))
        };
        self.perform(actions).await;
    }

    fn dispatch(
        &self,
        core: &mut Core,
        peer: NodeId,
        message: Message,
        now_ms: u64,
    ) -> Actions {
        match message {
            Message::Ping { seq, incarnation } => {
                let out = self.swim(core, swim::Input::Ping {
                    from: peer,
                    seq,
                    incarnation,
                    now_ms,
                });
                Actions::from_swim(out)
            },

            Message::Ack { seq, incarnation } => {
                let out = self.swim(core, swim::Input::Ack {
                    from: peer,
                    seq,
                    incarnation,
                    now_ms,
                });
                Actions::from_swim(out)
            },

            Message::PingReq { seq, target } => {
                let out = self.swim(core, swim::Input::PingReq {
                    from: peer,
                    seq,
                    target,
                    now_ms,
                });
                Actions::from_swim(out)
            },

            Message::Suspicion { about, incarnation } => {
                let out = self.swim(core, swim::Input::Suspicion {
                    from: peer,
                    about,
                    incarnation,
                    now_ms,
                });
                Actions::from_swim(out)
            },

            Message::Digest(digest) => {
                let mut actions = Actions::default();
                actions
                    .events
                    .extend(core.registry.record_contact(&peer, now_ms).map(Event::from));
                core.registry.record_anti_entropy(&peer, now_ms);

                let delta = sync::handle_digest(&core.channels, &core.store, &digest);
                if !delta.channels.is_empty() {
                    actions
                        .sends
                        .push((peer, Message::Delta(delta), Priority::Normal));
                }
                actions
            },

            Message::Delta(delta) => {
                let mut actions = Actions::default();
                actions
                    .events
                    .extend(core.registry.record_contact(&peer, now_ms).map(Event::from));
                core.registry.record_anti_entropy(&peer, now_ms);

                let outcome = sync::handle_delta(
                    &mut core.channels,
                    &mut core.store,
                    &self.clock,
                    &peer,
                    delta,
                    now_ms,
                );
                actions.events.extend(outcome.events);
                actions.errors.extend(outcome.errors);
                actions.persist_entries = outcome.appended;
                if let Some(digest) = outcome.follow_up {
                    actions
                        .sends
                        .push((peer, Message::Digest(digest), Priority::Normal));
                }
                actions
            },
        }
    }

    fn swim(&self, core: &mut Core, input: swim::Input) -> swim::Output {
        let Core {
            registry,
            rtt,
            detector,
            ..
        } = core;
        detector.apply(registry, rtt, &self.config, input)
    }

    async fn perform(&self, actions: Actions) {
        for error in actions.errors {
            self.phone.emit_error(error);
        }
        for event in actions.events {
            self.phone.emit(event);
        }

        if let Some(incarnation) = actions.persist_incarnation {
            if let Some(repo) = &self.storage.local {
                if let Err(e) = repo.save_incarnation(incarnation).await {
                    self.phone.emit_error(SyncError::Storage {
                        occurred_at_ms: self.clock.now_ms(),
                        message: format!("persisting incarnation: {e}"),
                    });
                }
            }
        }

        if let Some(repo) = &self.storage.entries {
            for (channel, stream, entry) in &actions.persist_entries {
                if let Err(e) = repo.append(channel, stream, entry).await {
                    self.phone.emit_error(SyncError::Storage {
                        occurred_at_ms: self.clock.now_ms(),
                        message: format!("mirroring entry: {e}"),
                    });
                }
            }
        }

        for (to, message, priority) in actions.sends {
            self.send_message(&to, &message, priority).await;
        }
        for (seq, after) in actions.arms {
            self.arm(seq, after);
        }
    }

    async fn send_message(&self, to: &NodeId, message: &Message, priority: Priority) {
        let frame = codec::encode(message);
        {
            let mut core = self.core.lock();
            let now_ms = self.clock.now_ms();
            let window_ms = self.config.traffic_window.as_millis() as u64;
            core.registry
                .record_sent(to, frame.len() as u64, now_ms, window_ms);
        }
        self.transport.send(to, frame, priority).await;
    }

    /// Deliver `Expired { seq }` to the detector after `after`.
    fn arm(&self, seq: u32, after: Duration) {
        let control = self.control.clone();
        let task = self.spawner.spawn(async move {
            weft_async::sleep(after).await;
            control.send(Control::Expired { seq }).ok();
        });
        self.tasks.lock().timers.insert(seq, task);
    }

    async fn on_expired(&self, seq: u32) {
        self.tasks.lock().timers.remove(&seq);

        let actions = {
            let mut core = self.core.lock();
            if core.lifecycle != Lifecycle::Running {
                return;
            }
            let now_ms = self.clock.now_ms();
            let out = self.swim(&mut core, swim::Input::Expired { seq, now_ms });
            Actions::from_swim(out)
        };
        self.perform(actions).await;
    }

    /// One gossip round: skip under backpressure, otherwise send our
    /// digest to the reachable peer longest out of touch.
    async fn gossip_round(&self) {
        let pending = self.transport.total_pending_send_count();
        if pending > self.config.congestion_threshold {
            tracing::debug!(pending, "skipping gossip round, transport congested");
            return;
        }

        let (target, digest) = {
            let mut core = self.core.lock();
            if core.lifecycle != Lifecycle::Running {
                return;
            }

            let digest = sync::build_digest(&core.channels);
            if digest.is_empty() {
                return;
            }

            let oldest = core
                .registry
                .iter()
                .filter(|p| p.status == Status::Reachable)
                .map(|p| p.last_anti_entropy_ms.unwrap_or(0))
                .min();
            let oldest = match oldest {
                None => return,
                Some(oldest) => oldest,
            };
            let target = {
                let Core { registry, rng, .. } = &mut *core;
                registry
                    .iter()
                    .filter(|p| {
                        p.status == Status::Reachable
                            && p.last_anti_entropy_ms.unwrap_or(0) == oldest
                    })
                    .map(|p| p.id.clone())
                    .choose(rng)
            };
            let target = match target {
                None => return,
                Some(target) => target,
            };

            let now_ms = self.clock.now_ms();
            core.registry.record_anti_entropy(&target, now_ms);
            (target, digest)
        };

        tracing::debug!(target = %target, "gossip round");
        self.send_message(&target, &Message::Digest(digest), Priority::Normal)
            .await;
    }

    async fn probe_round(&self) {
        let actions = {
            let mut core = self.core.lock();
            if core.lifecycle != Lifecycle::Running {
                return;
            }
            let now_ms = self.clock.now_ms();
            let out = self.swim(&mut core, swim::Input::Round { now_ms });
            Actions::from_swim(out)
        };
        self.perform(actions).await;
    }

    /// Apply time-bounded retention even when no entries arrive.
    async fn sweep_retention(&self) {
        let events = {
            let mut core = self.core.lock();
            if core.lifecycle != Lifecycle::Running {
                return;
            }
            let now_ms = self.clock.now_ms();

            let mut events = Vec::new();
            let Core {
                channels, store, ..
            } = &mut *core;
            for channel in channels.values() {
                for stream in channel.streams.values() {
                    let removed =
                        store.compact(channel.id(), stream.id(), &stream.retention, now_ms);
                    if removed > 0 {
                        events.push(Event::StreamCompacted {
                            channel: channel.id().clone(),
                            stream: stream.id().clone(),
                            removed,
                        });
                    }
                }
            }
            events
        };

        for event in events {
            self.phone.emit(event);
        }
    }

    fn effective(&self) -> Timings {
        self.core.lock().rtt.timings()
    }
}

async fn pump(
    inner: Arc<Inner>,
    mut incoming: BoxStream<'static, Inbound>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        tokio::select! {
            frame = incoming.next() => match frame {
                None => break,
                Some(inbound) => inner.on_inbound(inbound).await,
            },
            ctl = control.recv() => match ctl {
                None => break,
                Some(Control::Expired { seq }) => inner.on_expired(seq).await,
            },
        }
    }
    tracing::debug!("transport pump shutting down");
}

async fn gossip_loop(inner: Arc<Inner>) {
    loop {
        let interval = inner.effective().gossip_interval;
        weft_async::sleep(jittered(interval)).await;
        inner.gossip_round().await;
    }
}

async fn probe_loop(inner: Arc<Inner>) {
    loop {
        let interval = inner.effective().probe_interval;
        weft_async::sleep(jittered(interval)).await;
        inner.probe_round().await;
    }
}

async fn sweep_loop(inner: Arc<Inner>) {
    let mut ticks = weft_async::interval(SWEEP_INTERVAL, SWEEP_JITTER);
    while ticks.next().await.is_some() {
        inner.sweep_retention().await;
    }
}

/// Desynchronize fleets started together: ±10%.
fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
}

fn generate_node_id() -> NodeId {
    NodeId::new(format!("{:032x}", rand::random::<u128>())).expect("generated id is non-empty")
}
