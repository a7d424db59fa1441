//! Feeds mirroring a relay.
//!
//! [`RemoteHub`] demultiplexes inbound traffic to per-cell
//! [`RemoteEditFeed`]s and tracks the control-message state (world
//! parameters, observer metadata). Feeds are created through
//! [`RemoteFeedFactory`], which subscribes to the cell on the relay first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::control::{ControlMessage, ObserverInfo, WorldParameters};
use super::transport::{ConnectOptions, EventSink, TcpTransport, Transport, TransportEvent};
use super::wire::{decode_frame, Frame, MessageKind, ObserverBatch};
use crate::cell::CellIndex;
use crate::core::types::Result;
use crate::dispatch::DispatchHandle;
use crate::edit::{CompressedEdit, ObserverState};
use crate::feed::{EditFeed, FeedCallback, FeedEvent, FeedFactory, FeedListeners, ListenerId};

/// Called with the observer states of one cell, decompressed into that
/// cell's local frame
pub type ObserverStatesCallback = Arc<dyn Fn(&ObserverStates) + Send + Sync>;

/// Called once when the world parameters arrive
pub type WorldParametersCallback = Arc<dyn Fn(&WorldParameters) + Send + Sync>;

/// Decoded ObserverState batch
#[derive(Clone, Debug, PartialEq)]
pub struct ObserverStates {
    pub cell: CellIndex,
    pub period: f32,
    pub states: Vec<(i64, ObserverState)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection-wide state shared by every remote feed
pub struct RemoteHub {
    cell_size: f32,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    feeds: Mutex<HashMap<CellIndex, Weak<RemoteEditFeed>>>,
    world: Mutex<Option<WorldParameters>>,
    observers: Mutex<HashMap<i64, ObserverInfo>>,
    world_listeners: Mutex<Vec<WorldParametersCallback>>,
    state_listeners: Mutex<Vec<ObserverStatesCallback>>,
}

impl RemoteHub {
    pub fn new(cell_size: f32) -> Arc<Self> {
        Arc::new(Self {
            cell_size,
            transport: Mutex::new(None),
            feeds: Mutex::new(HashMap::new()),
            world: Mutex::new(None),
            observers: Mutex::new(HashMap::new()),
            world_listeners: Mutex::new(Vec::new()),
            state_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Attach the outbound side once connected
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *lock(&self.transport) = Some(transport);
    }

    /// Connect over TCP and attach the transport.
    ///
    /// Control messages from the handshake are queued on `dispatch` like
    /// every later event.
    pub async fn connect(self: &Arc<Self>, options: &ConnectOptions, dispatch: DispatchHandle) -> Result<()> {
        let transport = TcpTransport::connect(options, self.event_sink(dispatch)).await?;
        self.set_transport(Arc::new(transport));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.transport).is_some()
    }

    /// Sink for a transport that re-posts every event onto the simulation
    /// thread before the hub handles it
    pub fn event_sink(self: &Arc<Self>, dispatch: DispatchHandle) -> EventSink {
        let hub = Arc::downgrade(self);
        Arc::new(move |event: TransportEvent| {
            let hub = hub.clone();
            dispatch.post(move || {
                if let Some(hub) = hub.upgrade() {
                    hub.handle_event(event);
                }
            });
        })
    }

    fn send(&self, frame: Frame) {
        let transport = lock(&self.transport).clone();
        match transport {
            Some(transport) => transport.send_bytes(frame.encode()),
            None => log::warn!("Not connected, dropping {:?} for cell {}", frame.kind, frame.cell),
        }
    }

    /// Live feed for `cell`, if one is attached
    pub fn feed(&self, cell: CellIndex) -> Option<Arc<RemoteEditFeed>> {
        lock(&self.feeds).get(&cell).and_then(Weak::upgrade)
    }

    /// World parameters from the relay, once received
    pub fn world_parameters(&self) -> Option<WorldParameters> {
        lock(&self.world).clone()
    }

    pub fn observer_info(&self, observer_id: i64) -> Option<ObserverInfo> {
        lock(&self.observers).get(&observer_id).cloned()
    }

    pub fn on_world_parameters(&self, callback: WorldParametersCallback) {
        lock(&self.world_listeners).push(callback);
    }

    pub fn on_observer_states(&self, callback: ObserverStatesCallback) {
        lock(&self.state_listeners).push(callback);
    }

    /// Send the states of observers in `cell`, given in its local frame
    pub fn publish_observer_states(&self, cell: CellIndex, period: f32, states: &[(i64, ObserverState)]) {
        let batch = ObserverBatch {
            period,
            states: states
                .iter()
                .map(|(id, state)| (*id, state.compress(self.cell_size)))
                .collect(),
        };
        self.send(Frame::new(MessageKind::ObserverState, cell, batch.encode()));
    }

    /// Apply one transport event. Must run on the simulation thread.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => match ControlMessage::parse(&text) {
                Ok(msg) => self.handle_control(msg),
                Err(e) => log::warn!("Ignoring malformed control message: {}", e),
            },
            TransportEvent::Bytes(data) => match decode_frame(&data) {
                Some(frame) => self.handle_frame(frame),
                None => log::debug!("Discarding truncated frame ({} bytes)", data.len()),
            },
            TransportEvent::Closed => {
                log::warn!("Relay connection lost");
                *lock(&self.transport) = None;
            }
        }
    }

    fn handle_control(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::WorldParameters { seed, parameters } => {
                let params = {
                    let mut world = lock(&self.world);
                    if world.is_some() {
                        log::debug!("Ignoring repeated world parameters");
                        return;
                    }
                    let params = WorldParameters { seed, parameters };
                    *world = Some(params.clone());
                    params
                };
                log::info!("Received world parameters (seed {})", params.seed);
                let listeners = lock(&self.world_listeners).clone();
                for listener in listeners {
                    listener(&params);
                }
            }
            ControlMessage::ObserverInfo { observer_id, name, appearance } => {
                log::debug!("Observer {} is '{}'", observer_id, name);
                lock(&self.observers).insert(observer_id, ObserverInfo { name, appearance });
            }
            other => log::debug!("Ignoring control message {:?}", other),
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.kind {
            MessageKind::Edit => {
                let Some(edit) = frame.edit_payload() else {
                    log::debug!("Discarding short edit for cell {}", frame.cell);
                    return;
                };
                match self.feed(frame.cell) {
                    Some(feed) => feed.receive(edit),
                    None => log::debug!("Edit for unsubscribed cell {}", frame.cell),
                }
            }
            MessageKind::ObserverState => {
                let Some(batch) = ObserverBatch::decode(&frame.payload) else {
                    log::debug!("Discarding short observer batch for cell {}", frame.cell);
                    return;
                };
                let update = ObserverStates {
                    cell: frame.cell,
                    period: batch.period,
                    states: batch
                        .states
                        .iter()
                        .map(|(id, state)| (*id, state.decompress(self.cell_size)))
                        .collect(),
                };
                let listeners = lock(&self.state_listeners).clone();
                for listener in listeners {
                    listener(&update);
                }
            }
            MessageKind::Subscribe | MessageKind::Unsubscribe => {
                log::debug!("Ignoring {:?} from relay", frame.kind);
            }
        }
    }

    fn detach(&self, feed: &RemoteEditFeed) {
        let mut feeds = lock(&self.feeds);
        let current = feeds
            .get(&feed.cell)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), feed));
        if current {
            feeds.remove(&feed.cell);
        }
    }
}

/// Edit feed mirroring one cell on the relay.
///
/// Always loaded: the relay replays stored history as ordinary edits after
/// the subscribe.
pub struct RemoteEditFeed {
    hub: Weak<RemoteHub>,
    cell: CellIndex,
    edits: Mutex<Vec<CompressedEdit>>,
    listeners: FeedListeners,
    disposed: AtomicBool,
}

impl RemoteEditFeed {
    /// Apply an edit that arrived from the relay; it is not sent back
    pub fn receive(&self, edit: CompressedEdit) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        lock(&self.edits).push(edit);
        self.listeners.notify(FeedEvent { cell: self.cell, edit });
    }
}

impl EditFeed for RemoteEditFeed {
    fn cell_index(&self) -> CellIndex {
        self.cell
    }

    fn submit(&self, edit: CompressedEdit) {
        if self.disposed.load(Ordering::Acquire) {
            log::debug!("Dropping edit for disposed cell {}", self.cell);
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.send(Frame::edit(self.cell, &edit));
        }
        lock(&self.edits).push(edit);
        self.listeners.notify(FeedEvent { cell: self.cell, edit });
    }

    fn copy_history(&self, out: &mut Vec<CompressedEdit>) {
        out.extend_from_slice(&lock(&self.edits));
    }

    fn listen(&self, callback: FeedCallback) -> ListenerId {
        self.listeners.add(callback)
    }

    fn unlisten(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn len(&self) -> usize {
        lock(&self.edits).len()
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("Unsubscribing from cell {}", self.cell);
        if let Some(hub) = self.hub.upgrade() {
            hub.send(Frame::unsubscribe(self.cell));
            hub.detach(self);
        }
    }
}

/// Creates [`RemoteEditFeed`]s, subscribing to each cell on the relay
#[derive(Clone)]
pub struct RemoteFeedFactory {
    hub: Arc<RemoteHub>,
}

impl RemoteFeedFactory {
    pub fn new(hub: Arc<RemoteHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<RemoteHub> {
        &self.hub
    }
}

impl FeedFactory for RemoteFeedFactory {
    fn create_feed(&self, cell: CellIndex) -> Arc<dyn EditFeed> {
        let feed = Arc::new(RemoteEditFeed {
            hub: Arc::downgrade(&self.hub),
            cell,
            edits: Mutex::new(Vec::new()),
            listeners: FeedListeners::new(),
            disposed: AtomicBool::new(false),
        });
        lock(&self.hub.feeds).insert(cell, Arc::downgrade(&feed));
        self.hub.send(Frame::subscribe(cell));
        feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EditSyncConfig;
    use crate::core::types::Vec3;
    use crate::dispatch::Dispatcher;
    use crate::edit::{flags, Edit, EditKind};
    use crate::manager::EditManager;
    use crate::net::wire::encode_frame;
    use crate::subscription::EditCallback;

    const CELL_SIZE: f32 = 4096.0;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Frame>>,
    }

    impl RecordingTransport {
        fn kinds(&self) -> Vec<(MessageKind, CellIndex)> {
            self.sent.lock().unwrap().iter().map(|f| (f.kind, f.cell)).collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send_bytes(&self, data: Vec<u8>) {
            self.sent.lock().unwrap().push(decode_frame(&data).unwrap());
        }
    }

    fn connected_hub() -> (Arc<RemoteHub>, Arc<RecordingTransport>) {
        let hub = RemoteHub::new(CELL_SIZE);
        let transport = Arc::new(RecordingTransport::default());
        hub.set_transport(transport.clone());
        (hub, transport)
    }

    fn edit_bytes(cell: CellIndex, x: u16) -> Vec<u8> {
        // y and z decode to 500 in the cell frame
        Frame::edit(cell, &CompressedEdit { kind: 0, size_exponent: 10, x, y: 20384, z: 20384 }).encode()
    }

    #[test]
    fn test_factory_subscribes_and_dispose_unsubscribes_once() {
        let (hub, transport) = connected_hub();
        let factory = RemoteFeedFactory::new(hub.clone());
        let cell = CellIndex::new(2, -1);

        let feed = factory.create_feed(cell);
        assert_eq!(transport.kinds(), vec![(MessageKind::Subscribe, cell)]);
        assert!(feed.is_loaded());

        feed.dispose();
        feed.dispose();
        assert_eq!(
            transport.kinds(),
            vec![(MessageKind::Subscribe, cell), (MessageKind::Unsubscribe, cell)]
        );
        assert!(hub.feed(cell).is_none());
    }

    #[test]
    fn test_submit_sends_and_notifies_locally() {
        let (hub, transport) = connected_hub();
        let feed = RemoteFeedFactory::new(hub).create_feed(CellIndex::new(0, 0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        feed.listen(Arc::new(move |e: FeedEvent| s.lock().unwrap().push(e.edit)));

        let edit = CompressedEdit { kind: 1, size_exponent: 3, x: 1, y: 2, z: 3 };
        feed.submit(edit);

        assert_eq!(*seen.lock().unwrap(), vec![edit]);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].edit_payload(), Some(edit));
    }

    #[test]
    fn test_inbound_edit_is_not_echoed() {
        let (hub, transport) = connected_hub();
        let cell = CellIndex::new(1, 1);
        let feed = RemoteFeedFactory::new(hub.clone()).create_feed(cell);

        hub.handle_event(TransportEvent::Bytes(edit_bytes(cell, 77)));
        hub.handle_event(TransportEvent::Bytes(edit_bytes(CellIndex::new(9, 9), 1)));

        assert_eq!(feed.len(), 1);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_truncated_frames_are_discarded() {
        let (hub, _) = connected_hub();
        let cell = CellIndex::new(0, 0);
        let feed = RemoteFeedFactory::new(hub.clone()).create_feed(cell);

        let bytes = edit_bytes(cell, 5);
        hub.handle_event(TransportEvent::Bytes(bytes[..bytes.len() - 2].to_vec()));
        hub.handle_event(TransportEvent::Bytes(bytes[..4].to_vec()));
        hub.handle_event(TransportEvent::Bytes(encode_frame(MessageKind::Edit, cell, &[0; 4])));

        assert!(feed.is_empty());
    }

    #[test]
    fn test_only_first_world_parameters_apply() {
        let (hub, _) = connected_hub();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        hub.on_world_parameters(Arc::new(move |p: &WorldParameters| c.lock().unwrap().push(p.seed.clone())));

        for seed in ["first", "second"] {
            let msg = ControlMessage::WorldParameters { seed: seed.into(), parameters: "{}".into() };
            hub.handle_event(TransportEvent::Message(serde_json::to_string(&msg).unwrap()));
        }

        assert_eq!(*calls.lock().unwrap(), vec!["first".to_string()]);
        assert_eq!(hub.world_parameters().unwrap().seed, "first");
    }

    #[test]
    fn test_observer_info_is_tracked() {
        let (hub, _) = connected_hub();
        let msg = ControlMessage::ObserverInfo { observer_id: 3, name: "alice".into(), appearance: "hat".into() };
        hub.handle_event(TransportEvent::Message(serde_json::to_string(&msg).unwrap()));
        assert_eq!(hub.observer_info(3).unwrap().name, "alice");
        assert!(hub.observer_info(4).is_none());
    }

    #[test]
    fn test_observer_states_round_trip() {
        let (hub, transport) = connected_hub();
        let cell = CellIndex::new(4, 4);
        let state = ObserverState::new(Vec3::new(100.0, 200.0, 50.0), 90.0, flags::ON_GROUND);
        hub.publish_observer_states(cell, 0.1, &[(42, state)]);

        let frame = transport.sent.lock().unwrap()[0].clone();
        assert_eq!(frame.kind, MessageKind::ObserverState);

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        hub.on_observer_states(Arc::new(move |u: &ObserverStates| r.lock().unwrap().push(u.clone())));
        hub.handle_event(TransportEvent::Bytes(frame.encode()));

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].cell, cell);
        let (id, back) = received[0].states[0];
        assert_eq!(id, 42);
        assert!((back.position - state.position).abs().max_element() <= CELL_SIZE / 65536.0);
        assert!(back.has_flag(flags::ON_GROUND));
    }

    #[test]
    fn test_events_are_marshaled_through_dispatcher() {
        let mut dispatcher = Dispatcher::new();
        let (hub, _) = connected_hub();
        let cell = CellIndex::new(0, 0);
        let feed = RemoteFeedFactory::new(hub.clone()).create_feed(cell);

        let sink = hub.event_sink(dispatcher.handle());
        sink(TransportEvent::Bytes(edit_bytes(cell, 9)));
        assert!(feed.is_empty());

        dispatcher.pump();
        assert_eq!(feed.len(), 1);

        sink(TransportEvent::Closed);
        dispatcher.pump();
        assert!(!hub.is_connected());
    }

    #[test]
    fn test_manager_over_remote_feeds() {
        let (hub, transport) = connected_hub();
        let manager = EditManager::new(
            EditSyncConfig::with_cell_size(CELL_SIZE),
            RemoteFeedFactory::new(hub.clone()),
        )
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let callback: EditCallback = Arc::new(move |e: &Edit| s.lock().unwrap().push(*e));
        let mut sub = manager.subscribe(Vec3::ZERO, Vec3::splat(1000.0), callback);

        manager.submit(EditKind::Add, 32.0, Vec3::splat(500.0));
        // A peer's edit relayed back to us
        hub.handle_event(TransportEvent::Bytes(edit_bytes(CellIndex::new(0, 0), 20000)));
        assert_eq!(seen.lock().unwrap().len(), 2);

        sub.dispose();
        let cell = CellIndex::new(0, 0);
        assert_eq!(
            transport.kinds(),
            vec![
                (MessageKind::Subscribe, cell),
                (MessageKind::Edit, cell),
                (MessageKind::Unsubscribe, cell),
            ]
        );
    }
}
