//! Commissioning engine
//!
//! Drives the admission of devices exposed by the remote bridge:
//! parts-list changes start an admission attempt, which walks
//! categories read -> approval -> commissioning window -> pairing and
//! ends with the device registered under a freshly allocated node id.
//! Admissions run one at a time; further additions queue in arrival
//! order. All component state lives behind a single lock so the
//! subscription feed, timers, and collaborator completions never
//! interleave a transition.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::path::{AttributePath, CommandPath, EventHeader};
use crate::payload::{ApprovalResult, DeviceCategories, PartsList, ReverseWindowRequest};
use crate::router::{Route, SubscriptionRouter};
use crate::service::{
    BridgeClient, PairingError, PairingService, WindowError, WindowParams, WindowService,
    DEFAULT_SETUP_PIN,
};
use fabsync_core::{
    AdminStore, BridgeLink, Correlation, DeviceRegistry, EndpointId, NodeId, NodeIdAllocator,
    PartsChange, PartsListTracker, PersistedState, RequestCorrelator, SyncedDevice,
    RESPONSE_TIMEOUT,
};

/// Why an admission attempt ended without a synced device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("commissioning approval denied by the bridge (status {status})")]
    ApprovalDenied { status: u8 },
    #[error("commissioning approval timed out")]
    ApprovalTimeout,
    #[error("bridge does not support fabric synchronization")]
    SyncNotSupported,
    #[error("no remote bridge is paired")]
    BridgeNotReady,
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error("allocated node id was superseded before commit")]
    SupersededAllocation,
}

/// Terminal report for one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub endpoint_id: EndpointId,
    /// The assigned node id on success.
    pub result: Result<NodeId, AdmissionError>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long the bridge has to answer an approval request.
    pub response_timeout: Duration,
    /// Setup PIN handed to the pairing collaborator during admission.
    pub setup_pin: u32,
    /// Window parameters used during admission when the operator supplies
    /// none.
    pub window_params: WindowParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout: RESPONSE_TIMEOUT,
            setup_pin: DEFAULT_SETUP_PIN,
            window_params: WindowParams::pin_policy(),
        }
    }
}

/// Progress of the current admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Idle,
    DiscoveringCategories {
        endpoint_id: EndpointId,
    },
    AwaitingApproval {
        endpoint_id: EndpointId,
        request_id: u64,
    },
    AwaitingWindow {
        endpoint_id: EndpointId,
        node_id: NodeId,
    },
    Pairing {
        endpoint_id: EndpointId,
        node_id: NodeId,
    },
}

/// Everything the engine mutates, behind one lock.
struct EngineState {
    registry: DeviceRegistry,
    allocator: NodeIdAllocator,
    bridge: BridgeLink,
    correlator: RequestCorrelator,
    parts: PartsListTracker,
    admission: Admission,
    pending: VecDeque<EndpointId>,
}

/// The commissioning engine. Constructed once at startup and shared by
/// reference with the subscription feed and the operator surface.
pub struct SyncEngine {
    state: Mutex<EngineState>,
    router: SubscriptionRouter,
    store: AdminStore,
    config: EngineConfig,
    pairing: Arc<dyn PairingService>,
    windows: Arc<dyn WindowService>,
    bridge_client: Arc<dyn BridgeClient>,
    outcomes: broadcast::Sender<AdmissionOutcome>,
}

impl SyncEngine {
    /// Build the engine, seeding the allocator and bridge link from the
    /// persisted admin state.
    pub fn new(
        config: EngineConfig,
        store: AdminStore,
        pairing: Arc<dyn PairingService>,
        windows: Arc<dyn WindowService>,
        bridge_client: Arc<dyn BridgeClient>,
    ) -> Result<Arc<Self>, fabsync_core::StoreError> {
        let persisted = store.load()?;
        info!(
            last_used_node_id = persisted.last_used_node_id,
            bridge_node_id = ?persisted.bridge_node_id,
            "Loaded admin state"
        );

        let (outcomes, _) = broadcast::channel(64);
        Ok(Arc::new(Self {
            state: Mutex::new(EngineState {
                registry: DeviceRegistry::new(),
                allocator: NodeIdAllocator::new(persisted.last_used_node_id),
                bridge: BridgeLink::new(persisted.bridge_node_id),
                correlator: RequestCorrelator::with_timeout(config.response_timeout),
                parts: PartsListTracker::new(),
                admission: Admission::Idle,
                pending: VecDeque::new(),
            }),
            router: SubscriptionRouter::new(),
            store,
            config,
            pairing,
            windows,
            bridge_client,
            outcomes,
        }))
    }

    /// Subscribe to terminal admission reports.
    pub fn subscribe(&self) -> broadcast::Receiver<AdmissionOutcome> {
        self.outcomes.subscribe()
    }

    // ---- subscription feed receiving surface ----

    pub async fn on_attribute_data(self: &Arc<Self>, path: AttributePath, payload: Value) {
        match self.router.route_attribute(&path) {
            Some(Route::PartsList) => self.handle_parts_list(payload).await,
            Some(Route::DeviceCategories) => self.handle_device_categories(payload).await,
            _ => {}
        }
    }

    pub async fn on_event_data(self: &Arc<Self>, header: EventHeader, payload: Value) {
        if self.router.route_event(&header.path) == Some(Route::ReverseWindowOpen) {
            self.handle_reverse_window_open(payload).await;
        }
    }

    pub async fn on_command_response(self: &Arc<Self>, path: CommandPath, payload: Value) {
        if self.router.route_command(&path) == Some(Route::CommissioningResult) {
            self.handle_approval_result(payload).await;
        }
    }

    // ---- admission state machine ----

    async fn handle_parts_list(self: &Arc<Self>, payload: Value) {
        let reported: PartsList = match serde_json::from_value(payload) {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Malformed parts-list payload");
                return;
            }
        };

        let mut state = self.state.lock().await;
        for change in state.parts.update(reported) {
            match change {
                PartsChange::Removed(endpoint_id) => {
                    // Removal bypasses the admission machine entirely.
                    if let Some(device) = state.registry.find_by_endpoint(endpoint_id).copied() {
                        state.registry.remove(device.node_id, device.endpoint_id);
                        info!(
                            node_id = device.node_id,
                            endpoint_id, "Bridge removed a synced device"
                        );
                    } else {
                        debug!(endpoint_id, "Bridge removed an endpoint we never synced");
                    }
                }
                PartsChange::Added(endpoint_id) => self.enqueue_admission(&mut state, endpoint_id),
            }
        }
    }

    fn enqueue_admission(self: &Arc<Self>, state: &mut EngineState, endpoint_id: EndpointId) {
        if state.registry.find_by_endpoint(endpoint_id).is_some() {
            debug!(endpoint_id, "Endpoint already synced, skipping");
            return;
        }
        let in_flight = match state.admission {
            Admission::Idle => None,
            Admission::DiscoveringCategories { endpoint_id }
            | Admission::AwaitingApproval { endpoint_id, .. }
            | Admission::AwaitingWindow { endpoint_id, .. }
            | Admission::Pairing { endpoint_id, .. } => Some(endpoint_id),
        };
        if in_flight == Some(endpoint_id) || state.pending.contains(&endpoint_id) {
            debug!(endpoint_id, "Admission already underway for endpoint");
            return;
        }

        if in_flight.is_none() {
            self.start_admission(state, endpoint_id);
        } else {
            info!(endpoint_id, "Admission queued behind in-flight attempt");
            state.pending.push_back(endpoint_id);
        }
    }

    fn start_admission(self: &Arc<Self>, state: &mut EngineState, endpoint_id: EndpointId) {
        let Some(bridge) = state.bridge.node_id() else {
            warn!(endpoint_id, "Cannot admit device without a paired bridge");
            self.report(state, endpoint_id, Err(AdmissionError::BridgeNotReady));
            return;
        };

        info!(endpoint_id, "Starting device admission");
        state.admission = Admission::DiscoveringCategories { endpoint_id };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.bridge_client.read_device_categories(bridge).await {
                warn!(error = %e, "Device categories read failed to send");
            }
        });
    }

    async fn handle_device_categories(self: &Arc<Self>, payload: Value) {
        let categories: DeviceCategories = match serde_json::from_value(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Malformed device-categories payload");
                return;
            }
        };

        let mut state = self.state.lock().await;
        let Admission::DiscoveringCategories { endpoint_id } = state.admission else {
            debug!("Unsolicited device-categories report, dropping");
            return;
        };

        if !categories.supports_fabric_sync() {
            self.fail_admission(&mut state, endpoint_id, AdmissionError::SyncNotSupported);
            return;
        }
        let Some(bridge) = state.bridge.node_id() else {
            self.fail_admission(&mut state, endpoint_id, AdmissionError::BridgeNotReady);
            return;
        };

        let request_id = match state.correlator.issue(Instant::now()) {
            Ok(id) => id,
            Err(e) => {
                // Only reachable if a previous attempt leaked its request;
                // leave the expiry timer to reap it.
                error!(error = %e, "Could not issue approval request");
                return;
            }
        };
        state.admission = Admission::AwaitingApproval {
            endpoint_id,
            request_id,
        };
        info!(endpoint_id, request_id, "Requesting commissioning approval");

        let timeout_secs = self.config.response_timeout.as_secs().min(u16::MAX as u64) as u16;
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine
                .bridge_client
                .request_commissioning_approval(bridge, request_id, endpoint_id, timeout_secs)
                .await
            {
                warn!(error = %e, "Approval request failed to send");
            }
        });

        // Expiry timer; harmless if the response wins the race.
        let engine = Arc::clone(self);
        let deadline = self.config.response_timeout + Duration::from_millis(50);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            engine.reap_expired(request_id).await;
        });
    }

    async fn handle_approval_result(self: &Arc<Self>, payload: Value) {
        let result: ApprovalResult = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Malformed approval-result payload");
                return;
            }
        };

        let mut state = self.state.lock().await;
        if state.correlator.match_and_clear(result.request_id) == Correlation::Stale {
            return;
        }
        let Admission::AwaitingApproval { endpoint_id, .. } = state.admission else {
            warn!(
                request_id = result.request_id,
                "Approval result matched outside an admission attempt"
            );
            return;
        };

        if !result.approved() {
            self.fail_admission(
                &mut state,
                endpoint_id,
                AdmissionError::ApprovalDenied {
                    status: result.status_code,
                },
            );
            return;
        }

        let Some(bridge) = state.bridge.node_id() else {
            self.fail_admission(&mut state, endpoint_id, AdmissionError::BridgeNotReady);
            return;
        };

        // Candidate only; committed after pairing succeeds.
        let node_id = state.allocator.peek_next();
        state.admission = Admission::AwaitingWindow {
            endpoint_id,
            node_id,
        };
        info!(endpoint_id, node_id, "Approval granted, opening commissioning window");

        let engine = Arc::clone(self);
        let params = self.config.window_params.clone();
        tokio::spawn(async move {
            let result = engine
                .windows
                .open_remote_window(bridge, endpoint_id, &params)
                .await;
            engine.finish_window_open(endpoint_id, result).await;
        });
    }

    async fn finish_window_open(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        result: Result<(), WindowError>,
    ) {
        let mut state = self.state.lock().await;
        let Admission::AwaitingWindow {
            endpoint_id: current,
            node_id,
        } = state.admission
        else {
            debug!(endpoint_id, "Late window-open result, dropping");
            return;
        };
        if current != endpoint_id {
            debug!(endpoint_id, "Window-open result for a different endpoint, dropping");
            return;
        }

        match result {
            Ok(()) => {
                state.admission = Admission::Pairing {
                    endpoint_id,
                    node_id,
                };
                info!(endpoint_id, node_id, "Commissioning window open, pairing");

                let engine = Arc::clone(self);
                let setup_pin = self.config.setup_pin;
                tokio::spawn(async move {
                    let result = engine.pairing.pair_device(node_id, setup_pin).await;
                    engine.finish_pairing(endpoint_id, node_id, result).await;
                });
            }
            Err(e) => self.fail_admission(&mut state, endpoint_id, e.into()),
        }
    }

    async fn finish_pairing(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        node_id: NodeId,
        result: Result<(), PairingError>,
    ) {
        let mut state = self.state.lock().await;
        match state.admission {
            Admission::Pairing {
                endpoint_id: current,
                node_id: expected,
            } if current == endpoint_id && expected == node_id => {}
            _ => {
                debug!(endpoint_id, "Late pairing result, dropping");
                return;
            }
        }

        match result {
            Ok(()) => {
                if state.allocator.commit(node_id).is_err() {
                    error!(node_id, "Node id superseded during pairing");
                    self.fail_admission(
                        &mut state,
                        endpoint_id,
                        AdmissionError::SupersededAllocation,
                    );
                    return;
                }
                state.registry.add(SyncedDevice::new(node_id, endpoint_id));
                self.persist(&state);
                info!(endpoint_id, node_id, "Device admitted into the fabric");
                self.report(&mut state, endpoint_id, Ok(node_id));
            }
            Err(e) => self.fail_admission(&mut state, endpoint_id, e.into()),
        }
    }

    /// Timer callback for an approval request. A no-op when the response
    /// already arrived.
    async fn reap_expired(self: &Arc<Self>, request_id: u64) {
        let mut state = self.state.lock().await;
        let Some(expired) = state.correlator.expire(Instant::now()) else {
            return;
        };
        if expired != request_id {
            warn!(expired, request_id, "Expired a request from another attempt");
        }
        if let Admission::AwaitingApproval {
            endpoint_id,
            request_id: awaited,
        } = state.admission
        {
            if awaited == expired {
                self.fail_admission(&mut state, endpoint_id, AdmissionError::ApprovalTimeout);
            }
        }
    }

    async fn handle_reverse_window_open(self: &Arc<Self>, payload: Value) {
        let request: ReverseWindowRequest = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Malformed reverse window-open payload");
                return;
            }
        };
        let params = WindowParams::from(request);
        if let Err(e) = params.validate() {
            warn!(error = %e, "Rejecting reverse window-open request");
            return;
        }

        info!(
            discriminator = params.discriminator,
            timeout_secs = params.timeout_secs,
            "Bridge requested a local commissioning window"
        );
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.windows.open_local_window(&params).await {
                warn!(error = %e, "Reverse window open failed");
            }
        });
    }

    fn fail_admission(
        self: &Arc<Self>,
        state: &mut EngineState,
        endpoint_id: EndpointId,
        error: AdmissionError,
    ) {
        warn!(endpoint_id, error = %error, "Admission failed");
        self.report(state, endpoint_id, Err(error));
    }

    /// Publish a terminal report, return to idle, and start the next
    /// queued admission if any.
    fn report(
        self: &Arc<Self>,
        state: &mut EngineState,
        endpoint_id: EndpointId,
        result: Result<NodeId, AdmissionError>,
    ) {
        let _ = self.outcomes.send(AdmissionOutcome {
            endpoint_id,
            result,
        });
        state.admission = Admission::Idle;
        if let Some(next) = state.pending.pop_front() {
            self.start_admission(state, next);
        }
    }

    fn persist(&self, state: &EngineState) {
        let record = PersistedState {
            last_used_node_id: state.allocator.last_used(),
            bridge_node_id: state.bridge.node_id(),
        };
        if let Err(e) = self.store.save(&record) {
            error!(error = %e, "Failed to persist admin state");
        }
    }

    // ---- operator surface ----

    /// Pair the remote fabric bridge and bind it as the sync peer.
    pub async fn pair_bridge(
        self: &Arc<Self>,
        node_id: NodeId,
        setup_pin: u32,
        host: &str,
        port: u16,
    ) -> Result<(), PairingError> {
        self.pairing
            .pair_bridge(node_id, setup_pin, host, port)
            .await?;
        {
            let mut state = self.state.lock().await;
            state.bridge.bind(node_id);
            self.persist(&state);
        }
        self.subscribe_bridge().await;
        Ok(())
    }

    /// Establish the bridge subscription. Called after pairing and on
    /// startup when a bridge is already bound.
    pub async fn subscribe_bridge(self: &Arc<Self>) {
        let Some(bridge) = self.state.lock().await.bridge.node_id() else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.bridge_client.subscribe_bridge(bridge).await {
                warn!(error = %e, "Bridge subscription failed");
            }
        });
    }

    /// Unpair the bridge. Any in-flight or queued admissions are failed,
    /// since they cannot complete without it.
    pub async fn unpair_bridge(self: &Arc<Self>) -> Result<(), PairingError> {
        self.pairing.unpair_bridge().await?;
        let mut state = self.state.lock().await;
        state.bridge.unbind();
        state.correlator.cancel();
        state.pending.clear();
        if let Admission::DiscoveringCategories { endpoint_id }
        | Admission::AwaitingApproval { endpoint_id, .. }
        | Admission::AwaitingWindow { endpoint_id, .. }
        | Admission::Pairing { endpoint_id, .. } = state.admission
        {
            self.fail_admission(&mut state, endpoint_id, AdmissionError::BridgeNotReady);
        }
        self.persist(&state);
        Ok(())
    }

    /// Manually pair a device under an operator-chosen node id.
    pub async fn pair_device(
        self: &Arc<Self>,
        node_id: NodeId,
        setup_pin: u32,
    ) -> Result<(), PairingError> {
        self.pairing.pair_device(node_id, setup_pin).await?;
        let mut state = self.state.lock().await;
        // Reserve the id so admission never collides with it. An id at or
        // below the watermark is already reserved.
        if state.allocator.commit(node_id).is_ok() {
            self.persist(&state);
        }
        Ok(())
    }

    /// Unpair a device and drop its registry entry if it was synced.
    pub async fn unpair_device(self: &Arc<Self>, node_id: NodeId) -> Result<(), PairingError> {
        self.pairing.unpair_device(node_id).await?;
        let mut state = self.state.lock().await;
        if let Some(device) = state.registry.find_by_node(node_id).copied() {
            state.registry.remove(device.node_id, device.endpoint_id);
        }
        Ok(())
    }

    /// Open the local bridge's commissioning window with operator-supplied
    /// parameters.
    pub async fn open_local_window(&self, params: &WindowParams) -> Result<(), WindowError> {
        params.validate()?;
        self.windows.open_local_window(params).await
    }

    /// Open the commissioning window of a device on another node.
    pub async fn open_remote_window(
        &self,
        target: NodeId,
        endpoint_id: EndpointId,
        params: &WindowParams,
    ) -> Result<(), WindowError> {
        params.validate()?;
        self.windows
            .open_remote_window(target, endpoint_id, params)
            .await
    }

    // ---- inspection ----

    pub async fn is_sync_ready(&self) -> bool {
        self.state.lock().await.bridge.is_ready()
    }

    pub async fn bridge_node_id(&self) -> Option<NodeId> {
        self.state.lock().await.bridge.node_id()
    }

    pub async fn synced_devices(&self) -> Vec<SyncedDevice> {
        self.state.lock().await.registry.iter().copied().collect()
    }

    pub async fn last_used_node_id(&self) -> NodeId {
        self.state.lock().await.allocator.last_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{
        EventPath, COMMISSIONER_CONTROL_CLUSTER, DESCRIPTOR_CLUSTER, PARTS_LIST_ATTRIBUTE,
        REQUEST_COMMISSIONING_APPROVAL_COMMAND, REVERSE_OPEN_WINDOW_EVENT,
        SUPPORTED_DEVICE_CATEGORIES_ATTRIBUTE,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockPairing {
        fail_device: AtomicBool,
        device_pairs: StdMutex<Vec<(NodeId, u32)>>,
        device_unpairs: StdMutex<Vec<NodeId>>,
        bridge_pairs: StdMutex<Vec<(NodeId, String, u16)>>,
        bridge_unpairs: AtomicUsize,
    }

    #[async_trait]
    impl PairingService for MockPairing {
        async fn pair_device(&self, node_id: NodeId, setup_pin: u32) -> Result<(), PairingError> {
            self.device_pairs.lock().unwrap().push((node_id, setup_pin));
            if self.fail_device.load(Ordering::SeqCst) {
                return Err(PairingError::PairingFailure("PASE session failed".into()));
            }
            Ok(())
        }

        async fn unpair_device(&self, node_id: NodeId) -> Result<(), PairingError> {
            self.device_unpairs.lock().unwrap().push(node_id);
            Ok(())
        }

        async fn pair_bridge(
            &self,
            node_id: NodeId,
            _setup_pin: u32,
            host: &str,
            port: u16,
        ) -> Result<(), PairingError> {
            self.bridge_pairs
                .lock()
                .unwrap()
                .push((node_id, host.to_string(), port));
            Ok(())
        }

        async fn unpair_bridge(&self) -> Result<(), PairingError> {
            self.bridge_unpairs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockWindows {
        fail_remote: AtomicBool,
        remote_opens: StdMutex<Vec<(NodeId, EndpointId)>>,
        local_opens: StdMutex<Vec<WindowParams>>,
    }

    #[async_trait]
    impl WindowService for MockWindows {
        async fn open_local_window(&self, params: &WindowParams) -> Result<(), WindowError> {
            self.local_opens.lock().unwrap().push(params.clone());
            Ok(())
        }

        async fn open_remote_window(
            &self,
            target: NodeId,
            endpoint_id: EndpointId,
            _params: &WindowParams,
        ) -> Result<(), WindowError> {
            self.remote_opens.lock().unwrap().push((target, endpoint_id));
            if self.fail_remote.load(Ordering::SeqCst) {
                return Err(WindowError::WindowOpenFailure("busy".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockBridgeClient {
        subscriptions: AtomicUsize,
        category_reads: AtomicUsize,
        approvals: StdMutex<Vec<(u64, EndpointId, u16)>>,
    }

    #[async_trait]
    impl BridgeClient for MockBridgeClient {
        async fn subscribe_bridge(&self, _bridge: NodeId) -> anyhow::Result<()> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read_device_categories(&self, _bridge: NodeId) -> anyhow::Result<()> {
            self.category_reads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn request_commissioning_approval(
            &self,
            _bridge: NodeId,
            request_id: u64,
            endpoint_id: EndpointId,
            response_timeout_secs: u16,
        ) -> anyhow::Result<()> {
            self.approvals
                .lock()
                .unwrap()
                .push((request_id, endpoint_id, response_timeout_secs));
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        pairing: Arc<MockPairing>,
        windows: Arc<MockWindows>,
        bridge: Arc<MockBridgeClient>,
        outcomes: broadcast::Receiver<AdmissionOutcome>,
        state_path: std::path::PathBuf,
        _dir: TempDir,
    }

    fn harness_with(persisted: PersistedState, response_timeout: Duration) -> Harness {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("admin-state.json");
        let store = AdminStore::new(&state_path);
        store.save(&persisted).unwrap();

        let pairing = Arc::new(MockPairing::default());
        let windows = Arc::new(MockWindows::default());
        let bridge = Arc::new(MockBridgeClient::default());
        let config = EngineConfig {
            response_timeout,
            ..EngineConfig::default()
        };
        let engine = SyncEngine::new(
            config,
            store,
            pairing.clone(),
            windows.clone(),
            bridge.clone(),
        )
        .unwrap();
        let outcomes = engine.subscribe();
        Harness {
            engine,
            pairing,
            windows,
            bridge,
            outcomes,
            state_path,
            _dir: dir,
        }
    }

    /// Bridge 77 paired, node ids start above 1000.
    fn harness() -> Harness {
        harness_with(
            PersistedState {
                last_used_node_id: 1000,
                bridge_node_id: Some(77),
            },
            Duration::from_secs(5),
        )
    }

    /// Same, but approvals expire quickly.
    fn short_timeout_harness() -> Harness {
        harness_with(
            PersistedState {
                last_used_node_id: 1000,
                bridge_node_id: Some(77),
            },
            Duration::from_millis(80),
        )
    }

    fn parts_path() -> AttributePath {
        AttributePath {
            endpoint_id: 1,
            cluster_id: DESCRIPTOR_CLUSTER,
            attribute_id: PARTS_LIST_ATTRIBUTE,
        }
    }

    fn categories_path() -> AttributePath {
        AttributePath {
            endpoint_id: 1,
            cluster_id: COMMISSIONER_CONTROL_CLUSTER,
            attribute_id: SUPPORTED_DEVICE_CATEGORIES_ATTRIBUTE,
        }
    }

    fn approval_path() -> CommandPath {
        CommandPath {
            endpoint_id: 1,
            cluster_id: COMMISSIONER_CONTROL_CLUSTER,
            command_id: REQUEST_COMMISSIONING_APPROVAL_COMMAND,
        }
    }

    fn reverse_header() -> EventHeader {
        EventHeader {
            path: EventPath {
                endpoint_id: 1,
                cluster_id: COMMISSIONER_CONTROL_CLUSTER,
                event_id: REVERSE_OPEN_WINDOW_EVENT,
            },
            event_number: 1,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    async fn next_outcome(rx: &mut broadcast::Receiver<AdmissionOutcome>) -> AdmissionOutcome {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no admission outcome")
            .unwrap()
    }

    /// Drive an admission that is already past the parts-list report
    /// through categories, approval, window, and pairing.
    async fn drive_to_success(h: &mut Harness, reads: usize, request_id: u64) -> AdmissionOutcome {
        let bridge = h.bridge.clone();
        wait_for(move || bridge.category_reads.load(Ordering::SeqCst) >= reads).await;
        h.engine
            .on_attribute_data(categories_path(), json!({ "supported_categories": 1 }))
            .await;
        let bridge = h.bridge.clone();
        wait_for(move || bridge.approvals.lock().unwrap().len() >= request_id as usize).await;
        h.engine
            .on_command_response(
                approval_path(),
                json!({ "request_id": request_id, "status_code": 0 }),
            )
            .await;
        next_outcome(&mut h.outcomes).await
    }

    #[tokio::test]
    async fn admission_happy_path() {
        let mut h = harness();
        h.engine.on_attribute_data(parts_path(), json!([5])).await;

        let outcome = drive_to_success(&mut h, 1, 1).await;
        assert_eq!(outcome.endpoint_id, 5);
        assert_eq!(outcome.result, Ok(1001));

        assert_eq!(
            h.engine.synced_devices().await,
            vec![SyncedDevice::new(1001, 5)]
        );
        assert_eq!(h.engine.last_used_node_id().await, 1001);
        assert_eq!(h.bridge.approvals.lock().unwrap()[0].1, 5);
        assert_eq!(h.windows.remote_opens.lock().unwrap()[0], (77, 5));
        assert_eq!(
            h.pairing.device_pairs.lock().unwrap()[0],
            (1001, DEFAULT_SETUP_PIN)
        );

        // Watermark survives a restart.
        let persisted = AdminStore::new(&h.state_path).load().unwrap();
        assert_eq!(persisted.last_used_node_id, 1001);
        assert_eq!(persisted.bridge_node_id, Some(77));
    }

    #[tokio::test]
    async fn approval_timeout_fails_the_admission() {
        let mut h = short_timeout_harness();
        h.engine.on_attribute_data(parts_path(), json!([5])).await;
        let bridge = h.bridge.clone();
        wait_for(move || bridge.category_reads.load(Ordering::SeqCst) == 1).await;
        h.engine
            .on_attribute_data(categories_path(), json!({ "supported_categories": 1 }))
            .await;

        // No approval response ever arrives.
        let outcome = next_outcome(&mut h.outcomes).await;
        assert_eq!(outcome.endpoint_id, 5);
        assert_eq!(outcome.result, Err(AdmissionError::ApprovalTimeout));
        assert!(h.engine.synced_devices().await.is_empty());
        assert_eq!(h.engine.last_used_node_id().await, 1000);
    }

    #[tokio::test]
    async fn approval_denial_fails_the_admission() {
        let mut h = harness();
        h.engine.on_attribute_data(parts_path(), json!([5])).await;
        let bridge = h.bridge.clone();
        wait_for(move || bridge.category_reads.load(Ordering::SeqCst) == 1).await;
        h.engine
            .on_attribute_data(categories_path(), json!({ "supported_categories": 1 }))
            .await;
        let bridge = h.bridge.clone();
        wait_for(move || !bridge.approvals.lock().unwrap().is_empty()).await;
        h.engine
            .on_command_response(
                approval_path(),
                json!({ "request_id": 1, "status_code": 3 }),
            )
            .await;

        let outcome = next_outcome(&mut h.outcomes).await;
        assert_eq!(
            outcome.result,
            Err(AdmissionError::ApprovalDenied { status: 3 })
        );
        assert!(h.engine.synced_devices().await.is_empty());
    }

    #[tokio::test]
    async fn stale_approval_response_is_discarded() {
        let mut h = harness();
        h.engine.on_attribute_data(parts_path(), json!([5])).await;
        let bridge = h.bridge.clone();
        wait_for(move || bridge.category_reads.load(Ordering::SeqCst) == 1).await;
        h.engine
            .on_attribute_data(categories_path(), json!({ "supported_categories": 1 }))
            .await;
        let bridge = h.bridge.clone();
        wait_for(move || !bridge.approvals.lock().unwrap().is_empty()).await;

        h.engine
            .on_command_response(
                approval_path(),
                json!({ "request_id": 99, "status_code": 0 }),
            )
            .await;
        assert!(matches!(
            h.outcomes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        // The real response still goes through.
        h.engine
            .on_command_response(
                approval_path(),
                json!({ "request_id": 1, "status_code": 0 }),
            )
            .await;
        let outcome = next_outcome(&mut h.outcomes).await;
        assert_eq!(outcome.result, Ok(1001));
    }

    #[tokio::test]
    async fn window_open_failure_leaves_id_uncommitted() {
        let mut h = harness();
        h.windows.fail_remote.store(true, Ordering::SeqCst);
        h.engine.on_attribute_data(parts_path(), json!([5])).await;

        let outcome = drive_to_success(&mut h, 1, 1).await;
        assert_eq!(
            outcome.result,
            Err(AdmissionError::Window(WindowError::WindowOpenFailure(
                "busy".into()
            )))
        );
        assert!(h.engine.synced_devices().await.is_empty());
        assert_eq!(h.engine.last_used_node_id().await, 1000);
        assert!(h.pairing.device_pairs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pairing_failure_leaves_id_uncommitted() {
        let mut h = harness();
        h.pairing.fail_device.store(true, Ordering::SeqCst);
        h.engine.on_attribute_data(parts_path(), json!([5])).await;

        let outcome = drive_to_success(&mut h, 1, 1).await;
        assert!(matches!(
            outcome.result,
            Err(AdmissionError::Pairing(PairingError::PairingFailure(_)))
        ));
        assert!(h.engine.synced_devices().await.is_empty());
        assert_eq!(h.engine.last_used_node_id().await, 1000);
    }

    #[tokio::test]
    async fn missing_fabric_sync_category_aborts() {
        let mut h = harness();
        h.engine.on_attribute_data(parts_path(), json!([5])).await;
        let bridge = h.bridge.clone();
        wait_for(move || bridge.category_reads.load(Ordering::SeqCst) == 1).await;
        h.engine
            .on_attribute_data(categories_path(), json!({ "supported_categories": 2 }))
            .await;

        let outcome = next_outcome(&mut h.outcomes).await;
        assert_eq!(outcome.result, Err(AdmissionError::SyncNotSupported));
        assert!(h.bridge.approvals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bridge_removal_clears_the_registry() {
        let mut h = harness();
        h.engine.on_attribute_data(parts_path(), json!([5])).await;
        let outcome = drive_to_success(&mut h, 1, 1).await;
        assert_eq!(outcome.result, Ok(1001));

        h.engine.on_attribute_data(parts_path(), json!([])).await;
        assert!(h.engine.synced_devices().await.is_empty());
    }

    #[tokio::test]
    async fn removal_of_never_synced_endpoint_is_noop() {
        let h = harness();
        // Endpoint 9 becomes known but its admission never completes.
        h.engine.on_attribute_data(parts_path(), json!([9])).await;
        h.engine.on_attribute_data(parts_path(), json!([])).await;
        assert!(h.engine.synced_devices().await.is_empty());
    }

    #[tokio::test]
    async fn queued_admissions_run_in_arrival_order() {
        let mut h = harness();
        h.engine.on_attribute_data(parts_path(), json!([5, 6])).await;

        let first = drive_to_success(&mut h, 1, 1).await;
        assert_eq!(first.endpoint_id, 5);
        assert_eq!(first.result, Ok(1001));

        // Endpoint 6 starts automatically once 5 completes.
        let second = drive_to_success(&mut h, 2, 2).await;
        assert_eq!(second.endpoint_id, 6);
        assert_eq!(second.result, Ok(1002));

        assert_eq!(
            h.engine.synced_devices().await,
            vec![SyncedDevice::new(1001, 5), SyncedDevice::new(1002, 6)]
        );
    }

    #[tokio::test]
    async fn timeout_dequeues_the_next_admission() {
        let mut h = short_timeout_harness();
        h.engine.on_attribute_data(parts_path(), json!([5, 6])).await;
        let bridge = h.bridge.clone();
        wait_for(move || bridge.category_reads.load(Ordering::SeqCst) == 1).await;
        h.engine
            .on_attribute_data(categories_path(), json!({ "supported_categories": 1 }))
            .await;

        let outcome = next_outcome(&mut h.outcomes).await;
        assert_eq!(outcome.endpoint_id, 5);
        assert_eq!(outcome.result, Err(AdmissionError::ApprovalTimeout));

        let second = drive_to_success(&mut h, 2, 2).await;
        assert_eq!(second.endpoint_id, 6);
        assert_eq!(second.result, Ok(1001));
    }

    #[tokio::test]
    async fn admission_without_bridge_fails() {
        let mut h = harness_with(PersistedState::default(), Duration::from_secs(5));
        h.engine.on_attribute_data(parts_path(), json!([5])).await;
        let outcome = next_outcome(&mut h.outcomes).await;
        assert_eq!(outcome.result, Err(AdmissionError::BridgeNotReady));
    }

    #[tokio::test]
    async fn reverse_window_request_opens_local_window() {
        let h = harness();
        h.engine
            .on_event_data(
                reverse_header(),
                json!({
                    "iterations": 1000,
                    "timeout_secs": 300,
                    "discriminator": 3840,
                    "salt": vec![7u8; 16],
                    "verifier": vec![1u8; 97],
                }),
            )
            .await;
        let windows = h.windows.clone();
        wait_for(move || windows.local_opens.lock().unwrap().len() == 1).await;
        assert_eq!(h.windows.local_opens.lock().unwrap()[0].discriminator, 3840);
    }

    #[tokio::test]
    async fn malformed_reverse_window_request_is_rejected() {
        let h = harness();
        h.engine
            .on_event_data(
                reverse_header(),
                json!({
                    "iterations": 1000,
                    "timeout_secs": 300,
                    "discriminator": 3840,
                    "salt": vec![7u8; 4],
                    "verifier": vec![1u8; 97],
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.windows.local_opens.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pair_bridge_binds_and_persists() {
        let h = harness_with(PersistedState::default(), Duration::from_secs(5));
        assert!(!h.engine.is_sync_ready().await);

        h.engine
            .pair_bridge(77, DEFAULT_SETUP_PIN, "fe80::1", 5540)
            .await
            .unwrap();
        assert!(h.engine.is_sync_ready().await);
        assert_eq!(h.engine.bridge_node_id().await, Some(77));
        let bridge = h.bridge.clone();
        wait_for(move || bridge.subscriptions.load(Ordering::SeqCst) == 1).await;
        assert_eq!(
            AdminStore::new(&h.state_path).load().unwrap().bridge_node_id,
            Some(77)
        );
    }

    #[tokio::test]
    async fn unpair_bridge_fails_in_flight_admission() {
        let mut h = harness();
        h.engine.on_attribute_data(parts_path(), json!([5])).await;
        let bridge = h.bridge.clone();
        wait_for(move || bridge.category_reads.load(Ordering::SeqCst) == 1).await;

        h.engine.unpair_bridge().await.unwrap();
        let outcome = next_outcome(&mut h.outcomes).await;
        assert_eq!(outcome.result, Err(AdmissionError::BridgeNotReady));
        assert!(!h.engine.is_sync_ready().await);
        assert_eq!(
            AdminStore::new(&h.state_path).load().unwrap().bridge_node_id,
            None
        );
    }

    #[tokio::test]
    async fn unpair_device_drops_registry_entry() {
        let mut h = harness();
        h.engine.on_attribute_data(parts_path(), json!([5])).await;
        let outcome = drive_to_success(&mut h, 1, 1).await;
        assert_eq!(outcome.result, Ok(1001));

        h.engine.unpair_device(1001).await.unwrap();
        assert!(h.engine.synced_devices().await.is_empty());
        assert_eq!(h.pairing.device_unpairs.lock().unwrap()[0], 1001);
    }

    #[tokio::test]
    async fn manual_pair_reserves_the_node_id() {
        let h = harness();
        h.engine.pair_device(2000, DEFAULT_SETUP_PIN).await.unwrap();
        assert_eq!(h.engine.last_used_node_id().await, 2000);
        assert_eq!(
            AdminStore::new(&h.state_path)
                .load()
                .unwrap()
                .last_used_node_id,
            2000
        );
    }
}
