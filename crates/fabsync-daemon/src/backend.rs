//! JSON-lines socket adapter to the controller process
//!
//! The transport, session crypto, and wire decoding live in a separate
//! controller process. The daemon talks to it over a Unix socket: one
//! JSON object per line. Requests carry an id and are answered by a
//! `reply` frame; attribute, event, and command payloads stream in
//! unsolicited and are fed straight into the engine's receiving surface.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use fabsync_core::{EndpointId, NodeId};
use fabsync_engine::{
    AttributePath, BridgeClient, CommandPath, EventHeader, PairingError, PairingService,
    SyncEngine, WindowError, WindowParams, WindowService,
};

/// How long to wait for the controller to answer a request. Pairing can
/// legitimately take tens of seconds.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct RequestEnvelope {
    id: u64,
    #[serde(flatten)]
    op: ControllerRequest,
}

/// Requests sent to the controller.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControllerRequest {
    PairDevice {
        node_id: NodeId,
        setup_pin: u32,
    },
    UnpairDevice {
        node_id: NodeId,
    },
    PairBridge {
        node_id: NodeId,
        setup_pin: u32,
        host: String,
        port: u16,
    },
    UnpairBridge,
    OpenLocalWindow {
        params: WindowParams,
    },
    OpenRemoteWindow {
        target: NodeId,
        endpoint_id: EndpointId,
        params: WindowParams,
    },
    SubscribeBridge {
        bridge: NodeId,
    },
    ReadDeviceCategories {
        bridge: NodeId,
    },
    RequestCommissioningApproval {
        bridge: NodeId,
        request_id: u64,
        endpoint_id: EndpointId,
        response_timeout_secs: u16,
    },
}

/// Frames received from the controller.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControllerFrame {
    Reply {
        id: u64,
        #[serde(default)]
        error: Option<String>,
    },
    AttributeData {
        path: AttributePath,
        payload: Value,
    },
    EventData {
        header: EventHeader,
        payload: Value,
    },
    CommandResponse {
        path: CommandPath,
        payload: Value,
    },
}

pub struct SocketBackend {
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>,
    next_id: AtomicU64,
}

impl SocketBackend {
    /// Connect to the controller socket.
    pub async fn connect(path: &Path) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to controller at {}", path.display()))?;
        info!(path = %path.display(), "Connected to controller");
        let (read, write) = stream.into_split();
        Ok(Arc::new(Self {
            writer: Mutex::new(BufWriter::new(write)),
            reader: Mutex::new(Some(BufReader::new(read))),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }))
    }

    /// Read frames off the socket until it closes, feeding payloads into
    /// the engine and completing pending requests.
    pub async fn run(self: Arc<Self>, engine: Arc<SyncEngine>) {
        let Some(reader) = self.reader.lock().await.take() else {
            warn!("Controller feed already running");
            return;
        };
        let mut lines = reader.lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let frame: ControllerFrame = match serde_json::from_str(&line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed controller frame");
                            continue;
                        }
                    };
                    self.dispatch(&engine, frame).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Controller socket read failed");
                    break;
                }
            }
        }

        info!("Controller disconnected");
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err("controller connection closed".into()));
        }
    }

    async fn dispatch(&self, engine: &Arc<SyncEngine>, frame: ControllerFrame) {
        match frame {
            ControllerFrame::Reply { id, error } => {
                let tx = self.pending.lock().unwrap().remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(match error {
                            None => Ok(()),
                            Some(message) => Err(message),
                        });
                    }
                    None => debug!(id, "Reply for unknown or timed-out request"),
                }
            }
            ControllerFrame::AttributeData { path, payload } => {
                engine.on_attribute_data(path, payload).await;
            }
            ControllerFrame::EventData { header, payload } => {
                engine.on_event_data(header, payload).await;
            }
            ControllerFrame::CommandResponse { path, payload } => {
                engine.on_command_response(path, payload).await;
            }
        }
    }

    async fn request(&self, op: ControllerRequest) -> Result<(), String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let frame = match serde_json::to_string(&RequestEnvelope { id, op }) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(e.to_string());
            }
        };

        let write_result = {
            let mut writer = self.writer.lock().await;
            async {
                writer.write_all(frame.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await
        };
        if let Err(e) = write_result {
            self.pending.lock().unwrap().remove(&id);
            return Err(e.to_string());
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("controller connection closed".into()),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err("controller request timed out".into())
            }
        }
    }
}

#[async_trait]
impl PairingService for SocketBackend {
    async fn pair_device(&self, node_id: NodeId, setup_pin: u32) -> Result<(), PairingError> {
        self.request(ControllerRequest::PairDevice { node_id, setup_pin })
            .await
            .map_err(PairingError::PairingFailure)
    }

    async fn unpair_device(&self, node_id: NodeId) -> Result<(), PairingError> {
        self.request(ControllerRequest::UnpairDevice { node_id })
            .await
            .map_err(PairingError::UnpairingFailure)
    }

    async fn pair_bridge(
        &self,
        node_id: NodeId,
        setup_pin: u32,
        host: &str,
        port: u16,
    ) -> Result<(), PairingError> {
        self.request(ControllerRequest::PairBridge {
            node_id,
            setup_pin,
            host: host.to_string(),
            port,
        })
        .await
        .map_err(PairingError::PairingFailure)
    }

    async fn unpair_bridge(&self) -> Result<(), PairingError> {
        self.request(ControllerRequest::UnpairBridge)
            .await
            .map_err(PairingError::UnpairingFailure)
    }
}

#[async_trait]
impl WindowService for SocketBackend {
    async fn open_local_window(&self, params: &WindowParams) -> Result<(), WindowError> {
        self.request(ControllerRequest::OpenLocalWindow {
            params: params.clone(),
        })
        .await
        .map_err(WindowError::WindowOpenFailure)
    }

    async fn open_remote_window(
        &self,
        target: NodeId,
        endpoint_id: EndpointId,
        params: &WindowParams,
    ) -> Result<(), WindowError> {
        self.request(ControllerRequest::OpenRemoteWindow {
            target,
            endpoint_id,
            params: params.clone(),
        })
        .await
        .map_err(WindowError::WindowOpenFailure)
    }
}

#[async_trait]
impl BridgeClient for SocketBackend {
    async fn subscribe_bridge(&self, bridge: NodeId) -> Result<()> {
        self.request(ControllerRequest::SubscribeBridge { bridge })
            .await
            .map_err(anyhow::Error::msg)
    }

    async fn read_device_categories(&self, bridge: NodeId) -> Result<()> {
        self.request(ControllerRequest::ReadDeviceCategories { bridge })
            .await
            .map_err(anyhow::Error::msg)
    }

    async fn request_commissioning_approval(
        &self,
        bridge: NodeId,
        request_id: u64,
        endpoint_id: EndpointId,
        response_timeout_secs: u16,
    ) -> Result<()> {
        self.request(ControllerRequest::RequestCommissioningApproval {
            bridge,
            request_id,
            endpoint_id,
            response_timeout_secs,
        })
        .await
        .map_err(anyhow::Error::msg)
    }
}
