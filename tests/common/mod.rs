//! Scripted in-process plugins for driving the engine end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use plugin_ipc::error::{IpcError, Result};
use plugin_ipc::plugin::{DiscoveryResult, PluginFileState};
use plugin_ipc::protocol::{Envelope, MessageType};
use plugin_ipc::transport::memory::{duplex, MemoryChannel};
use plugin_ipc::transport::{Channel, PluginLauncher};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a fake plugin behaves.
#[derive(Clone)]
pub struct FakePlugin {
    /// Version reported in the handshake; `None` never answers it.
    pub protocol_version: Option<String>,
    /// Payload answered to `GetAuthenticationCredentials`; `None` never
    /// answers.
    pub credential_response: Option<Value>,
    /// Delay before answering credential requests.
    pub credential_delay: Duration,
    /// Send a `Log` request to the host right after the handshake.
    pub log_after_handshake: bool,
    /// Close the channel right after answering the handshake.
    pub exit_after_handshake: bool,
}

impl Default for FakePlugin {
    fn default() -> Self {
        Self {
            protocol_version: Some("2.0.0".to_string()),
            credential_response: Some(json!({
                "isValid": true,
                "username": "u",
                "password": "p",
                "authTypes": null
            })),
            credential_delay: Duration::ZERO,
            log_after_handshake: false,
            exit_after_handshake: false,
        }
    }
}

impl FakePlugin {
    pub fn answering(credential_response: Value) -> Self {
        Self {
            credential_response: Some(credential_response),
            ..Default::default()
        }
    }

    pub fn silent_handshake() -> Self {
        Self {
            protocol_version: None,
            ..Default::default()
        }
    }

    pub fn exiting_after_handshake() -> Self {
        Self {
            exit_after_handshake: true,
            ..Default::default()
        }
    }
}

/// What a running fake plugin observed.
#[derive(Default)]
pub struct Transcript {
    pub requests: Mutex<Vec<Envelope>>,
    pub cancels: Mutex<Vec<String>>,
    pub replies: Mutex<Vec<Envelope>>,
}

impl Transcript {
    pub fn requests_for(&self, method: &str) -> Vec<Envelope> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|envelope| envelope.method == method)
            .cloned()
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn run_plugin(
    channel: Arc<MemoryChannel>,
    behavior: FakePlugin,
    transcript: Arc<Transcript>,
    kill: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = kill.cancelled() => break,
            frame = channel.recv() => frame,
        };
        let Ok(Some(frame)) = frame else { break };
        let Ok(envelope) = Envelope::decode(&frame) else { continue };

        match envelope.message_type {
            MessageType::Request => {
                transcript.requests.lock().unwrap().push(envelope.clone());
                let channel = Arc::clone(&channel);
                let behavior = behavior.clone();
                tokio::spawn(async move { answer(&channel, &behavior, envelope).await });
            }
            MessageType::Cancel => {
                transcript.cancels.lock().unwrap().push(envelope.correlation_id);
            }
            _ => transcript.replies.lock().unwrap().push(envelope),
        }
    }

    let _ = channel.close().await;
}

async fn answer(channel: &MemoryChannel, behavior: &FakePlugin, request: Envelope) {
    let reply = match request.method.as_str() {
        "Handshake" => match &behavior.protocol_version {
            Some(version) => Envelope::response(
                "Handshake",
                request.correlation_id,
                json!({"responseCode": "Success", "protocolVersion": version}),
            ),
            None => return,
        },
        "GetAuthenticationCredentials" => match &behavior.credential_response {
            Some(payload) => {
                tokio::time::sleep(behavior.credential_delay).await;
                Envelope::response(
                    "GetAuthenticationCredentials",
                    request.correlation_id,
                    payload.clone(),
                )
            }
            None => return,
        },
        other => Envelope::fault(other, request.correlation_id, "unsupported method"),
    };

    let handshake = request.method == "Handshake";
    let _ = channel.send(reply.encode().unwrap()).await;

    if handshake && behavior.log_after_handshake {
        let log = Envelope::request(
            "Log",
            "plugin-log-1",
            json!({"logLevel": "Information", "message": "plugin started"}),
        );
        let _ = channel.send(log.encode().unwrap()).await;
    }

    if handshake && behavior.exit_after_handshake {
        let _ = channel.close().await;
    }
}

/// Starts a fake plugin per launch and counts launches.
pub struct FakeLauncher {
    behavior: FakePlugin,
    launch_delay: Duration,
    fail_with: Option<String>,
    launches: AtomicUsize,
    instances: Mutex<Vec<(Arc<Transcript>, CancellationToken)>>,
}

impl FakeLauncher {
    pub fn new(behavior: FakePlugin) -> Arc<Self> {
        Arc::new(Self::build(behavior, Duration::ZERO, None))
    }

    pub fn slow(behavior: FakePlugin, launch_delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(behavior, launch_delay, None))
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self::build(
            FakePlugin::default(),
            Duration::from_millis(20),
            Some(reason.to_string()),
        ))
    }

    fn build(behavior: FakePlugin, launch_delay: Duration, fail_with: Option<String>) -> Self {
        Self {
            behavior,
            launch_delay,
            fail_with,
            launches: AtomicUsize::new(0),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn transcript(&self, instance: usize) -> Arc<Transcript> {
        Arc::clone(&self.instances.lock().unwrap()[instance].0)
    }

    /// Terminate a running fake plugin, like a crashing process.
    pub fn kill(&self, instance: usize) {
        self.instances.lock().unwrap()[instance].1.cancel();
    }
}

#[async_trait]
impl PluginLauncher for FakeLauncher {
    async fn launch(&self, plugin: &DiscoveryResult) -> Result<Arc<dyn Channel>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.launch_delay).await;

        if let Some(reason) = &self.fail_with {
            return Err(IpcError::Launch {
                plugin: plugin.identity().to_string(),
                reason: reason.clone(),
            });
        }

        let (host, plugin_end) = duplex();
        let transcript = Arc::new(Transcript::default());
        let kill = CancellationToken::new();
        self.instances
            .lock()
            .unwrap()
            .push((Arc::clone(&transcript), kill.clone()));

        tokio::spawn(run_plugin(
            Arc::new(plugin_end),
            self.behavior.clone(),
            transcript,
            kill,
        ));

        Ok(Arc::new(host))
    }
}

pub fn discovery(name: &str) -> DiscoveryResult {
    DiscoveryResult::new(format!("/plugins/{name}"), name, PluginFileState::Valid)
}
