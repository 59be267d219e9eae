//! Integration tests for storage-agent
//!
//! Each test starts an agent in a temporary work directory, linked to an
//! in-process master, and drives it through the control endpoint. Plugin
//! containers run the real `test-csi-plugin` binary.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::TryRecvError};

use csi_plugin::paths;
use storage_agent::api::{API_PATH, ApiServer, Call, ContentType, HEALTH_PATH, ProviderStatus, Response};
use storage_agent::master::{MasterHandle, Offer, OfferEvent, spawn_master};
use storage_agent::provider::{
    CommandInfo, CsiPluginContainerInfo, CsiPluginInfo, ReservationInfo, ReservationType,
    ResourceProviderInfo, STORAGE_PROVIDER_TYPE, Service, StorageInfo,
};
use storage_agent::{Agent, AgentConfig};

const TEST_PLUGIN: &str = env!("CARGO_BIN_EXE_test-csi-plugin");
const CONTENT_TYPES: [ContentType; 2] = [ContentType::Protobuf, ContentType::Json];
const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

fn provider_with_plugin(name: &str, plugin_path: &str, volumes: &str) -> ResourceProviderInfo {
    ResourceProviderInfo {
        r#type: STORAGE_PROVIDER_TYPE.to_string(),
        name: name.to_string(),
        default_reservations: vec![ReservationInfo {
            r#type: ReservationType::Dynamic as i32,
            role: "storage".to_string(),
        }],
        storage: Some(StorageInfo {
            plugin: Some(CsiPluginInfo {
                r#type: "org.apache.mesos.csi.test".to_string(),
                name: format!("{}_plugin", name),
                containers: vec![CsiPluginContainerInfo {
                    services: vec![
                        Service::ControllerService as i32,
                        Service::NodeService as i32,
                    ],
                    command: Some(CommandInfo {
                        shell: Some(false),
                        value: plugin_path.to_string(),
                        arguments: vec![
                            plugin_path.to_string(),
                            "--available_capacity=0B".to_string(),
                            format!("--volumes={}", volumes),
                        ],
                    }),
                }],
            }),
            reconciliation_interval_seconds: None,
        }),
    }
}

fn provider(name: &str, volumes: &str) -> ResourceProviderInfo {
    provider_with_plugin(name, TEST_PLUGIN, volumes)
}

/// Scalar of the offered disk volume `id`, if any.
fn offered_volume(offer: &Offer, id: &str) -> Option<f64> {
    offer
        .resources
        .iter()
        .find(|r| r.disk.as_ref().and_then(|d| d.id.as_deref()) == Some(id))
        .map(|r| r.scalar)
}

struct TestAgent {
    temp: TempDir,
    agent: Agent,
    server: ApiServer,
    _master: MasterHandle,
    events: broadcast::Receiver<OfferEvent>,
}

impl TestAgent {
    async fn start() -> Self {
        Self::start_in(TempDir::new().unwrap()).await
    }

    /// Start with `info` already stored as `test.json`, the way an operator
    /// would place it.
    async fn start_with_config(info: &ResourceProviderInfo) -> Self {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("resource_providers");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("test.json"), serde_json::to_vec_pretty(info).unwrap()).unwrap();
        Self::start_in(temp).await
    }

    async fn start_in(temp: TempDir) -> Self {
        let mut config = AgentConfig::new("agent-1", temp.path());
        config.health_check_interval = None;

        let master = spawn_master();
        let events = master.subscribe();
        let agent = Agent::start(config, master.clone()).await.unwrap();
        let server = agent.server();

        Self {
            temp,
            agent,
            server,
            _master: master,
            events,
        }
    }

    async fn stop(self) -> TempDir {
        self.agent.shutdown().await;
        self.temp
    }

    fn config_dir(&self) -> PathBuf {
        self.temp.path().join("resource_providers")
    }

    fn csi_root(&self) -> PathBuf {
        self.temp.path().join("csi")
    }

    fn config_files(&self) -> Vec<String> {
        let mut files: Vec<String> = std::fs::read_dir(self.config_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        files
    }

    fn containers(&self) -> Vec<PathBuf> {
        paths::list_container_paths(&self.csi_root(), "*", "*").unwrap()
    }

    async fn call(&self, content_type: ContentType, call: &Call) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(API_PATH)
            .header(header::CONTENT_TYPE, content_type.media_type())
            .header(header::ACCEPT, content_type.media_type())
            .body(Full::new(Bytes::from(content_type.encode(call).unwrap())))
            .unwrap();
        let response = self.server.handle(request).await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    async fn resource_providers(&self, content_type: ContentType) -> Response {
        let (status, body) = self.call(content_type, &Call::get_resource_providers()).await;
        assert_eq!(status, StatusCode::OK);
        content_type.decode(&body).unwrap()
    }

    async fn next_event(&mut self) -> OfferEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an offer event")
            .unwrap()
    }

    async fn next_offer(&mut self) -> Offer {
        match self.next_event().await {
            OfferEvent::Offered(offer) => offer,
            other => panic!("expected an offer, got {:?}", other),
        }
    }

    fn no_pending_events(&mut self) -> bool {
        matches!(self.events.try_recv(), Err(TryRecvError::Empty))
    }
}

#[tokio::test]
async fn test_add_resource_provider_config() {
    for content_type in CONTENT_TYPES {
        let mut agent = TestAgent::start().await;
        let info = provider("test", "volume1:4GB");

        let (status, body) = agent.call(content_type, &Call::add(info.clone())).await;
        assert_eq!(status, StatusCode::OK, "{}", content_type);
        assert!(body.is_empty());

        assert_eq!(agent.config_files().len(), 1);
        assert_eq!(agent.agent.api().store().list(), vec![info.clone()]);
        assert_eq!(agent.containers().len(), 1);

        let offer = agent.next_offer().await;
        assert_eq!(offered_volume(&offer, "volume1"), Some(4096.0));
        assert!(
            offer
                .resources
                .iter()
                .all(|r| r.role.as_deref() == Some("storage") && r.provider_id.is_some())
        );

        let response = agent.resource_providers(content_type).await;
        let providers = response.get_resource_providers.unwrap().resource_providers;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].resource_provider_info, Some(info));
        assert_eq!(providers[0].state, ProviderStatus::Active as i32);
        assert_eq!(providers[0].total_resources.len(), 1);

        agent.stop().await;
    }
}

#[tokio::test]
async fn test_add_existing_config_conflicts() {
    for content_type in CONTENT_TYPES {
        let info = provider("test", "volume1:4GB");
        let mut agent = TestAgent::start_with_config(&info).await;
        agent.next_offer().await;

        let path = agent.config_dir().join("test.json");
        let before = std::fs::read(&path).unwrap();

        let (status, _) = agent.call(content_type, &Call::add(info.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT, "{}", content_type);

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(agent.config_files(), vec!["test.json".to_string()]);
        assert_eq!(agent.containers().len(), 1);

        agent.stop().await;
    }
}

#[tokio::test]
async fn test_update_resource_provider_config() {
    for content_type in CONTENT_TYPES {
        let mut agent = TestAgent::start_with_config(&provider("test", "volume1:4GB")).await;
        let first = agent.next_offer().await;
        assert_eq!(offered_volume(&first, "volume1"), Some(4096.0));
        let old_containers = agent.containers();

        let updated = provider("test", "volume1:2GB");
        let (status, _) = agent.call(content_type, &Call::update(updated.clone())).await;
        assert_eq!(status, StatusCode::OK, "{}", content_type);

        // Rewritten in place.
        assert_eq!(agent.config_files(), vec!["test.json".to_string()]);
        let stored: ResourceProviderInfo =
            serde_json::from_slice(&std::fs::read(agent.config_dir().join("test.json")).unwrap())
                .unwrap();
        assert_eq!(stored, updated);

        // The changed command means a new container.
        let new_containers = agent.containers();
        assert_eq!(new_containers.len(), 1);
        assert_ne!(new_containers, old_containers);

        match agent.next_event().await {
            OfferEvent::Rescinded { offer_id, .. } => assert_eq!(offer_id, first.id),
            other => panic!("expected a rescind, got {:?}", other),
        }
        let second = agent.next_offer().await;
        assert_eq!(offered_volume(&second, "volume1"), Some(2048.0));

        agent.stop().await;
    }
}

#[tokio::test]
async fn test_update_with_unchanged_plugin_reuses_container() {
    let info = provider("test", "volume1:4GB");
    let mut agent = TestAgent::start_with_config(&info).await;
    agent.next_offer().await;
    let containers = agent.containers();
    let pid_file = containers[0].join(paths::PID_FILE);
    let pid = std::fs::read_to_string(&pid_file).unwrap();

    let mut updated = info.clone();
    updated.default_reservations[0].role = "storage2".to_string();
    let (status, _) = agent.call(ContentType::Json, &Call::update(updated)).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(agent.containers(), containers);
    assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), pid);

    // Resources now carry the new role, so the old offer no longer fits.
    assert!(matches!(agent.next_event().await, OfferEvent::Rescinded { .. }));
    let offer = agent.next_offer().await;
    assert!(offer.resources.iter().all(|r| r.role.as_deref() == Some("storage2")));

    agent.stop().await;
}

#[tokio::test]
async fn test_update_renaming_plugin_moves_container() {
    let info = provider("test", "volume1:4GB");
    let mut agent = TestAgent::start_with_config(&info).await;
    agent.next_offer().await;
    let root = agent.csi_root();
    assert_eq!(paths::list_container_paths(&root, "*", "test_plugin").unwrap().len(), 1);

    let mut renamed = info.clone();
    renamed.storage.as_mut().unwrap().plugin.as_mut().unwrap().name = "renamed_plugin".to_string();
    let (status, _) = agent.call(ContentType::Json, &Call::update(renamed)).await;
    assert_eq!(status, StatusCode::OK);

    assert!(paths::list_container_paths(&root, "*", "test_plugin").unwrap().is_empty());
    assert_eq!(paths::list_container_paths(&root, "*", "renamed_plugin").unwrap().len(), 1);
    assert_eq!(agent.containers().len(), 1);

    agent.stop().await;
}

#[tokio::test]
async fn test_add_node_only_plugin() {
    let agent = TestAgent::start().await;
    let mut info = provider("test", "volume1:4GB");
    info.storage.as_mut().unwrap().plugin.as_mut().unwrap().containers[0].services =
        vec![Service::NodeService as i32];

    let (status, _) = agent.call(ContentType::Json, &Call::add(info.clone())).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(agent.agent.api().store().list(), vec![info]);
    assert_eq!(agent.containers().len(), 1);

    let response = agent.resource_providers(ContentType::Json).await;
    let providers = response.get_resource_providers.unwrap().resource_providers;
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].state, ProviderStatus::Active as i32);
    assert!(providers[0].total_resources.is_empty());

    agent.stop().await;
}

#[tokio::test]
async fn test_update_missing_config() {
    for content_type in CONTENT_TYPES {
        let mut agent = TestAgent::start().await;

        let (status, _) = agent
            .call(content_type, &Call::update(provider("test", "volume1:4GB")))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", content_type);

        assert!(agent.config_files().is_empty());
        assert!(agent.containers().is_empty());
        assert!(agent.no_pending_events());

        agent.stop().await;
    }
}

#[tokio::test]
async fn test_remove_resource_provider_config() {
    for content_type in CONTENT_TYPES {
        let mut agent = TestAgent::start_with_config(&provider("test", "volume1:4GB")).await;
        let offer = agent.next_offer().await;

        let (status, _) = agent
            .call(content_type, &Call::remove(STORAGE_PROVIDER_TYPE, "test"))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", content_type);

        assert!(agent.config_files().is_empty());
        assert!(agent.containers().is_empty());

        match agent.next_event().await {
            OfferEvent::Rescinded { offer_id, .. } => assert_eq!(offer_id, offer.id),
            other => panic!("expected a rescind, got {:?}", other),
        }
        assert!(agent.no_pending_events());

        let response = agent.resource_providers(content_type).await;
        assert!(response.get_resource_providers.unwrap().resource_providers.is_empty());

        agent.stop().await;
    }
}

#[tokio::test]
async fn test_remove_missing_config() {
    for content_type in CONTENT_TYPES {
        let mut agent = TestAgent::start().await;

        let (status, _) = agent
            .call(content_type, &Call::remove(STORAGE_PROVIDER_TYPE, "test"))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", content_type);
        assert!(agent.no_pending_events());

        agent.stop().await;
    }
}

#[tokio::test]
async fn test_concurrent_add_of_distinct_configs() {
    let agent = TestAgent::start().await;
    let calls: Vec<(ContentType, Call)> = ["first", "second", "third"]
        .into_iter()
        .zip(CONTENT_TYPES.into_iter().cycle())
        .map(|(name, content_type)| (content_type, Call::add(provider(name, "volume1:1GB"))))
        .collect();

    let results =
        join_all(calls.iter().map(|(content_type, call)| agent.call(*content_type, call))).await;
    for (status, _) in &results {
        assert_eq!(*status, StatusCode::OK);
    }

    assert_eq!(agent.config_files().len(), 3);
    assert_eq!(agent.containers().len(), 3);

    agent.stop().await;
}

#[tokio::test]
async fn test_concurrent_add_of_same_config() {
    let agent = TestAgent::start().await;
    let call = Call::add(provider("test", "volume1:4GB"));

    let ((status1, _), (status2, _)) = tokio::join!(
        agent.call(ContentType::Json, &call),
        agent.call(ContentType::Protobuf, &call)
    );
    let mut statuses = vec![status1.as_u16(), status2.as_u16()];
    statuses.sort();
    assert_eq!(statuses, vec![200, 409]);

    assert_eq!(agent.config_files().len(), 1);
    assert_eq!(agent.containers().len(), 1);

    agent.stop().await;
}

#[tokio::test]
async fn test_plugin_launch_failure_leaves_provider_degraded() {
    let mut agent = TestAgent::start().await;
    let info = provider_with_plugin("test", "/nonexistent/test-csi-plugin", "volume1:4GB");

    let (status, _) = agent.call(ContentType::Json, &Call::add(info)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    // Not rolled back.
    assert_eq!(agent.config_files().len(), 1);
    assert!(agent.containers().is_empty());
    assert!(agent.no_pending_events());

    let response = agent.resource_providers(ContentType::Json).await;
    let providers = response.get_resource_providers.unwrap().resource_providers;
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].state, ProviderStatus::Degraded as i32);
    assert!(providers[0].reason.is_some());
    assert!(providers[0].total_resources.is_empty());

    // An update with a working plugin recovers it.
    let (status, _) = agent
        .call(ContentType::Json, &Call::update(provider("test", "volume1:4GB")))
        .await;
    assert_eq!(status, StatusCode::OK);
    let offer = agent.next_offer().await;
    assert_eq!(offered_volume(&offer, "volume1"), Some(4096.0));

    agent.stop().await;
}

#[tokio::test]
async fn test_restart_relaunches_stored_configs() {
    let mut agent = TestAgent::start().await;
    let (status, _) = agent
        .call(ContentType::Json, &Call::add(provider("test", "volume1:4GB")))
        .await;
    assert_eq!(status, StatusCode::OK);
    agent.next_offer().await;

    let temp = agent.stop().await;
    assert!(paths::list_container_paths(&temp.path().join("csi"), "*", "*")
        .unwrap()
        .is_empty());

    // A container left behind by a crashed agent.
    let root = temp.path().join("csi");
    let orphan = paths::prepare_endpoint_dir(
        &root,
        "org.apache.mesos.csi.test",
        "stale_plugin",
        "stale--CONTROLLER_SERVICE--00000000",
        &temp.path().join("run"),
    )
    .unwrap();

    let mut agent = TestAgent::start_in(temp).await;
    assert!(!orphan.exists());
    assert_eq!(agent.containers().len(), 1);

    let offer = agent.next_offer().await;
    assert_eq!(offered_volume(&offer, "volume1"), Some(4096.0));

    agent.stop().await;
}

#[tokio::test]
async fn test_control_api_over_tcp() {
    let agent = TestAgent::start().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(agent.server.clone().serve(listener, async move {
        let _ = stop_rx.await;
    }));

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(connection);

    let body = serde_json::to_vec(&Call::add(provider("test", "volume1:4GB"))).unwrap();
    let request = Request::builder()
        .method(Method::POST)
        .uri(API_PATH)
        .header(header::HOST, addr.to_string())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method(Method::GET)
        .uri(HEALTH_PATH)
        .header(header::HOST, addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["agent_id"], "agent-1");
    assert_eq!(health["providers"][0]["name"], "test");
    assert_eq!(health["providers"][0]["state"], "ACTIVE");
    assert_eq!(health["providers"][0]["containers"][0]["state"], "RUNNING");

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
    agent.stop().await;
}
