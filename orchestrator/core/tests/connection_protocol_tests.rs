// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end Authority/Host/Agent scenarios over an ACL-enforcing in-memory bus.

use agora_core::application::{AclEvaluator, Authority, CredentialError, Host, HostSettings, HostState};
use agora_core::domain::acl::Claims;
use agora_core::domain::agent::AgentRecord;
use agora_core::domain::credential::CredentialStatus;
use agora_core::domain::data::Data;
use agora_core::domain::events::ControlEvent;
use agora_core::domain::host::HostDescriptor;
use agora_core::domain::message::{BrokerMessage, BrokerMessageType, Payload};
use agora_core::domain::plugin::{Function, Plugin};
use agora_core::infrastructure::broker::Broker;
use agora_core::infrastructure::clock::{Clock, SystemTimeSource};
use agora_core::infrastructure::discovery::AuthorityDiscovery;
use agora_core::infrastructure::repositories::{CredentialRecord, InMemoryAuthorityRepository};
use agora_core::infrastructure::transport::{InMemoryBus, TransportMessage, MESSAGE_TYPE_PROPERTY};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mockito::{Matcher, Mock, Server, ServerGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const AUTHORITY: &str = "a.example";
const WAIT: Duration = Duration::from_secs(20);

struct Mesh {
    server: ServerGuard,
    bus: InMemoryBus,
    repository: InMemoryAuthorityRepository,
    authority: Arc<Authority>,
}

fn basic_auth(client_id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{client_id}:{secret}")))
}

fn clock() -> Arc<Clock> {
    Arc::new(Clock::new(None, Arc::new(SystemTimeSource), Duration::from_secs(32)).unwrap())
}

fn broker(bus: &InMemoryBus, client_id: &str) -> Arc<Broker> {
    Arc::new(Broker::new(Arc::new(bus.transport()), clock(), client_id, Duration::from_secs(5)))
}

async fn mesh() -> Mesh {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/.well-known/openid-configuration")
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "broker_uri": "mem://bus",
                "token_endpoint": format!("http://{AUTHORITY}/token"),
            })
            .to_string(),
        )
        .create_async()
        .await;
    for host_id in ["h1", "h9"] {
        server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()))
            .match_header("authorization", basic_auth(host_id, "secret").as_str())
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({"access_token": format!("{host_id}-token"), "token_type": "Bearer"}).to_string(),
            )
            .create_async()
            .await;
    }

    let repository = InMemoryAuthorityRepository::new();
    repository.insert_host(HostDescriptor::new("h1", "Worker One"));
    repository.insert_agent(AgentRecord::new("ag1", "Researcher").on_host("h1").with_topic("chat"));
    repository.insert_agent(AgentRecord::new("ag2", "Writer").on_host("h1").with_topic("chat"));
    let mut disabled = AgentRecord::new("ag3", "Dormant").on_host("h1");
    disabled.is_enabled = false;
    repository.insert_agent(disabled);
    repository.insert_credential(CredentialRecord {
        agent_id: "ag1".to_string(),
        name: "OpenAI".to_string(),
        value: "sk-live".to_string(),
        status: CredentialStatus::Active,
    });

    let bus = InMemoryBus::with_policy(Arc::new(AclEvaluator::new(Arc::new(repository.clone()))));
    bus.register_token("authority-token", Claims::authority(AUTHORITY));
    bus.register_token("h1-token", Claims::host(AUTHORITY, "h1"));

    let authority = Authority::new(AUTHORITY, Arc::new(repository.clone()), broker(&bus, AUTHORITY)).unwrap();
    authority.connect("authority-token", "mem://bus").await.unwrap();

    Mesh {
        server,
        bus,
        repository,
        authority,
    }
}

fn host(mesh: &Mesh, host_id: &str, settings: HostSettings) -> Arc<Host> {
    host_with_secret(mesh, host_id, "secret", settings)
}

fn host_with_secret(mesh: &Mesh, host_id: &str, secret: &str, settings: HostSettings) -> Arc<Host> {
    let discovery =
        AuthorityDiscovery::new(&format!("https://{AUTHORITY}"), Some(&mesh.server.url()), None, Duration::from_secs(1))
            .unwrap();
    let descriptor =
        HostDescriptor::new(host_id, "Worker").with_plugin(Plugin::new("search").with_function(Function::new("query")));
    Host::new(descriptor, secret, Arc::new(discovery), broker(&mesh.bus, host_id), settings).unwrap()
}

async fn connected_host(mesh: &Mesh, settings: HostSettings) -> Arc<Host> {
    let host = host(mesh, "h1", settings);
    let mut state = host.watch_state();
    host.connect(&CancellationToken::new()).await.unwrap();
    timeout(WAIT, state.wait_for(|s| *s == HostState::Connected))
        .await
        .expect("host welcome")
        .unwrap();
    host
}

async fn rejected_token(mesh: &mut Mesh, host_id: &str, secret: &str) -> Mock {
    mesh.server
        .mock("POST", "/token")
        .match_header("authorization", basic_auth(host_id, secret).as_str())
        .with_status(401)
        .expect(1)
        .create_async()
        .await
}

async fn wait_until_matched(mock: &Mock) {
    timeout(WAIT, async {
        while !mock.matched_async().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("token endpoint never called");
}

/// Next control event published on `topic`.
async fn next_control_event(trace: &mut broadcast::Receiver<TransportMessage>, topic: &str) -> ControlEvent {
    timeout(WAIT, async {
        loop {
            let message = trace.recv().await.unwrap();
            if message.topic != topic {
                continue;
            }
            let message_type = BrokerMessageType::from_property(message.property(MESSAGE_TYPE_PROPERTY));
            let decoded = BrokerMessage::decode(message.topic, message_type, message.payload).unwrap();
            if let Some(Ok(Some(event))) = decoded.control_event() {
                return event;
            }
        }
    })
    .await
    .expect("no control event on topic")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_host_welcome_connects_enabled_agents() {
    let mesh = mesh().await;
    let host = connected_host(&mesh, HostSettings::default()).await;

    assert_eq!(host.agent_ids(), vec!["ag1".to_string(), "ag2".to_string()]);
    assert!(host.agent("ag1").unwrap().is_connected());

    let subscriptions = mesh.bus.subscriptions("h1");
    for filter in [
        "event/+/a.example/h1/-",
        "event/+/a.example/0/-",
        "event/+/a.example/-/ag1",
        "event/+/a.example/-/ag2",
    ] {
        assert!(subscriptions.contains(&filter.to_string()), "missing {filter}");
    }

    let plugins = host.plugins();
    assert_eq!(plugins.len(), 1);
    assert!(plugins[0].id.is_some());
    assert!(plugins[0].functions[0].id.is_some());
}

#[tokio::test]
async fn test_credential_round_trip() {
    let mesh = mesh().await;
    let host = connected_host(&mesh, HostSettings::default()).await;
    let agent = host.agent("ag1").unwrap();

    let value = timeout(WAIT, agent.get_credential("OpenAI")).await.unwrap().unwrap();
    assert_eq!(value, "sk-live");

    // Served from cache; no second round trip needed.
    assert_eq!(agent.get_credential("OpenAI").await.unwrap(), "sk-live");
}

#[tokio::test]
async fn test_missing_credential_times_out() {
    let mesh = mesh().await;
    let settings = HostSettings {
        credential_timeout: Duration::from_millis(300),
        ..HostSettings::default()
    };
    let host = connected_host(&mesh, settings).await;
    let agent = host.agent("ag2").unwrap();

    assert!(matches!(
        agent.get_credential("OpenAI").await,
        Err(CredentialError::Timeout(name)) if name == "OpenAI"
    ));
}

#[tokio::test]
async fn test_agents_on_one_host_exchange_messages() {
    let mesh = mesh().await;
    let host = connected_host(&mesh, HostSettings::default()).await;
    let sender = host.agent("ag1").unwrap();
    let mut inbox = host.agent("ag2").unwrap().subscribe_events();

    sender
        .send_to_agent("ag2", Data::new().with("text", "hello"))
        .await
        .unwrap();

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.sender_id(), Some("ag1"));
    assert_eq!(message.data().and_then(|d| d.get("text")), Some("hello"));
}

#[tokio::test]
async fn test_authority_propagates_agent_lifecycle() {
    let mesh = mesh().await;
    let host = connected_host(&mesh, HostSettings::default()).await;

    let record = AgentRecord::new("ag4", "Latecomer").on_host("h1");
    mesh.repository.insert_agent(record.clone());
    mesh.authority.agent_created(&record).await.unwrap();
    eventually(|| host.agent("ag4").is_some()).await;

    mesh.authority.agent_deleted(&record).await.unwrap();
    eventually(|| host.agent("ag4").is_none()).await;
    assert!(!mesh.bus.subscriptions("h1").contains(&"event/+/a.example/-/ag4".to_string()));
}

#[tokio::test]
async fn test_duplicate_agent_is_ignored() {
    let mesh = mesh().await;
    let host = connected_host(&mesh, HostSettings::default()).await;
    let original = host.agent("ag1").unwrap();

    let added = host
        .add_agent(AgentRecord::new("ag1", "Researcher").on_host("h1"))
        .await
        .unwrap();
    assert!(!added);
    assert!(Arc::ptr_eq(&original, &host.agent("ag1").unwrap()));
    assert_eq!(host.agent_ids().len(), 2);
}

#[tokio::test]
async fn test_unknown_host_is_never_welcomed() {
    let mesh = mesh().await;
    mesh.bus.register_token("h9-token", Claims::host(AUTHORITY, "h9"));
    let host = host(&mesh, "h9", HostSettings::default());

    host.connect(&CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(host.state(), HostState::AwaitingWelcome);
    assert!(host.agent_ids().is_empty());
}

#[tokio::test]
async fn test_disconnect_tears_down_agents_then_broker() {
    let mesh = mesh().await;
    let host = connected_host(&mesh, HostSettings::default()).await;
    let agent = host.agent("ag1").unwrap();

    host.disconnect().await.unwrap();

    assert!(!agent.is_connected());
    assert!(host.agent_ids().is_empty());
    assert!(!mesh.bus.is_connected("h1"));
    assert_eq!(host.state(), HostState::Disconnected);
}

#[tokio::test]
async fn test_run_retries_after_rejected_token() {
    let mut mesh = mesh().await;
    let rejected = rejected_token(&mut mesh, "h1", "rotated").await;
    let retry_delay = Duration::from_millis(500);
    let settings = HostSettings {
        connect_retry_delay: retry_delay,
        ..HostSettings::default()
    };
    let host = host_with_secret(&mesh, "h1", "rotated", settings);
    let mut state = host.watch_state();
    let cancel = CancellationToken::new();
    let task = host.start(cancel.clone());

    wait_until_matched(&rejected).await;
    let failed_at = Instant::now();
    rejected.assert_async().await;
    rejected.remove_async().await;
    mesh.server
        .mock("POST", "/token")
        .match_header("authorization", basic_auth("h1", "rotated").as_str())
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({"access_token": "h1-token", "token_type": "Bearer"}).to_string())
        .create_async()
        .await;

    timeout(WAIT, state.wait_for(|s| *s == HostState::Connected))
        .await
        .expect("host welcome after retry")
        .unwrap();
    assert!(failed_at.elapsed() >= retry_delay - Duration::from_millis(100));
    timeout(WAIT, task).await.expect("run returns once connected").unwrap();
    assert_eq!(host.agent_ids(), vec!["ag1".to_string(), "ag2".to_string()]);
}

#[tokio::test]
async fn test_cancel_stops_retry_loop() {
    let mut mesh = mesh().await;
    let rejected = rejected_token(&mut mesh, "h1", "rotated").await;
    let settings = HostSettings {
        connect_retry_delay: Duration::from_secs(3600),
        ..HostSettings::default()
    };
    let host = host_with_secret(&mesh, "h1", "rotated", settings);
    let cancel = CancellationToken::new();
    let task = host.start(cancel.clone());

    wait_until_matched(&rejected).await;
    cancel.cancel();

    timeout(Duration::from_secs(5), task)
        .await
        .expect("run loop exits on cancel")
        .unwrap();
    assert_eq!(host.state(), HostState::Disconnected);
    assert!(!mesh.bus.is_connected("h1"));
}

#[tokio::test]
async fn test_agent_announcements_round_trip_through_authority() {
    let mesh = mesh().await;
    let host = connected_host(&mesh, HostSettings::default()).await;
    let record = AgentRecord::new("ag4", "Latecomer").on_host("h1");
    mesh.repository.insert_agent(record.clone());
    let mut trace = mesh.bus.trace();

    host.start_agent(record).await.unwrap();
    assert!(host.agent("ag4").is_some());
    let announced = next_control_event(&mut trace, "event/ag4/a.example/-/-").await;
    assert!(matches!(announced, ControlEvent::AgentConnect { ref agent, .. } if agent.id == "ag4"));
    let forwarded = next_control_event(&mut trace, "event/-/a.example/h1/-").await;
    assert!(matches!(forwarded, ControlEvent::AgentConnect { ref agent, .. } if agent.id == "ag4"));
    // Let the host drop the duplicate connect before stopping the agent.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(host.agent_ids(), vec!["ag1".to_string(), "ag2".to_string(), "ag4".to_string()]);

    host.stop_agent("ag4").await.unwrap();
    assert!(host.agent("ag4").is_none());
    let forwarded = next_control_event(&mut trace, "event/-/a.example/h1/-").await;
    assert!(matches!(forwarded, ControlEvent::AgentDisconnect { ref agent_id, .. } if agent_id == "ag4"));

    // A departure announced by a running agent stops it on its host.
    host.agent("ag1").unwrap().announce_disconnect().await.unwrap();
    let forwarded = next_control_event(&mut trace, "event/-/a.example/h1/-").await;
    assert!(matches!(forwarded, ControlEvent::AgentDisconnect { ref agent_id, .. } if agent_id == "ag1"));
    eventually(|| host.agent("ag1").is_none()).await;
    assert!(host.agent("ag2").unwrap().is_connected());
}

#[tokio::test]
async fn test_shared_topic_outlives_one_agent() {
    let mesh = mesh().await;
    let host = connected_host(&mesh, HostSettings::default()).await;
    let mut inbox = host.agent("ag2").unwrap().subscribe_events();

    assert!(host.remove_agent("ag1").await.unwrap());
    assert!(mesh.bus.subscriptions("h1").contains(&"connect/chat".to_string()));

    let peer = broker(&mesh.bus, "observer");
    peer.connect("authority-token", "mem://bus").await.unwrap();
    peer.publish(&BrokerMessage::raw(
        "connect/chat",
        BrokerMessageType::Unknown,
        Payload::Raw("still here".to_string()),
    ))
    .await
    .unwrap();

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.topic, "connect/chat");
    assert_eq!(message.payload, Payload::Raw("still here".to_string()));
}
