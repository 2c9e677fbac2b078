//! End-to-end adapter lifecycle.
//!
//! Identity, validation and management endpoints are served by a mockito
//! server; the broker session is the in-memory mock from `test-utils`.

use std::sync::Arc;

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Map, Value};

use event_mesh::config::{AppMetadata, VcapServices};
use event_mesh::management::{ErrorCode, FailureReason};
use event_mesh::session::mock::{Disposition, MockBroker};
use event_mesh::session::{Payload, SettlementOutcome};
use event_mesh::{
    ConsumerState, DeliveryError, EventRouter, InboundEvent, MeshEnvironment, MeshError,
    MeshEventBus, MeshOptions, ProcessingError, SessionState,
};

const QUEUES: &str = "/SEMP/v2/config/msgVpns/vpn1/queues";
const SUBSCRIPTIONS: &str = "/SEMP/v2/config/msgVpns/vpn1/queues/orders-q/subscriptions";

fn vcap(server: &ServerGuard) -> Value {
    json!({
        "user-provided": [{
            "name": "advanced-event-mesh",
            "label": "user-provided",
            "credentials": {
                "authentication-service": {
                    "tokenendpoint": format!("{}/oauth2/token", server.url()),
                    "clientid": "mesh-client",
                    "clientsecret": "mesh-secret"
                },
                "endpoints": {
                    "advanced-event-mesh": {
                        "uri": server.url(),
                        "smf_uri": "wss://broker.example.com:443"
                    }
                },
                "vpn": "vpn1"
            }
        }],
        "aem-validation-service": [{
            "name": "aem-validation",
            "label": "aem-validation-service",
            "plan": "aem-validation-service-plan",
            "credentials": {
                "handshake": {
                    "oa2": {
                        "clientid": "validation-client",
                        "clientsecret": "validation-secret",
                        "tokenendpoint": format!("{}/validation/oauth2/token", server.url())
                    },
                    "uri": format!("{}/validate", server.url())
                },
                "serviceinstanceid": "si-1"
            }
        }]
    })
}

fn environment(vcap: Value) -> MeshEnvironment {
    MeshEnvironment {
        vcap: Some(VcapServices::from_json(&vcap.to_string()).unwrap()),
        app: AppMetadata {
            id: Some("abcdef12".into()),
            name: Some("orders-srv".into()),
        },
    }
}

fn options() -> MeshOptions {
    let mut options = MeshOptions::default();
    options.queue.name = Some("orders-q".into());
    options
}

async fn identity(server: &mut ServerGuard) -> (Mock, Mock) {
    let data = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
            Matcher::UrlEncoded("client_id".into(), "mesh-client".into()),
        ]))
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "data-token", "expires_in": 3600}"#)
        .create_async()
        .await;
    let validation = server
        .mock("POST", "/validation/oauth2/token")
        .match_body(Matcher::UrlEncoded("client_id".into(), "validation-client".into()))
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "validation-token", "expires_in": 3600}"#)
        .create_async()
        .await;
    (data, validation)
}

async fn validation(server: &mut ServerGuard, status: usize) -> Mock {
    server
        .mock("POST", "/validate")
        .match_header("authorization", "Bearer validation-token")
        .match_body(Matcher::Json(json!({"hostName": "127.0.0.1"})))
        .with_status(status)
        .create_async()
        .await
}

async fn startup(server: &mut ServerGuard) {
    identity(server).await;
    validation(server, 200).await;
}

fn semp_ok(data: Value) -> String {
    json!({"data": data, "meta": {"responseCode": 200}}).to_string()
}

fn semp_error(status: &str, description: &str) -> String {
    json!({
        "meta": {
            "error": {"code": 10, "description": description, "status": status},
            "responseCode": 400
        }
    })
    .to_string()
}

fn router(topics: &[&str]) -> Arc<EventRouter> {
    let mut router = EventRouter::new();
    for topic in topics {
        router.on(*topic, |event: Arc<InboundEvent>| async move {
            if event.data["poison"] == json!(true) {
                return Err(ProcessingError::unrecoverable("poison message"));
            }
            Ok(())
        });
    }
    Arc::new(router)
}

#[tokio::test]
async fn test_full_lifecycle() {
    let mut server = Server::new_async().await;
    let (data_token, validation_token) = identity(&mut server).await;
    let validate = validation(&mut server, 200).await;

    let create_queue = server
        .mock("POST", QUEUES)
        .match_header("authorization", "Bearer data-token")
        .match_body(Matcher::Json(json!({
            "queueName": "orders-q",
            "permission": "consume",
            "ingressEnabled": true,
            "egressEnabled": true
        })))
        .with_body(semp_ok(json!({"queueName": "orders-q"})))
        .create_async()
        .await;
    let list = server
        .mock("GET", SUBSCRIPTIONS)
        .with_body(semp_ok(json!([
            {"subscriptionTopic": "orders/created"},
            {"subscriptionTopic": "legacy"}
        ])))
        .create_async()
        .await;
    let remove = server
        .mock("DELETE", format!("{}/legacy", SUBSCRIPTIONS).as_str())
        .with_body(semp_ok(json!({})))
        .create_async()
        .await;
    let add = server
        .mock("POST", SUBSCRIPTIONS)
        .match_body(Matcher::Json(json!({"subscriptionTopic": "orders/cancelled"})))
        .with_body(semp_ok(json!({"subscriptionTopic": "orders/cancelled"})))
        .create_async()
        .await;

    let broker = MockBroker::new();
    let bus = MeshEventBus::connect(options(), environment(vcap(&server)), broker.factory())
        .await
        .unwrap();

    data_token.assert_async().await;
    validation_token.assert_async().await;
    validate.assert_async().await;
    assert_eq!(*bus.session_state().borrow(), SessionState::Up);
    assert_eq!(broker.sessions()[0].access_token, "data-token");
    assert_eq!(broker.sessions()[0].vpn_name, "vpn1");

    bus.start_listening(router(&["orders/created", "orders/cancelled"]))
        .await
        .unwrap();

    create_queue.assert_async().await;
    list.assert_async().await;
    remove.assert_async().await;
    add.assert_async().await;
    assert_eq!(*bus.consumer_state().borrow(), ConsumerState::Up);
    assert_eq!(broker.consumers()[0].queue_descriptor.name, "orders-q");

    let accepted = broker.deliver(
        "orders/created",
        Payload::Binary(br#"{"data": {"id": 1}}"#.to_vec()),
    );
    assert_eq!(accepted.await.unwrap(), Disposition::Acknowledged);

    let poisoned = broker.deliver(
        "orders/cancelled",
        Payload::Text(r#"{"data": {"poison": true}}"#.into()),
    );
    assert_eq!(
        poisoned.await.unwrap(),
        Disposition::Settled(SettlementOutcome::Rejected)
    );

    let unrouted = broker.deliver("stock/changed", Payload::Text("{}".into()));
    assert_eq!(
        unrouted.await.unwrap(),
        Disposition::Settled(SettlementOutcome::Failed)
    );

    bus.emit("orders/shipped", json!({"id": 1}), Map::new())
        .await
        .unwrap();
    broker.reject_topic("orders/forbidden");
    assert!(matches!(
        bus.emit("orders/forbidden", json!({}), Map::new()).await,
        Err(DeliveryError::Rejected { .. })
    ));

    bus.shutdown().await;
    assert_eq!(*bus.session_state().borrow(), SessionState::Disconnected);
    assert_eq!(*bus.consumer_state().borrow(), ConsumerState::Idle);
}

#[tokio::test]
async fn test_existing_topology_left_alone() {
    let mut server = Server::new_async().await;
    startup(&mut server).await;
    let create_queue = server
        .mock("POST", QUEUES)
        .with_status(400)
        .with_body(semp_error("ALREADY_EXISTS", "Already exists"))
        .create_async()
        .await;
    server
        .mock("GET", SUBSCRIPTIONS)
        .with_body(semp_ok(json!([{"subscriptionTopic": "orders/created"}])))
        .create_async()
        .await;
    let changes = server
        .mock("POST", SUBSCRIPTIONS)
        .expect(0)
        .create_async()
        .await;

    let broker = MockBroker::new();
    let bus = MeshEventBus::connect(options(), environment(vcap(&server)), broker.factory())
        .await
        .unwrap();
    bus.start_listening(router(&["orders/created"])).await.unwrap();

    create_queue.assert_async().await;
    changes.assert_async().await;
    assert_eq!(broker.consumers().len(), 1);
}

#[tokio::test]
async fn test_queue_creation_failure_starts_no_consumer() {
    let mut server = Server::new_async().await;
    startup(&mut server).await;
    server
        .mock("POST", QUEUES)
        .with_status(400)
        .with_body(semp_error("NOT_ALLOWED", "Max queues reached"))
        .create_async()
        .await;

    let broker = MockBroker::new();
    let bus = MeshEventBus::connect(options(), environment(vcap(&server)), broker.factory())
        .await
        .unwrap();
    let err = bus
        .start_listening(router(&["orders/created"]))
        .await
        .unwrap_err();

    match err {
        MeshError::Queue(e) => {
            assert_eq!(e.code, ErrorCode::CreateQueueFailed);
            match e.reason {
                FailureReason::Api(api) => assert_eq!(api.status, "NOT_ALLOWED"),
                other => panic!("expected API failure, got {:?}", other),
            }
        }
        other => panic!("expected queue error, got {}", other),
    }
    assert!(broker.consumers().is_empty());
    assert!(matches!(
        *bus.consumer_state().borrow(),
        ConsumerState::Failed(ref reason) if reason.contains("CREATE_QUEUE_FAILED")
    ));
}

#[tokio::test]
async fn test_subscription_failure_marks_consumer_failed() {
    let mut server = Server::new_async().await;
    startup(&mut server).await;
    server
        .mock("POST", QUEUES)
        .with_body(semp_ok(json!({"queueName": "orders-q"})))
        .create_async()
        .await;
    server
        .mock("GET", SUBSCRIPTIONS)
        .with_body(semp_ok(json!([])))
        .create_async()
        .await;
    server
        .mock("POST", SUBSCRIPTIONS)
        .with_status(400)
        .with_body(semp_error("NOT_ALLOWED", "Subscription limit reached"))
        .create_async()
        .await;

    let broker = MockBroker::new();
    let bus = MeshEventBus::connect(options(), environment(vcap(&server)), broker.factory())
        .await
        .unwrap();
    let err = bus
        .start_listening(router(&["orders/created"]))
        .await
        .unwrap_err();

    assert!(matches!(err, MeshError::Topology(_)));
    assert!(broker.consumers().is_empty());
    assert!(matches!(
        *bus.consumer_state().borrow(),
        ConsumerState::Failed(_)
    ));
}

#[tokio::test]
async fn test_skip_management_makes_no_management_calls() {
    let mut server = Server::new_async().await;
    startup(&mut server).await;
    let management = server
        .mock("POST", Matcher::Regex("^/SEMP/.*".into()))
        .expect(0)
        .create_async()
        .await;

    let mut options = options();
    options.skip_management = true;
    let broker = MockBroker::new();
    let bus = MeshEventBus::connect(options, environment(vcap(&server)), broker.factory())
        .await
        .unwrap();
    bus.start_listening(router(&["orders/created"])).await.unwrap();

    management.assert_async().await;
    assert_eq!(broker.consumers().len(), 1);
}

#[tokio::test]
async fn test_unprovisioned_broker_is_fatal() {
    let mut server = Server::new_async().await;
    identity(&mut server).await;
    validation(&mut server, 403).await;

    let broker = MockBroker::new();
    let result =
        MeshEventBus::connect(options(), environment(vcap(&server)), broker.factory()).await;

    assert!(matches!(result, Err(MeshError::Validation(_))));
    assert!(broker.sessions().is_empty());
}

#[tokio::test]
async fn test_token_failure_is_fatal() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/oauth2/token")
        .with_status(401)
        .with_body("invalid_client")
        .create_async()
        .await;

    let broker = MockBroker::new();
    let result =
        MeshEventBus::connect(options(), environment(vcap(&server)), broker.factory()).await;

    assert!(matches!(result, Err(MeshError::Auth(_))));
    assert!(broker.sessions().is_empty());
}

#[tokio::test]
async fn test_incomplete_binding_is_rejected() {
    let server = Server::new_async().await;
    let mut services = vcap(&server);
    services["user-provided"][0]["credentials"]
        .as_object_mut()
        .unwrap()
        .remove("vpn");

    let result = MeshEventBus::connect(
        options(),
        environment(services),
        MockBroker::new().factory(),
    )
    .await;

    match result {
        Err(MeshError::Config(e)) => assert!(e.to_string().contains("vpn is missing")),
        Err(other) => panic!("expected config error, got {}", other),
        Ok(_) => panic!("expected config error"),
    }
}
