//! The daemon's bus server against `BusClient` over loopback TCP, with the
//! script backend.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use ubusconf::BackendMode;
use ubusd::schema::parse_objects;
use ubusd::{Dispatcher, Registry, ScriptBackend, ScriptConfig, Server, ServerConfig};
use ubusproto::socket_config::{create_dealer_and_connect, frames_to_msgs, msgs_to_frames};
use ubusproto::{
    BusClient, BusFrame, CallEnvelope, CallFailure, ClientConfig, Command, ContentType, ParamKind,
    ReplyEnvelope,
};
use uuid::Uuid;

static PORT: AtomicU16 = AtomicU16::new(18590);

fn next_endpoint() -> String {
    let port = PORT.fetch_add(1, Ordering::SeqCst);
    format!("tcp://127.0.0.1:{}", port)
}

const OBJECTS: &str = r#"[
    { "object": "lamp",
      "method": [
        { "name": "on", "param": [] },
        { "name": "dim", "param": [ { "name": "level", "type": "BLOBMSG_TYPE_INT32" } ] }
      ] }
]"#;

const CALLBACK: &str = r#"
return {
    on = function(object, method, params)
        return '{"called":"on","object":"' .. object .. '","method":"' .. method .. '","params":' .. params .. '}'
    end,
    call = function(object, method, params)
        return '{"called":"call","method":"' .. method .. '"}'
    end,
}
"#;

struct Daemon {
    endpoint: String,
    cancel: CancellationToken,
    _script: NamedTempFile,
}

async fn start_daemon() -> Daemon {
    let mut script = NamedTempFile::new().unwrap();
    script.write_all(CALLBACK.as_bytes()).unwrap();

    let parsed = parse_objects(OBJECTS, Path::new("objects.json")).unwrap();
    let registry = Arc::new(Registry::build(parsed.objects, BackendMode::Script));
    let backend = ScriptBackend::new(ScriptConfig {
        callback_script: script.path().to_path_buf(),
        rpc_script: script.path().to_path_buf(),
        timeout: Duration::from_secs(5),
        sandbox: true,
    });
    let dispatcher = Arc::new(Dispatcher::new(backend, None));

    let endpoint = next_endpoint();
    let config = ServerConfig {
        endpoint: endpoint.clone(),
        name: "test-ubusd".to_string(),
    };
    let cancel = CancellationToken::new();
    let server = Server::new(config, registry, dispatcher);
    tokio::spawn(server.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    Daemon {
        endpoint,
        cancel,
        _script: script,
    }
}

async fn client(endpoint: &str) -> BusClient {
    BusClient::connect(ClientConfig::new("test", endpoint).with_timeout(Duration::from_secs(3)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_script_call_over_the_bus() {
    let daemon = start_daemon().await;
    let client = client(&daemon.endpoint).await;

    let reply = client.call("lamp", "on", json!({})).await.unwrap();
    assert_eq!(
        reply,
        ReplyEnvelope::ok(json!({"called": "on", "object": "lamp", "method": "on", "params": {}}))
    );

    // no `dim` in the module table, so the default callable serves it
    let reply = client.call("lamp", "dim", json!({"level": 4})).await.unwrap();
    assert_eq!(reply, ReplyEnvelope::ok(json!({"called": "call", "method": "dim"})));

    client.shutdown().await;
    daemon.cancel.cancel();
}

#[tokio::test]
async fn test_unknown_method_over_the_bus() {
    let daemon = start_daemon().await;
    let client = client(&daemon.endpoint).await;

    let reply = client.call("lamp", "explode", json!({})).await.unwrap();
    assert_eq!(reply.status, -1);
    assert_eq!(reply.data, json!({"code": -1, "message": "method not found"}));

    client.shutdown().await;
    daemon.cancel.cancel();
}

#[tokio::test]
async fn test_list_and_heartbeat() {
    let daemon = start_daemon().await;
    let client = client(&daemon.endpoint).await;

    client.heartbeat().await.unwrap();

    let catalog = client.list().await.unwrap();
    assert_eq!(catalog.backend, "script");
    assert_eq!(catalog.broker, None);

    let lamp = catalog.find("lamp").unwrap();
    let names: Vec<&str> = lamp.methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["on", "dim"]);
    assert_eq!(lamp.methods[1].params[0].name, "level");
    assert_eq!(lamp.methods[1].params[0].kind, ParamKind::Int32);

    let introspection = catalog.find("iot-ubusd").unwrap();
    assert_eq!(introspection.methods[0].name, "iot-rpc");

    client.shutdown().await;
    daemon.cancel.cancel();
}

#[tokio::test]
async fn test_undecodable_request_gets_invalid_request() {
    let daemon = start_daemon().await;
    let ctx = rzmq::Context::new().unwrap();
    let dealer = create_dealer_and_connect(&ctx, &daemon.endpoint, b"raw-dealer", "raw")
        .await
        .unwrap();

    let request_id = Uuid::new_v4();
    let mut frame = BusFrame::request(request_id, &CallEnvelope::new("lamp", "on", json!({}))).unwrap();
    frame.content_type = ContentType::Json;
    frame.body = Bytes::from_static(b"{not json");
    dealer.send_multipart(frames_to_msgs(&frame.to_frames())).await.unwrap();

    let msgs = tokio::time::timeout(Duration::from_secs(3), dealer.recv_multipart())
        .await
        .expect("no reply")
        .unwrap();
    let reply = BusFrame::from_frames(&msgs_to_frames(msgs)).unwrap();
    assert_eq!(reply.command, Command::Reply);
    assert_eq!(reply.request_id, request_id);

    let envelope: ReplyEnvelope = reply.payload().unwrap();
    assert_eq!(envelope, ReplyEnvelope::failure(CallFailure::InvalidRequest));

    daemon.cancel.cancel();
}
