//! Sender behavior over the in-process transport and a failing one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cris_core::{
    AuthenticationInfo, Capability, CommandDef, CrisCallResult, CrisService, RegistryBuilder,
    RequestContext,
};
use cris_sender::{
    apply_ambient_values, ClientCommand, CommandModel, CommandRef, CrisSender, FieldValue,
    LocalTransport, SenderConfig, SenderError, Transport, TransportError,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Rename {
    new_name: String,
}

impl CommandDef for Rename {
    const NAME: &'static str = "Rename";

    fn capabilities() -> Vec<Capability> {
        vec![Capability::AuthUnsafe, Capability::AuthDeviceId]
    }

    fn result_facets() -> Vec<&'static str> {
        vec!["Name"]
    }
}

fn local_sender() -> (CrisSender<LocalTransport>, Arc<CommandModel>) {
    let registry = RegistryBuilder::new()
        .result_type("Name", &[])
        .command::<Rename>()
        .with_authentication()
        .handler_fn::<Rename, _, _>(|cmd, _| Ok(cmd.new_name.to_uppercase()))
        .build()
        .unwrap();
    let model = Arc::new(CommandModel::from_shape(&registry.resolve("Rename").unwrap()));
    let service = Arc::new(CrisService::builder(registry).start().unwrap());
    let session = RequestContext::new(AuthenticationInfo::authenticated(3712, "Albert", "dev-1"));
    let config = SenderConfig {
        backoff_base_ms: 1,
        ..SenderConfig::default()
    };
    (
        CrisSender::with_config(LocalTransport::new(service, session), config),
        model,
    )
}

fn rename(model: &Arc<CommandModel>, name: &str) -> CommandRef {
    ClientCommand::new(Arc::clone(model))
        .with_field("newName", json!(name))
        .into_ref()
}

#[tokio::test]
async fn ambient_values_fill_identity_fields() {
    let (sender, model) = local_sender();
    let command = rename(&model, "albert");

    let result: String = sender.send_and_get_result(&command).await.unwrap();
    assert_eq!(result, "ALBERT");
    assert_eq!(command.json_field("actorId"), Some(json!(3712)));
    assert_eq!(command.json_field("deviceId"), Some(json!("dev-1")));
}

#[tokio::test]
async fn override_reaches_server_validation() {
    let (sender, model) = local_sender();
    sender.set_override("deviceId", json!("dev-7"));

    let err = sender.send_or_throw(&rename(&model, "x")).await.unwrap_err();
    match err {
        SenderError::CommandFailed {
            is_validation_error,
            message,
            ..
        } => {
            assert!(is_validation_error);
            assert!(message.starts_with("Invalid device identifier"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn session_change_needs_ambient_refresh() {
    let (sender, model) = local_sender();
    sender.ambient_values().await.unwrap();
    sender
        .transport()
        .set_session(RequestContext::new(AuthenticationInfo::authenticated(42, "Bob", "dev-2")));

    let stale = sender.send(&rename(&model, "x")).await.unwrap();
    assert!(stale.result.is_error());

    let values = sender.update_ambient_values().await.unwrap();
    assert_eq!(values.get("actorId"), Some(&json!(42)));
    let fresh = sender.send(&rename(&model, "x")).await.unwrap();
    assert!(!fresh.result.is_error());
}

struct DownTransport {
    attempts: AtomicU32,
}

#[async_trait]
impl Transport for DownTransport {
    async fn send(&self, _: &Value) -> Result<CrisCallResult, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn exhausted_retries_become_communication_error() {
    let transport = Arc::new(DownTransport {
        attempts: AtomicU32::new(0),
    });
    let config = SenderConfig {
        max_attempts: 3,
        backoff_base_ms: 1,
        timeout_ms: 1_000,
    };
    let sender = CrisSender::with_config(Arc::clone(&transport), config);
    let model = Arc::new(CommandModel::new("Rename", ["actorId"]));

    let err = sender.send(&rename(&model, "x")).await.unwrap_err();
    match err {
        SenderError::Communication(e) => {
            assert_eq!(e.attempts, 3);
            assert_eq!(e.source, TransportError::Unavailable("connection refused".into()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn many_attempts_do_not_overflow_backoff() {
    let transport = Arc::new(DownTransport {
        attempts: AtomicU32::new(0),
    });
    let config = SenderConfig {
        max_attempts: 80,
        backoff_base_ms: 0,
        timeout_ms: 100,
    };
    let sender = CrisSender::with_config(Arc::clone(&transport), config);
    let model = Arc::new(CommandModel::new("Rename", ["actorId"]));

    let err = sender.send(&rename(&model, "x")).await.unwrap_err();
    assert!(matches!(err, SenderError::Communication(ref e) if e.attempts == 80));
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 80);
}

fn cached() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("actorId".into(), json!(3712));
    map
}

#[test]
fn batch_sets_each_nested_command_once() {
    let leaf = Arc::new(CommandModel::new("Rename", ["actorId"]));
    let batch_model = Arc::new(CommandModel::new("Batch", Vec::<String>::new()));
    let shared = ClientCommand::new(Arc::clone(&leaf)).into_ref();
    let other = ClientCommand::new(Arc::clone(&leaf)).into_ref();

    let mut by_key = BTreeMap::new();
    by_key.insert("first".to_string(), FieldValue::from(shared.clone()));
    by_key.insert("second".to_string(), FieldValue::from(other.clone()));
    let batch = ClientCommand::new(batch_model)
        .with_field("list", vec![FieldValue::from(shared.clone()), shared.clone().into()])
        .with_field("map", by_key)
        .into_ref();

    let report = apply_ambient_values(&batch, &cached(), &Map::new());
    assert_eq!(report.visited, 3);
    assert_eq!(report.assigned, 2);
    assert_eq!(shared.json_field("actorId"), Some(json!(3712)));
    assert_eq!(other.json_field("actorId"), Some(json!(3712)));
}

#[test]
fn propagation_is_idempotent() {
    let leaf = Arc::new(CommandModel::new("Rename", ["actorId"]));
    let inner = ClientCommand::new(Arc::clone(&leaf)).into_ref();
    let root = ClientCommand::new(leaf)
        .with_field("inner", inner)
        .into_ref();

    apply_ambient_values(&root, &cached(), &Map::new());
    let once = root.to_wire().unwrap();

    let mut changed = Map::new();
    changed.insert("actorId".into(), json!(1));
    let report = apply_ambient_values(&root, &changed, &Map::new());
    assert_eq!(report.assigned, 0);
    assert_eq!(root.to_wire().unwrap(), once);
}
