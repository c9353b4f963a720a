//! Background executor: deferred re-validation, scheduling, listeners and
//! routing of inline requests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cris_core::{
    AuthenticationInfo, BackgroundConfig, BackgroundExecutor, CallContext, CapturedIdentity,
    Capability, CommandDef, CommandHandler, CommandProcessor, CommandRegistry, CrisConfig,
    CrisError, CrisResult, CrisService, CurrentCulture, DeferredCommandExecuted,
    DeferredCommandListener, HandlerContext, RegistryBuilder, RequestContext, SessionRegistry,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transfer {
    amount: i64,
}

impl CommandDef for Transfer {
    const NAME: &'static str = "Transfer";

    fn capabilities() -> Vec<Capability> {
        vec![Capability::AuthNormal, Capability::AuthDeviceId]
    }
}

#[derive(Debug, Deserialize)]
struct Stamp {
    label: String,
}

impl CommandDef for Stamp {
    const NAME: &'static str = "Stamp";
}

#[derive(Debug, Deserialize)]
struct Slow {}

impl CommandDef for Slow {
    const NAME: &'static str = "Slow";
}

#[derive(Debug, Deserialize)]
struct WhichCulture {}

impl CommandDef for WhichCulture {
    const NAME: &'static str = "WhichCulture";

    fn capabilities() -> Vec<Capability> {
        vec![Capability::CurrentCulture]
    }
}

#[derive(Debug, Deserialize)]
struct Report {}

impl CommandDef for Report {
    const NAME: &'static str = "Report";

    fn capabilities() -> Vec<Capability> {
        vec![Capability::BackgroundExecution]
    }
}

struct SlowHandler;

#[async_trait]
impl CommandHandler<Slow> for SlowHandler {
    type Output = &'static str;

    async fn handle(&self, _: Slow, _: &mut HandlerContext<'_>) -> anyhow::Result<&'static str> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok("done")
    }
}

struct ChannelListener(mpsc::UnboundedSender<DeferredCommandExecuted>);

#[async_trait]
impl DeferredCommandListener for ChannelListener {
    async fn on_executed(&self, event: &DeferredCommandExecuted) -> anyhow::Result<()> {
        self.0.send(event.clone())?;
        Ok(())
    }
}

type Journal = Arc<Mutex<Vec<(String, DateTime<Utc>)>>>;

fn registry(
    transfers: Arc<Mutex<Vec<i64>>>,
    journal: Journal,
    events: mpsc::UnboundedSender<DeferredCommandExecuted>,
) -> CommandRegistry {
    RegistryBuilder::new()
        .command::<Transfer>()
        .command::<Stamp>()
        .command::<Slow>()
        .command::<WhichCulture>()
        .command::<Report>()
        .with_authentication()
        .with_culture(["en", "fr"])
        .with_delayed_commands()
        .handler_fn::<Transfer, _, _>(move |cmd, _| {
            transfers.lock().unwrap().push(cmd.amount);
            Ok(())
        })
        .handler_fn::<Stamp, _, _>(move |cmd, _| {
            journal.lock().unwrap().push((cmd.label, Utc::now()));
            Ok(())
        })
        .handler::<Slow, _>(SlowHandler)
        .handler_fn::<WhichCulture, _, _>(|_, ctx| Ok(ctx.culture().name().to_string()))
        .handler_fn::<Report, _, _>(|_, ctx| Ok(ctx.background().is_some()))
        .deferred_listener(ChannelListener(events))
        .build()
        .unwrap()
}

struct Fixture {
    service: CrisService,
    sessions: Arc<SessionRegistry>,
    transfers: Arc<Mutex<Vec<i64>>>,
    journal: Journal,
    events: mpsc::UnboundedReceiver<DeferredCommandExecuted>,
}

fn start() -> Fixture {
    let transfers = Arc::new(Mutex::new(Vec::new()));
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let (tx, events) = mpsc::unbounded_channel();
    let sessions = Arc::new(SessionRegistry::new());
    let config = CrisConfig {
        supported_cultures: vec!["en".into(), "fr".into()],
        ..CrisConfig::default()
    };
    let service = CrisService::builder(registry(transfers.clone(), journal.clone(), tx))
        .config(config)
        .identity_provider(sessions.clone())
        .start()
        .unwrap();
    Fixture {
        service,
        sessions,
        transfers,
        journal,
        events,
    }
}

fn albert() -> AuthenticationInfo {
    AuthenticationInfo::authenticated(3712, "Albert", "dev-1")
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<DeferredCommandExecuted>) -> DeferredCommandExecuted {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("listener notified in time")
        .expect("listener channel open")
}

#[tokio::test]
async fn rotated_device_fails_revalidation_at_dequeue() {
    let fixture = start();
    fixture.sessions.login(albert());
    let command = fixture
        .service
        .registry()
        .create(
            "Transfer",
            fields(json!({"amount": 10, "actorId": 3712, "deviceId": "dev-1"})),
        )
        .unwrap();
    let call = CallContext::new(CurrentCulture::default(), albert());

    let execute_at = Utc::now() + chrono::Duration::milliseconds(100);
    let handle = fixture.service.submit(command, call, Some(execute_at)).unwrap();
    assert!(fixture.sessions.rotate_device(3712, "dev-2"));

    let executed = handle.executed_command().await.unwrap();
    assert!(executed.deferred);
    let error = executed.error().unwrap();
    assert!(error.is_validation_error);
    assert_eq!(
        error.errors[0].text,
        "Invalid device identifier: the provided identifier doesn't match the current authentication."
    );
    assert!(fixture.transfers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unchanged_session_executes_deferred_command() {
    let fixture = start();
    fixture.sessions.login(albert());
    let command = fixture
        .service
        .registry()
        .create(
            "Transfer",
            fields(json!({"amount": 25, "actorId": 3712, "deviceId": "dev-1"})),
        )
        .unwrap();
    let call = CallContext::new(CurrentCulture::default(), albert());

    let handle = fixture.service.submit(command, call, None).unwrap();
    let executed = handle.executed_command().await.unwrap();
    assert!(executed.is_success());
    assert_eq!(*fixture.transfers.lock().unwrap(), vec![25]);
}

#[tokio::test]
async fn scheduled_commands_run_in_time_order_after_target() {
    let fixture = start();
    let registry = fixture.service.registry();
    let late_at = Utc::now() + chrono::Duration::milliseconds(200);
    let early_at = Utc::now() + chrono::Duration::milliseconds(60);

    let late = registry.create("Stamp", fields(json!({"label": "late"}))).unwrap();
    let early = registry.create("Stamp", fields(json!({"label": "early"}))).unwrap();
    let late = fixture
        .service
        .submit(late, CallContext::default(), Some(late_at))
        .unwrap();
    let early = fixture
        .service
        .submit(early, CallContext::default(), Some(early_at))
        .unwrap();

    assert!(early.executed_command().await.unwrap().is_success());
    assert!(late.executed_command().await.unwrap().is_success());

    let journal = fixture.journal.lock().unwrap().clone();
    let labels: Vec<&str> = journal.iter().map(|(label, _)| label.as_str()).collect();
    assert_eq!(labels, ["early", "late"]);
    assert!(journal[0].1 >= early_at);
    assert!(journal[1].1 >= late_at);
}

#[tokio::test]
async fn abandoned_wait_still_runs_and_notifies() {
    let mut fixture = start();
    let command = fixture
        .service
        .registry()
        .create("Slow", Map::new())
        .unwrap();
    let handle = fixture
        .service
        .submit(command, CallContext::default(), None)
        .unwrap();

    let err = handle
        .wait_timeout(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, CrisError::WaitCancelled));

    let event = next_event(&mut fixture.events).await;
    assert_eq!(event.command.name(), "Slow");
    assert!(event.success);
}

#[tokio::test]
async fn supported_culture_routes_to_background() {
    let fixture = start();
    let command = fixture
        .service
        .registry()
        .create("WhichCulture", fields(json!({"currentCultureName": "fr"})))
        .unwrap();
    let call = CallContext::default().with_culture(CurrentCulture::new("en"));

    let executed = fixture.service.execute(command, call).await.unwrap();
    assert!(executed.deferred);
    assert_eq!(executed.result, CrisResult::Payload(json!("fr")));
}

#[tokio::test]
async fn unsupported_culture_warns_and_runs_inline() {
    let fixture = start();
    let payload = serde_json::to_vec(&json!(["WhichCulture", {"currentCultureName": "xx"}])).unwrap();
    let request = RequestContext::new(AuthenticationInfo::anonymous("dev-1"));

    let response = fixture.service.handle_request(&payload, &request).await;
    assert_eq!(response.result.result, CrisResult::Payload(json!("en")));
    let messages = response.result.validation_messages.unwrap();
    assert_eq!(messages[0].text, "Culture 'xx' is not supported. It will be ignored.");
}

#[tokio::test]
async fn background_marker_routes_to_background() {
    let fixture = start();
    let command = fixture
        .service
        .registry()
        .create("Report", Map::new())
        .unwrap();
    let executed = fixture
        .service
        .execute(command, CallContext::default())
        .await
        .unwrap();
    assert!(executed.deferred);
    assert_eq!(executed.result, CrisResult::Payload(json!(true)));
}

#[tokio::test]
async fn delayed_command_schedules_inner_command() {
    let mut fixture = start();
    let execute_at = Utc::now() + chrono::Duration::milliseconds(50);
    let payload = serde_json::to_vec(&json!([
        "DelayedCommand",
        {"command": ["Stamp", {"label": "later"}], "executionDate": execute_at}
    ]))
    .unwrap();
    let request = RequestContext::new(AuthenticationInfo::anonymous("dev-1"));

    let response = fixture.service.handle_request(&payload, &request).await;
    assert_eq!(response.result.result, CrisResult::Void);

    let event = next_event(&mut fixture.events).await;
    assert_eq!(event.command.name(), "Stamp");
    assert_eq!(event.scheduled_for, Some(execute_at));
    assert!(event.executed_at >= execute_at);
    assert_eq!(fixture.journal.lock().unwrap()[0].0, "later");
}

#[tokio::test]
async fn nested_delayed_command_is_rejected() {
    let fixture = start();
    let at = Utc::now();
    let payload = serde_json::to_vec(&json!([
        "DelayedCommand",
        {"command": ["DelayedCommand", {"command": ["Stamp", {"label": "x"}], "executionDate": at}], "executionDate": at}
    ]))
    .unwrap();
    let request = RequestContext::new(AuthenticationInfo::anonymous("dev-1"));

    let response = fixture.service.handle_request(&payload, &request).await;
    let error = response.result.result.error().unwrap();
    assert_eq!(
        error.errors[0].text,
        "A delayed command cannot contain another delayed command."
    );
}

#[tokio::test]
async fn shutdown_resolves_pending_to_stopped() {
    let (tx, _events) = mpsc::unbounded_channel();
    let registry = registry(Arc::default(), Arc::default(), tx);
    let processor = Arc::new(CommandProcessor::new(
        Arc::new(registry),
        &CrisConfig::default(),
    ));
    let executor = BackgroundExecutor::start(
        Arc::clone(&processor),
        Arc::new(CapturedIdentity),
        &BackgroundConfig::default(),
    );
    let submitter = executor.submitter().clone();

    let command = processor
        .registry()
        .create("Stamp", fields(json!({"label": "never"})))
        .unwrap();
    let handle = submitter
        .submit(
            Arc::new(command.clone()),
            CallContext::default(),
            None,
            Some(Utc::now() + chrono::Duration::seconds(60)),
        )
        .unwrap();

    executor.shutdown().await;
    assert!(matches!(
        handle.executed_command().await,
        Err(CrisError::ExecutorStopped)
    ));
    assert!(matches!(
        submitter.submit(Arc::new(command), CallContext::default(), None, None),
        Err(CrisError::ExecutorStopped)
    ));
}
