use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use relayhub::{
  codec, AdapterRegistry, Connection, ConnectionState, ErrorPolicy, FrameCodec, Hub, HubConfig, HubContext,
  HubError, HubEvents, InMemoryRelay, InvocationAdapter, InvocationDescriptor, JsonAdapter,
  LifetimeManager, LocalLifetimeManager, Message, MessageKind, RelaySettings,
};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
  io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
  sync::Notify,
  task::JoinHandle,
};
use tokio_util::codec::FramedRead;

/// Client end of an in-memory transport.
struct Client {
  frames: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
  writer: WriteHalf<DuplexStream>,
}

impl Client {
  async fn send_raw(&mut self, bytes: &[u8]) {
    self.writer.write_all(bytes).await.unwrap();
  }

  async fn send(&mut self, message: Message) {
    self.send_raw(&codec::encode(&message)).await;
  }

  async fn invoke(&mut self, id: Option<&str>, target: &str, arguments: Vec<Value>) {
    let mut invocation = InvocationDescriptor::new(target, arguments);
    if let Some(id) = id {
      invocation = invocation.with_id(id);
    }
    let message = JsonAdapter.encode_invocation(&invocation).unwrap();
    self.send(message).await;
  }

  async fn recv(&mut self) -> Option<Message> {
    tokio::time::timeout(Duration::from_secs(2), self.frames.next())
      .await
      .expect("timed out waiting for a frame")
      .map(|res| res.unwrap())
  }

  async fn recv_json(&mut self) -> Value {
    let message = self.recv().await.expect("connection closed");
    assert_eq!(message.kind(), MessageKind::Text);
    serde_json::from_slice(message.payload()).unwrap()
  }
}

fn start(
  hub: &Hub,
  metadata: HashMap<String, String>,
) -> (Client, Arc<Connection>, JoinHandle<Result<(), HubError>>) {
  let (connection, outbound) = hub.connect(metadata);
  let (client, server) = tokio::io::duplex(16 * 1024);
  let (reader, writer) = tokio::io::split(server);
  let (client_reader, client_writer) = tokio::io::split(client);

  let handle = tokio::spawn({
    let hub = hub.clone();
    let connection = connection.clone();
    async move { hub.serve(connection, outbound, reader, writer).await }
  });

  let client = Client {
    frames: FramedRead::new(client_reader, FrameCodec::new()),
    writer: client_writer,
  };
  (client, connection, handle)
}

fn echo_hub(lifetime: Arc<dyn LifetimeManager>) -> Hub {
  Hub::new(lifetime)
    .method_typed("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
    .method("fail", |_ctx, _args| async move {
      Err::<Value, _>(anyhow::anyhow!("nope"))
    })
    .method("join", |ctx: HubContext, args| async move {
      let group = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
      ctx.add_to_group(&group).await;
      Ok(Value::Null)
    })
    .method("shout", |ctx: HubContext, args| async move {
      ctx.all().invoke("heard", args).await;
      Ok(Value::Null)
    })
    .method("tell_group", |ctx: HubContext, args| async move {
      let group = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
      ctx.group(&group).invoke("group_message", args).await;
      Ok(Value::Null)
    })
}

async fn wait_until<F, Fut>(mut check: F)
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  tokio::time::timeout(Duration::from_secs(2), async {
    while !check().await {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("condition not reached");
}

#[tokio::test]
async fn invocation_with_id_returns_result() {
  let hub = echo_hub(Arc::new(LocalLifetimeManager::default()));
  let (mut client, _conn, handle) = start(&hub, HashMap::new());

  client.invoke(Some("1"), "add", vec![json!(2), json!(40)]).await;
  assert_eq!(client.recv_json().await, json!({"id": "1", "result": 42}));

  client.send(Message::close("done")).await;
  handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_errors_keep_connection_open() {
  let hub = echo_hub(Arc::new(LocalLifetimeManager::default()));
  let (mut client, _conn, handle) = start(&hub, HashMap::new());

  client.invoke(Some("1"), "fail", vec![]).await;
  let error = client.recv().await.unwrap();
  assert_eq!(error.kind(), MessageKind::Error);
  assert_eq!(error.payload_str(), Some("Failed to invoke 'fail': nope"));

  client.invoke(Some("2"), "missing", vec![]).await;
  let error = client.recv().await.unwrap();
  assert_eq!(error.kind(), MessageKind::Error);
  assert_eq!(error.payload_str(), Some("Unknown hub method 'missing'"));

  client.invoke(Some("3"), "add", vec![json!(1), json!(1)]).await;
  assert_eq!(client.recv_json().await, json!({"id": "3", "result": 2}));

  client.send(Message::close("")).await;
  handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn invalid_invocation_continues_by_default() {
  let hub = echo_hub(Arc::new(LocalLifetimeManager::default()));
  let (mut client, _conn, handle) = start(&hub, HashMap::new());

  client.send(Message::text("not json")).await;
  assert_eq!(client.recv().await.unwrap().kind(), MessageKind::Error);

  client.invoke(Some("ok"), "add", vec![json!(0), json!(0)]).await;
  assert_eq!(client.recv_json().await["id"], json!("ok"));

  client.send(Message::close("")).await;
  handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn frame_error_closes_by_default() {
  let lifetime = Arc::new(LocalLifetimeManager::default());
  let hub = echo_hub(lifetime.clone());
  let (mut client, conn, handle) = start(&hub, HashMap::new());

  client.send_raw(b"data: X\r\n").await;

  let error = client.recv().await.unwrap();
  assert_eq!(error.kind(), MessageKind::Error);
  assert_eq!(error.payload_str(), Some("unknown message type: 'X'"));
  // Transport is closed after the error is flushed.
  assert!(client.recv().await.is_none());

  let res = handle.await.unwrap();
  assert!(matches!(res, Err(HubError::Frame(_))));
  assert!(!lifetime.connections().contains(conn.id()).await);
}

#[tokio::test]
async fn frame_error_continues_when_configured() {
  let config = HubConfig {
    frame_error_policy: ErrorPolicy::Continue,
    ..HubConfig::default()
  };
  let hub = echo_hub(Arc::new(LocalLifetimeManager::default())).with_config(config);
  let (mut client, _conn, handle) = start(&hub, HashMap::new());

  client.send_raw(b"data: T\r\nbroken\r\n").await;
  let error = client.recv().await.unwrap();
  assert_eq!(error.kind(), MessageKind::Error);
  assert_eq!(error.payload_str(), Some("expected the message prefix 'data: '"));

  client.invoke(Some("after"), "add", vec![json!(1), json!(2)]).await;
  assert_eq!(
    client.recv_json().await,
    json!({"id": "after", "result": 3})
  );

  client.send(Message::close("")).await;
  handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn chunked_frames_are_reassembled() {
  let hub = echo_hub(Arc::new(LocalLifetimeManager::default()));
  let (mut client, _conn, handle) = start(&hub, HashMap::new());

  let invocation = InvocationDescriptor::new("add", vec![json!(20), json!(22)]).with_id("c");
  let bytes = codec::encode(&JsonAdapter.encode_invocation(&invocation).unwrap());
  for chunk in bytes.chunks(3) {
    client.send_raw(chunk).await;
    tokio::task::yield_now().await;
  }
  assert_eq!(client.recv_json().await, json!({"id": "c", "result": 42}));

  client.send(Message::close("")).await;
  handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn broadcasts_and_groups_reach_other_clients() {
  let lifetime = Arc::new(LocalLifetimeManager::default());
  let hub = echo_hub(lifetime.clone());
  let (mut alice, alice_conn, _h1) = start(&hub, HashMap::new());
  let (mut bob, _bob_conn, _h2) = start(&hub, HashMap::new());

  wait_until(|| {
    let lifetime = lifetime.clone();
    async move { lifetime.connections().len().await == 2 }
  })
  .await;

  alice.invoke(None, "shout", vec![json!("hi")]).await;
  for client in [&mut alice, &mut bob] {
    let heard = client.recv_json().await;
    assert_eq!(heard["target"], json!("heard"));
    assert_eq!(heard["arguments"], json!(["hi"]));
  }

  alice.invoke(Some("j"), "join", vec![json!("room")]).await;
  assert_eq!(alice.recv_json().await["id"], json!("j"));
  assert!(
    lifetime
      .groups()
      .is_member("room", alice_conn.id())
      .await
  );

  bob.invoke(None, "tell_group", vec![json!("room")]).await;
  assert_eq!(alice.recv_json().await["target"], json!("group_message"));

  bob.send(Message::close("")).await;
  assert!(bob.recv().await.is_none());
}

#[tokio::test]
async fn disconnect_removes_connection_and_groups() {
  let lifetime = Arc::new(LocalLifetimeManager::default());
  let hub = echo_hub(lifetime.clone());
  let (mut client, conn, handle) = start(&hub, HashMap::new());

  client.invoke(Some("j"), "join", vec![json!("room")]).await;
  client.recv_json().await;
  assert!(lifetime.groups().is_member("room", conn.id()).await);

  drop(client);
  handle.await.unwrap().unwrap();

  assert!(!lifetime.connections().contains(conn.id()).await);
  assert!(lifetime.groups().members_of("room").await.is_empty());
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
  Connected(String),
  Disconnected(String),
}

/// Lifetime manager that records connect/disconnect hooks.
#[derive(Default)]
struct Recording {
  inner: LocalLifetimeManager,
  events: Mutex<Vec<Event>>,
}

#[async_trait]
impl LifetimeManager for Recording {
  async fn on_connected(&self, connection: Arc<Connection>) {
    self
      .events
      .lock()
      .push(Event::Connected(connection.id().to_string()));
    self.inner.on_connected(connection).await;
  }

  async fn on_disconnected(&self, connection: Arc<Connection>) {
    self
      .events
      .lock()
      .push(Event::Disconnected(connection.id().to_string()));
    self.inner.on_disconnected(connection).await;
  }

  async fn add_group(&self, connection_id: &str, group: &str) {
    self.inner.add_group(connection_id, group).await;
  }

  async fn remove_group(&self, connection_id: &str, group: &str) {
    self.inner.remove_group(connection_id, group).await;
  }

  async fn invoke_all(&self, target: &str, arguments: &[Value]) {
    self.inner.invoke_all(target, arguments).await;
  }

  async fn invoke_connection(&self, connection_id: &str, target: &str, arguments: &[Value]) {
    self
      .inner
      .invoke_connection(connection_id, target, arguments)
      .await;
  }

  async fn invoke_group(&self, group: &str, target: &str, arguments: &[Value]) {
    self.inner.invoke_group(group, target, arguments).await;
  }

  async fn invoke_user(&self, user_id: &str, target: &str, arguments: &[Value]) {
    self.inner.invoke_user(user_id, target, arguments).await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_transport_and_dispose_never_unbalance_hooks() {
  let recording = Arc::new(Recording::default());
  let hub = Hub::new(recording.clone());

  let mut ids = Vec::new();
  for i in 0..50 {
    let (client, conn, handle) = start(&hub, HashMap::new());
    ids.push(conn.id().to_string());

    // Dispose and drop the transport concurrently with serving.
    let disposer = tokio::spawn({
      let conn = conn.clone();
      async move {
        if i % 2 == 0 {
          tokio::task::yield_now().await;
        }
        conn.dispose();
      }
    });
    drop(client);
    disposer.await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
  }

  let events = recording.events.lock().clone();
  for id in ids {
    let mine: Vec<&Event> = events
      .iter()
      .filter(|e| matches!(e, Event::Connected(x) | Event::Disconnected(x) if *x == id))
      .collect();
    match mine.as_slice() {
      [] => {}
      [Event::Connected(_), Event::Disconnected(_)] => {}
      other => panic!("unexpected hook sequence for {id}: {other:?}"),
    }
  }
  assert_eq!(recording.inner.connections().len().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispose_during_dispatch_fires_connect_then_disconnect() {
  for _ in 0..20 {
    let recording = Arc::new(Recording::default());
    let entered = Arc::new(Notify::new());
    let hub = Hub::new(recording.clone()).method("hold", {
      let entered = entered.clone();
      move |_ctx, _args| {
        let entered = entered.clone();
        async move {
          entered.notify_one();
          std::future::pending::<()>().await;
          Ok(Value::Null)
        }
      }
    });

    let (mut client, conn, handle) = start(&hub, HashMap::new());
    client.invoke(Some("h"), "hold", vec![]).await;
    tokio::time::timeout(Duration::from_secs(2), entered.notified())
      .await
      .expect("handler never started");

    tokio::spawn({
      let conn = conn.clone();
      async move { conn.dispose() }
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
      .await
      .expect("serve kept running after dispose")
      .unwrap()
      .unwrap();

    let id = conn.id().to_string();
    assert_eq!(
      *recording.events.lock(),
      vec![Event::Connected(id.clone()), Event::Disconnected(id)]
    );
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(recording.inner.connections().len().await, 0);
  }
}

struct CountingEvents {
  connected: Arc<Mutex<Vec<String>>>,
  disconnected: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl HubEvents for CountingEvents {
  async fn on_connected(&self, ctx: &HubContext) {
    self.connected.lock().push(ctx.connection_id().to_string());
    ctx.caller().invoke("welcome", vec![]).await;
  }

  async fn on_disconnected(&self, ctx: &HubContext) {
    self.disconnected.lock().push(ctx.connection_id().to_string());
  }
}

#[tokio::test]
async fn hub_events_fire_around_the_connection() {
  let connected = Arc::new(Mutex::new(Vec::new()));
  let disconnected = Arc::new(Mutex::new(Vec::new()));
  let hub = Hub::new(Arc::new(LocalLifetimeManager::default())).with_events(CountingEvents {
    connected: connected.clone(),
    disconnected: disconnected.clone(),
  });

  let (mut client, conn, handle) = start(&hub, HashMap::new());
  assert_eq!(client.recv_json().await["target"], json!("welcome"));

  client.send(Message::close("")).await;
  handle.await.unwrap().unwrap();

  assert_eq!(*connected.lock(), vec![conn.id().to_string()]);
  assert_eq!(*disconnected.lock(), vec![conn.id().to_string()]);
}

#[tokio::test]
async fn user_broadcast_reaches_every_session() {
  let lifetime = Arc::new(LocalLifetimeManager::default());
  let hub = Hub::new(lifetime.clone()).method("ping_user", |ctx: HubContext, args| async move {
    let user = args
      .first()
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    ctx.user(&user).invoke("ping", vec![]).await;
    Ok(Value::Null)
  });

  let alice = HashMap::from([("user_id".to_string(), "alice".to_string())]);
  let (mut tab1, _, _h1) = start(&hub, alice.clone());
  let (mut tab2, _, _h2) = start(&hub, alice);
  let (mut other, _, _h3) = start(&hub, HashMap::new());

  wait_until(|| {
    let lifetime = lifetime.clone();
    async move { lifetime.connections().len().await == 3 }
  })
  .await;

  other.invoke(None, "ping_user", vec![json!("alice")]).await;
  assert_eq!(tab1.recv_json().await["target"], json!("ping"));
  assert_eq!(tab2.recv_json().await["target"], json!("ping"));
}

#[tokio::test]
async fn hubs_sharing_a_relay_form_one_domain() {
  let relay = InMemoryRelay::new();
  let relay_settings = RelaySettings::default();

  let mut hubs = Vec::new();
  let mut lifetimes = Vec::new();
  for _ in 0..2 {
    let lifetime = Arc::new(
      relayhub::DistributedLifetimeManager::new(
        Arc::new(relay.clone()),
        &relay_settings,
        AdapterRegistry::new(),
      )
      .await
      .unwrap(),
    );
    lifetimes.push(lifetime.clone());
    hubs.push(echo_hub(lifetime));
  }

  let (mut on_a, a_conn, _ha) = start(&hubs[0], HashMap::new());
  let (mut on_b, _b_conn, _hb) = start(&hubs[1], HashMap::new());
  wait_until(|| {
    let a = lifetimes[0].clone();
    let b = lifetimes[1].clone();
    async move { a.local().connections().len().await == 1 && b.local().connections().len().await == 1 }
  })
  .await;

  on_a.invoke(None, "shout", vec![json!("across")]).await;
  assert_eq!(on_a.recv_json().await["target"], json!("heard"));
  assert_eq!(on_b.recv_json().await["target"], json!("heard"));

  // Join on instance A, then address the group from instance B.
  on_a.invoke(Some("j"), "join", vec![json!("room")]).await;
  assert_eq!(on_a.recv_json().await["id"], json!("j"));
  assert!(
    lifetimes[0]
      .local()
      .groups()
      .is_member("room", a_conn.id())
      .await
  );

  on_b.invoke(None, "tell_group", vec![json!("room")]).await;
  assert_eq!(on_a.recv_json().await["target"], json!("group_message"));
}

#[tokio::test]
async fn from_config_builds_distributed_hub() {
  let config = HubConfig {
    lifetime: relayhub::LifetimeConfig::Distributed(RelaySettings::default()),
    ..HubConfig::default()
  };
  let hub = Hub::from_config(config, AdapterRegistry::new())
    .await
    .unwrap()
    .method("echo", |_ctx, args| async move { Ok(Value::Array(args)) });
  let (mut client, _conn, handle) = start(&hub, HashMap::new());

  client.invoke(Some("e"), "echo", vec![json!("x")]).await;
  assert_eq!(client.recv_json().await, json!({"id": "e", "result": ["x"]}));

  client.send(Message::close("")).await;
  handle.await.unwrap().unwrap();
  hub.lifetime().shutdown().await;
}
