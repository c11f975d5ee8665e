//! Hub dispatcher: drives one connection from raw bytes to hub methods and back.
//!
//! A [`Hub`] is built once at startup with its methods, then
//! [`serve`](Hub::serve) is called once per connection with the transport's
//! reader and writer halves. Inbound frames are decoded in order, each
//! invocation is routed to a registered method, and results or errors are
//! queued on the connection's outbound queue, which a writer task drains
//! into the transport.
//!
//! ## Example Usage
//! ```no_run
//! use relayhub::{hub::Hub, lifetime::LocalLifetimeManager};
//! use serde_json::Value;
//! use std::{collections::HashMap, sync::Arc};
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = Hub::new(Arc::new(LocalLifetimeManager::default()))
//!         .method("send", |ctx, args| async move {
//!             ctx.all().invoke("receive", args).await;
//!             Ok(Value::Null)
//!         });
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await.unwrap();
//!     loop {
//!         let (socket, _) = listener.accept().await.unwrap();
//!         let hub = hub.clone();
//!         tokio::spawn(async move {
//!             let (reader, writer) = socket.into_split();
//!             let (connection, outbound) = hub.connect(HashMap::new());
//!             let _ = hub.serve(connection, outbound, reader, writer).await;
//!         });
//!     }
//! }
//! ```

use crate::{
  codec::{FrameCodec, Message, MessageKind},
  config::{ErrorPolicy, HubConfig},
  connection::{Connection, Outbound},
  error::HubError,
  invocation::{AdapterRegistry, InvocationResult},
  lifetime::{self, LifetimeManager},
};
use bytes::BytesMut;
use futures::SinkExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::{codec::FramedWrite, sync::CancellationToken};

mod context;
mod methods;

pub use context::{ClientProxy, HubContext};
pub use methods::{HandlerFuture, MethodRegistry};

/// Connection lifecycle callbacks.
#[async_trait::async_trait]
pub trait HubEvents: Send + Sync {
  /// Called after the connection is registered with the lifetime manager
  async fn on_connected(&self, _ctx: &HubContext) {}

  /// Called after the connection is removed from the lifetime manager
  async fn on_disconnected(&self, _ctx: &HubContext) {}
}

struct NoOpEvents;
#[async_trait::async_trait]
impl HubEvents for NoOpEvents {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
  Continue,
  Stop,
}

impl From<ErrorPolicy> for Flow {
  fn from(policy: ErrorPolicy) -> Self {
    match policy {
      ErrorPolicy::Close => Flow::Stop,
      ErrorPolicy::Continue => Flow::Continue,
    }
  }
}

#[derive(Clone)]
pub struct Hub {
  lifetime: Arc<dyn LifetimeManager>,
  methods: MethodRegistry,
  events: Arc<dyn HubEvents>,
  adapters: AdapterRegistry,
  config: HubConfig,
}

impl Hub {
  /// Create a hub over `lifetime` with default configuration.
  pub fn new(lifetime: Arc<dyn LifetimeManager>) -> Self {
    Self {
      lifetime,
      methods: MethodRegistry::new(),
      events: Arc::new(NoOpEvents),
      adapters: AdapterRegistry::new(),
      config: HubConfig::default(),
    }
  }

  /// Create a hub whose lifetime manager is built from `config.lifetime`.
  ///
  /// `adapters` is shared with the lifetime manager so broadcasts are encoded
  /// in each recipient's format.
  pub async fn from_config(config: HubConfig, adapters: AdapterRegistry) -> Result<Self, HubError> {
    let lifetime = lifetime::build(&config.lifetime, adapters.clone()).await?;
    Ok(Self {
      lifetime,
      methods: MethodRegistry::new(),
      events: Arc::new(NoOpEvents),
      adapters,
      config,
    })
  }

  /// Replace the per-connection settings. The lifetime manager is kept.
  pub fn with_config(mut self, config: HubConfig) -> Self {
    self.config = config;
    self
  }

  /// Adapters used to decode inbound invocations and encode results.
  pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
    self.adapters = adapters;
    self
  }

  pub fn with_events<H: HubEvents + 'static>(mut self, handler: H) -> Self {
    self.events = Arc::new(handler);
    self
  }

  /// Register a hub method receiving the raw argument list.
  pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
  where
    F: Fn(HubContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
  {
    self.methods.register(name, f);
    self
  }

  /// Register a hub method with typed arguments and result.
  pub fn method_typed<A, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
  where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    F: Fn(HubContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
  {
    self.methods.register_typed(name, f);
    self
  }

  pub fn lifetime(&self) -> &Arc<dyn LifetimeManager> {
    &self.lifetime
  }

  pub fn methods(&self) -> &MethodRegistry {
    &self.methods
  }

  pub fn config(&self) -> &HubConfig {
    &self.config
  }

  /// Create a connection sized by this hub's outbound capacity.
  pub fn connect(&self, metadata: HashMap<String, String>) -> (Arc<Connection>, Outbound) {
    Connection::new(metadata, self.config.outbound_capacity)
  }

  /// Serve one connection until the client closes it, the transport ends,
  /// the connection is disposed, or a protocol error ends it.
  ///
  /// Connect and disconnect hooks each fire at most once, connect first. A
  /// connection disposed before it was served moves straight to
  /// `Disconnected` and is never registered.
  ///
  /// ## Returns
  /// - `Ok(())` for an orderly end.
  /// - `Err(HubError)` for a transport failure, or a protocol error that the
  ///   configured policy turned into a close.
  pub async fn serve<R, W>(
    &self,
    connection: Arc<Connection>,
    outbound: Outbound,
    reader: R,
    writer: W,
  ) -> Result<(), HubError>
  where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
  {
    if connection.is_disposed() {
      connection.abandon();
      tracing::debug!("Connection {} was disposed before it was served", connection.id());
      return Ok(());
    }
    if !connection.mark_connected() {
      tracing::debug!("Connection {} is already being served or has ended", connection.id());
      return Ok(());
    }

    let ctx = HubContext::new(connection.clone(), self.lifetime.clone());
    self.lifetime.on_connected(connection.clone()).await;
    self.events.on_connected(&ctx).await;
    tracing::info!("Connection {} connected", connection.id());

    let closed = connection.closed().clone();
    let writer_task = tokio::spawn(write_loop(
      outbound,
      writer,
      closed.clone(),
      connection.id().to_string(),
    ));

    let outcome = tokio::select! {
      res = self.read_loop(&ctx, reader) => res,
      _ = closed.cancelled() => Ok(()),
    };

    if connection.mark_disconnected() {
      connection.dispose();
      self.lifetime.on_disconnected(connection.clone()).await;
      self.events.on_disconnected(&ctx).await;
      tracing::info!("Connection {} disconnected", connection.id());
    }

    let abort = writer_task.abort_handle();
    if tokio::time::timeout(self.config.close_timeout, writer_task)
      .await
      .is_err()
    {
      tracing::warn!(
        "Writer for connection {} did not finish within {:?}",
        connection.id(),
        self.config.close_timeout
      );
      abort.abort();
    }

    outcome
  }

  async fn read_loop<R>(&self, ctx: &HubContext, mut reader: R) -> Result<(), HubError>
  where
    R: AsyncRead + Unpin + Send,
  {
    let mut codec = FrameCodec::with_max_message_size(self.config.max_message_size);
    let mut buf = BytesMut::with_capacity(self.config.read_buffer_size);

    loop {
      loop {
        match codec.parse(&mut buf) {
          Ok(Some(message)) => {
            if self.dispatch(ctx, message).await == Flow::Stop {
              return Ok(());
            }
          }
          Ok(None) => break,
          Err(e) => {
            codec.reset();
            tracing::warn!("Frame error on connection {}: {}", ctx.connection_id(), e);
            ctx.connection().send(Message::error(e.to_string()));
            if Flow::from(self.config.frame_error_policy) == Flow::Stop {
              return Err(e.into());
            }
          }
        }
      }

      buf.reserve(self.config.read_buffer_size);
      if reader.read_buf(&mut buf).await? == 0 {
        if codec.is_mid_message() || !buf.is_empty() {
          tracing::debug!(
            "Connection {} closed with a partial message buffered",
            ctx.connection_id()
          );
        }
        return Ok(());
      }
    }
  }

  async fn dispatch(&self, ctx: &HubContext, message: Message) -> Flow {
    match message.kind() {
      MessageKind::Close => {
        tracing::debug!(
          "Connection {} closed by client: {}",
          ctx.connection_id(),
          message.payload_str().unwrap_or_default()
        );
        Flow::Stop
      }
      MessageKind::Error => {
        tracing::warn!(
          "Connection {} reported an error: {}",
          ctx.connection_id(),
          message.payload_str().unwrap_or_default()
        );
        Flow::Continue
      }
      MessageKind::Text | MessageKind::Binary => self.invoke(ctx, message).await,
    }
  }

  async fn invoke(&self, ctx: &HubContext, message: Message) -> Flow {
    let adapter = self.adapters.for_connection(ctx.connection());
    let invocation = match adapter.decode_invocation(&message) {
      Ok(invocation) => invocation,
      Err(e) => {
        tracing::warn!("Connection {}: {}", ctx.connection_id(), e);
        ctx.connection().send(Message::error(e.to_string()));
        return self.config.invalid_invocation_policy.into();
      }
    };

    let id = invocation.id.clone();
    match self
      .methods
      .dispatch(ctx.clone(), invocation, self.config.handler_timeout)
      .await
    {
      Ok(result) => {
        if let Some(id) = id {
          match adapter.encode_result(&InvocationResult { id, result }) {
            Ok(message) => {
              ctx.connection().send(message);
            }
            Err(e) => tracing::warn!("Failed to encode result: {}", e),
          }
        }
      }
      Err(e) => {
        tracing::warn!("Connection {}: {}", ctx.connection_id(), e);
        ctx.connection().send(Message::error(e.to_string()));
      }
    }
    Flow::Continue
  }
}

/// Drain `outbound` into the transport until the connection is disposed,
/// then flush whatever was already queued.
async fn write_loop<W>(mut outbound: Outbound, writer: W, closed: CancellationToken, id: String)
where
  W: AsyncWrite + Unpin + Send,
{
  let mut sink = FramedWrite::new(writer, FrameCodec::new());

  loop {
    tokio::select! {
      biased;
      message = outbound.recv() => match message {
        Some(message) => {
          if let Err(e) = sink.send(message).await {
            tracing::warn!("Failed to send message to {}: {}", id, e);
            return;
          }
        }
        None => break,
      },
      _ = closed.cancelled() => {
        while let Ok(message) = outbound.try_recv() {
          if sink.feed(message).await.is_err() {
            break;
          }
        }
        break;
      }
    }
  }

  if let Err(e) = sink.close().await {
    tracing::debug!("Failed to close transport for {}: {}", id, e);
  }
}
