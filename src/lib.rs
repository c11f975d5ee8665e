//! Real-time hub core: an incremental frame codec, connection and group
//! registries, and lifetime managers that broadcast to every connection, one
//! connection, a group, or a user, either in-process or across instances
//! through a relay.
//!
//! The transport is left to the host: anything that can hand over an
//! `AsyncRead` + `AsyncWrite` pair can be served by a [`Hub`].

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod group;
pub mod hub;
pub mod invocation;
pub mod lifetime;
pub mod relay;

pub use codec::{FrameCodec, Message, MessageKind};
pub use config::{ErrorPolicy, HubConfig, LifetimeConfig, RelayBackendConfig, RelaySettings};
pub use connection::{Connection, ConnectionRegistry, ConnectionState, Outbound};
pub use error::{FrameError, HubError, RelayError};
pub use group::GroupTable;
pub use hub::{ClientProxy, Hub, HubContext, HubEvents};
pub use invocation::{AdapterRegistry, InvocationAdapter, InvocationDescriptor, JsonAdapter};
pub use lifetime::{DistributedLifetimeManager, LifetimeManager, LocalLifetimeManager, Recipients};
pub use relay::{InMemoryRelay, RelayBackend, RelayExt};
#[cfg(feature = "redis-backend")]
pub use relay::RedisRelay;

use dotenv::dotenv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `tracing` subscriber filtered by `RUST_LOG`, defaulting to
/// debug output for this crate. Does nothing if a subscriber is already set.
pub fn init_tracing() {
  dotenv().ok();

  let _ = tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{}=debug", env!("CARGO_CRATE_NAME")).into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .try_init();
}
