//! Explicit name → handler table for hub methods.

use super::HubContext;
use crate::{error::HubError, invocation::InvocationDescriptor};
use anyhow::Context as _;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

type MethodHandler = Arc<dyn Fn(HubContext, Vec<Value>) -> HandlerFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct MethodRegistry {
  handlers: HashMap<String, MethodHandler>,
}

impl MethodRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a handler receiving the raw argument list. Replaces any handler
  /// already registered under `name`.
  pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F)
  where
    F: Fn(HubContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
  {
    let name = name.into();
    tracing::debug!("Registered hub method '{}'", name);
    self
      .handlers
      .insert(name, Arc::new(move |ctx, args| Box::pin(f(ctx, args))));
  }

  /// Register a handler whose argument list deserializes to `A`, usually a
  /// tuple matching the positional arguments.
  pub fn register_typed<A, R, F, Fut>(&mut self, name: impl Into<String>, f: F)
  where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    F: Fn(HubContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
  {
    let name = name.into();
    let f = Arc::new(f);
    let target = name.clone();
    self.register(name, move |ctx, args| {
      let f = f.clone();
      let target = target.clone();
      async move {
        let parsed: A = serde_json::from_value(Value::Array(args))
          .with_context(|| format!("invalid arguments for '{}'", target))?;
        let result = f(ctx, parsed).await?;
        Ok(serde_json::to_value(result)?)
      }
    });
  }

  pub fn has_method(&self, name: &str) -> bool {
    self.handlers.contains_key(name)
  }

  /// Registered method names, sorted.
  pub fn methods(&self) -> Vec<String> {
    let mut names: Vec<String> = self.handlers.keys().cloned().collect();
    names.sort();
    names
  }

  /// Run the handler for `invocation`, giving up after `timeout`.
  pub async fn dispatch(
    &self,
    ctx: HubContext,
    invocation: InvocationDescriptor,
    timeout: Duration,
  ) -> Result<Value, HubError> {
    let InvocationDescriptor {
      target, arguments, ..
    } = invocation;

    let handler = self
      .handlers
      .get(&target)
      .cloned()
      .ok_or_else(|| HubError::UnknownMethod(target.clone()))?;

    match tokio::time::timeout(timeout, handler(ctx, arguments)).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(source)) => Err(HubError::Handler { target, source }),
      Err(_) => Err(HubError::HandlerTimeout { target, timeout }),
    }
  }
}
