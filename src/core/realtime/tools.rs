//! Bridge between server-requested function calls and registered executors.
//!
//! Every call resolves to exactly one `function_call_output` item: the
//! executor's JSON result, an error payload when the executor failed or the
//! arguments did not parse, or a not-found payload for unknown names. Errors
//! never reach the caller.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{Value, json};

use super::base::{ClientEventSink, FunctionCallRequest, RealtimeError, RealtimeResult, ToolDefinition};
use super::messages::{ClientEvent, ConversationItem};

/// Future returned by a tool executor.
pub type ToolFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// An executable action invoked with the parsed call arguments.
pub type ToolExecutor = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
struct RegisteredTool {
    executor: ToolExecutor,
    definition: Option<ToolDefinition>,
}

#[derive(Default)]
pub struct ToolBridge {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under `name`, replacing any earlier registration.
    pub fn register<F, Fut>(&self, name: impl Into<String>, executor: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(name.into(), boxed(executor), None);
    }

    /// Register an executor together with the descriptor advertised to the
    /// server.
    pub fn register_with_definition<F, Fut>(&self, definition: ToolDefinition, executor: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(definition.name.clone(), boxed(executor), Some(definition));
    }

    fn insert(&self, name: String, executor: ToolExecutor, definition: Option<ToolDefinition>) {
        let replaced = self
            .tools
            .write()
            .insert(name.clone(), RegisteredTool { executor, definition })
            .is_some();
        if replaced {
            tracing::debug!("Replaced tool registration for {}", name);
        } else {
            tracing::debug!("Registered tool {}", name);
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors of every tool registered with one, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .filter_map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Run the call and build its `function_call_output` item.
    pub async fn resolve(&self, call: &FunctionCallRequest) -> ConversationItem {
        let output = match self.execute(call).await {
            Ok(value) => value.to_string(),
            Err(e) => {
                tracing::warn!("Tool call {} ({}) failed: {}", call.call_id, call.name, e);
                json!({ "error": e.to_string() }).to_string()
            }
        };
        ConversationItem::function_call_output(call.call_id.clone(), output)
    }

    async fn execute(&self, call: &FunctionCallRequest) -> RealtimeResult<Value> {
        // Clone out of the lock; executors may run for a long time.
        let executor = self
            .tools
            .read()
            .get(&call.name)
            .map(|tool| tool.executor.clone());
        let Some(executor) = executor else {
            return Err(RealtimeError::ToolExecution(format!(
                "Tool '{}' not found",
                call.name
            )));
        };

        let arguments = parse_arguments(&call.arguments)?;
        tracing::info!("Executing tool {} for call {}", call.name, call.call_id);

        match AssertUnwindSafe(executor(arguments)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RealtimeError::ToolExecution(format!("{e:#}"))),
            Err(_) => Err(RealtimeError::ToolExecution(format!(
                "Tool '{}' panicked",
                call.name
            ))),
        }
    }

    /// Create the output item remotely and, when `continue_turn` is set,
    /// request the follow-up response.
    pub async fn submit(
        &self,
        output: ConversationItem,
        sink: &dyn ClientEventSink,
        continue_turn: bool,
    ) -> RealtimeResult<()> {
        sink.send_event(ClientEvent::item_create(output)).await?;
        if continue_turn {
            sink.send_event(ClientEvent::response_create()).await?;
        }
        Ok(())
    }

    /// Resolve a call and submit its output in one step.
    pub async fn dispatch(
        &self,
        call: &FunctionCallRequest,
        sink: &dyn ClientEventSink,
    ) -> RealtimeResult<ConversationItem> {
        let output = self.resolve(call).await;
        self.submit(output.clone(), sink, true).await?;
        Ok(output)
    }
}

fn boxed<F, Fut>(executor: F) -> ToolExecutor
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |arguments| Box::pin(executor(arguments)) as ToolFuture)
}

fn parse_arguments(raw: &str) -> RealtimeResult<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
        .map_err(|e| RealtimeError::ToolExecution(format!("Invalid arguments: {e}")))
}
