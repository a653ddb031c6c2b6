use super::AgentInvoker;
use super::template::{as_text, render_task};
use crate::agents::InvocationRequest;
use crate::error::{KernelError, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Predicate over the routed input. Paths follow the pipeline's `pick`
/// rules: a JSON pointer when they start with `/`, otherwise a top-level field.
#[derive(Clone)]
pub enum RouteCondition {
    Equals { path: String, value: Value },
    /// Substring match on the text form, or membership for arrays.
    Contains { path: String, needle: String },
    Exists { path: String },
    Custom(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl fmt::Debug for RouteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals { path, value } => f
                .debug_struct("Equals")
                .field("path", path)
                .field("value", value)
                .finish(),
            Self::Contains { path, needle } => f
                .debug_struct("Contains")
                .field("path", path)
                .field("needle", needle)
                .finish(),
            Self::Exists { path } => f.debug_struct("Exists").field("path", path).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl RouteCondition {
    fn matches(&self, input: &Value) -> bool {
        match self {
            Self::Equals { path, value } => lookup(input, path) == Some(value),
            Self::Contains { path, needle } => match lookup(input, path) {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str() == Some(needle.as_str())),
                Some(value) => as_text(value).contains(needle.as_str()),
                None => false,
            },
            Self::Exists { path } => lookup(input, path).is_some_and(|value| !value.is_null()),
            Self::Custom(predicate) => predicate(input),
        }
    }
}

fn lookup<'v>(input: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        Some(input)
    } else if path.starts_with('/') {
        input.pointer(path)
    } else {
        input.get(path)
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub condition: RouteCondition,
    pub agent_id: String,
}

impl Route {
    pub fn new(condition: RouteCondition, agent_id: impl Into<String>) -> Self {
        Self {
            condition,
            agent_id: agent_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub routes: Vec<Route>,
    pub default_agent_id: Option<String>,
    /// Task sent to the chosen agent. Defaults to the input's text form.
    pub task_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResult {
    pub agent_id: String,
    /// Index of the matching route, `None` when the default was used.
    pub matched_route: Option<usize>,
    pub output: Value,
}

pub(super) async fn run(
    invoker: &dyn AgentInvoker,
    config: &RouterConfig,
    input: Value,
    cancel: &CancellationToken,
) -> Result<RouteResult> {
    let matched = config
        .routes
        .iter()
        .position(|route| route.condition.matches(&input));
    let agent_id = match matched {
        Some(index) => config.routes[index].agent_id.clone(),
        None => config.default_agent_id.clone().ok_or_else(|| {
            KernelError::Orchestration("no route matched and no default agent".to_string())
        })?,
    };
    if cancel.is_cancelled() {
        return Err(KernelError::Cancelled);
    }

    let task = match &config.task_template {
        Some(template) => render_task(template, &input, &input)?,
        None => as_text(&input),
    };
    tracing::debug!(agent_id, matched_route = ?matched, "routing request");
    let output = invoker
        .invoke(&agent_id, InvocationRequest::new(task, input), cancel)
        .await?;
    Ok(RouteResult {
        agent_id,
        matched_route: matched,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::Orchestrator;
    use crate::orchestration::testing::{Behavior, ScriptedInvoker};
    use serde_json::json;

    fn config() -> RouterConfig {
        RouterConfig {
            routes: vec![
                Route::new(
                    RouteCondition::Equals {
                        path: "kind".into(),
                        value: json!("code"),
                    },
                    "coder",
                ),
                Route::new(
                    RouteCondition::Contains {
                        path: "/meta/tags".into(),
                        needle: "urgent".into(),
                    },
                    "pager",
                ),
                Route::new(
                    RouteCondition::Exists {
                        path: "image".into(),
                    },
                    "vision",
                ),
            ],
            default_agent_id: Some("general".into()),
            task_template: Some("Handle {{ data.kind }}".into()),
        }
    }

    fn scripted() -> Arc<ScriptedInvoker> {
        Arc::new(
            ScriptedInvoker::default()
                .with("coder", Behavior::Echo)
                .with("pager", Behavior::Echo)
                .with("vision", Behavior::Echo)
                .with("general", Behavior::Echo),
        )
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let invoker = scripted();
        let orchestrator = Orchestrator::new(invoker.clone());
        let result = orchestrator
            .route(
                &config(),
                json!({"kind": "code", "meta": {"tags": ["urgent"]}}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.agent_id, "coder");
        assert_eq!(result.matched_route, Some(0));
        assert_eq!(result.output["task"], json!("Handle code"));
        assert_eq!(invoker.called(), vec!["coder"]);
    }

    #[tokio::test]
    async fn pointer_and_exists_conditions() {
        let invoker = scripted();
        let orchestrator = Orchestrator::new(invoker.clone());
        let urgent = orchestrator
            .route(
                &config(),
                json!({"kind": "chat", "meta": {"tags": ["urgent"]}}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(urgent.agent_id, "pager");

        let image = orchestrator
            .route(
                &config(),
                json!({"kind": "chat", "image": "b64"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(image.agent_id, "vision");
        assert_eq!(invoker.called(), vec!["pager", "vision"]);
    }

    #[tokio::test]
    async fn falls_back_to_default() {
        let invoker = scripted();
        let result = Orchestrator::new(invoker.clone())
            .route(&config(), json!({"kind": "chat"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.agent_id, "general");
        assert_eq!(result.matched_route, None);
        assert_eq!(invoker.called().len(), 1);
    }

    #[tokio::test]
    async fn no_match_without_default_invokes_nobody() {
        let invoker = scripted();
        let mut config = config();
        config.default_agent_id = None;
        let err = Orchestrator::new(invoker.clone())
            .route(&config, json!({"kind": "chat"}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Orchestration(_)));
        assert!(invoker.called().is_empty());
    }

    #[tokio::test]
    async fn custom_condition_and_plain_text_task() {
        let invoker = scripted();
        let config = RouterConfig {
            routes: vec![Route::new(
                RouteCondition::Custom(Arc::new(|input: &Value| {
                    input.as_str().is_some_and(|text| text.len() > 5)
                })),
                "coder",
            )],
            default_agent_id: Some("general".into()),
            task_template: None,
        };
        let result = Orchestrator::new(invoker)
            .route(&config, json!("a long request"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.agent_id, "coder");
        assert_eq!(result.output["task"], json!("a long request"));
    }
}
