use super::store::PermissionStore;
use super::{GrantKind, PermissionStatus, Scope};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// What the kernel asks the human about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub origin: String,
    pub scopes: Vec<Scope>,
    pub reason: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// The human's answer. Closing the prompt without answering is `Dismissed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromptOutcome {
    Granted {
        kind: GrantKind,
        #[serde(default)]
        allowed_tools: Vec<String>,
    },
    Denied,
    Dismissed,
}

/// UI surface that elicits a permission decision.
pub trait PromptSurface: Send + Sync {
    fn prompt_user<'a>(
        &'a self,
        request: &'a PromptRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PromptOutcome>> + Send + 'a>>;
}

/// Prompt surface for non-interactive contexts: every request is denied
/// without being recorded.
pub struct AutoDenyPrompt;

impl PromptSurface for AutoDenyPrompt {
    fn prompt_user<'a>(
        &'a self,
        _request: &'a PromptRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PromptOutcome>> + Send + 'a>> {
        Box::pin(async move { Ok(PromptOutcome::Dismissed) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub granted: bool,
    pub prompted: bool,
    pub status: PermissionStatus,
}

/// Resolve a permission request, prompting at most once.
///
/// Any requested scope that is already denied short-circuits to
/// `granted: false` without a prompt. When every scope is granted and every
/// requested tool is already allowed no prompt is issued either. A prompt
/// error or dismissal reads as `granted: false` and records nothing; an
/// explicit denial is recorded and sticks.
pub async fn request_permissions(
    store: &PermissionStore,
    prompt: &dyn PromptSurface,
    request: &PromptRequest,
    exec_ctx: Option<&str>,
) -> anyhow::Result<RequestOutcome> {
    let origin = request.origin.as_str();
    let check = store.check(origin, &request.scopes, exec_ctx);

    if !check.denied.is_empty() {
        tracing::debug!(
            origin,
            denied = ?check.denied,
            "request hits sticky denial; not prompting"
        );
        return Ok(RequestOutcome {
            granted: false,
            prompted: false,
            status: store.get_status(origin, exec_ctx),
        });
    }

    let allowed_tools = store.allowed_tools(origin);
    let tools_covered = request
        .tools
        .iter()
        .all(|tool| allowed_tools.contains(tool));
    if check.granted && tools_covered {
        return Ok(RequestOutcome {
            granted: true,
            prompted: false,
            status: store.get_status(origin, exec_ctx),
        });
    }

    let outcome = match prompt.prompt_user(request).await {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(origin, %error, "permission prompt failed; treating as dismissed");
            PromptOutcome::Dismissed
        }
    };

    match outcome {
        PromptOutcome::Granted {
            kind,
            allowed_tools,
        } => {
            // The user may narrow the tool list but never widen it.
            let tools: Vec<String> = allowed_tools
                .into_iter()
                .filter(|tool| request.tools.is_empty() || request.tools.contains(tool))
                .collect();
            let status = store.grant(origin, &request.scopes, kind, exec_ctx, &tools)?;
            let granted = request
                .scopes
                .iter()
                .all(|scope| status.get(scope).is_some_and(|grant| grant.is_granted()));
            Ok(RequestOutcome {
                granted,
                prompted: true,
                status,
            })
        }
        PromptOutcome::Denied => {
            let status = store.deny(origin, &request.scopes)?;
            Ok(RequestOutcome {
                granted: false,
                prompted: true,
                status,
            })
        }
        PromptOutcome::Dismissed => Ok(RequestOutcome {
            granted: false,
            prompted: true,
            status: store.get_status(origin, exec_ctx),
        }),
    }
}
