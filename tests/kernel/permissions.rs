use super::{ScriptedPrompt, config_in};
use harbor_kernel::Kernel;
use harbor_kernel::permissions::{Grant, GrantKind, PromptOutcome, PromptRequest, Scope};
use std::sync::Arc;
use tempfile::TempDir;

const ORIGIN: &str = "https://example.com";

fn search_request() -> PromptRequest {
    PromptRequest {
        origin: ORIGIN.to_string(),
        scopes: vec![Scope::CallTool],
        reason: Some("look things up".to_string()),
        tools: vec!["search".to_string()],
    }
}

#[tokio::test]
async fn always_grant_allows_only_the_approved_tool() {
    let tmp = TempDir::new().unwrap();
    let prompt = Arc::new(ScriptedPrompt::answering([PromptOutcome::Granted {
        kind: GrantKind::Always,
        allowed_tools: vec!["search".to_string()],
    }]));
    let kernel = Kernel::new(config_in(tmp.path()), prompt.clone());

    let outcome = kernel
        .request_permissions(&search_request(), None)
        .await
        .unwrap();
    assert!(outcome.granted);
    assert!(outcome.prompted);
    assert_eq!(outcome.status.get(&Scope::CallTool), Some(&Grant::GrantedAlways));

    let store = kernel.permissions();
    assert!(store.is_tool_allowed(ORIGIN, "search", None));
    assert!(!store.is_tool_allowed(ORIGIN, "delete_everything", None));
    assert!(!store.is_tool_allowed("https://other.example", "search", None));

    let again = kernel
        .request_permissions(&search_request(), None)
        .await
        .unwrap();
    assert!(again.granted);
    assert!(!again.prompted);
    assert_eq!(prompt.asked().len(), 1);
}

#[tokio::test]
async fn granted_tools_survive_a_restart() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    {
        let prompt = Arc::new(ScriptedPrompt::answering([PromptOutcome::Granted {
            kind: GrantKind::Always,
            allowed_tools: vec!["search".to_string()],
        }]));
        let kernel = Kernel::new(config.clone(), prompt);
        kernel
            .request_permissions(&search_request(), None)
            .await
            .unwrap();
    }
    assert!(tmp.path().join("permissions.toml").exists());

    let reloaded = Kernel::new(config, Arc::new(ScriptedPrompt::default()));
    assert!(reloaded.permissions().is_tool_allowed(ORIGIN, "search", None));
}

#[tokio::test]
async fn denial_is_sticky_across_requests_and_restarts() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    let prompt = Arc::new(ScriptedPrompt::answering([PromptOutcome::Denied]));
    let kernel = Kernel::new(config.clone(), prompt.clone());

    let denied = kernel
        .request_permissions(&search_request(), None)
        .await
        .unwrap();
    assert!(!denied.granted);
    assert!(denied.prompted);

    let repeated = kernel
        .request_permissions(&search_request(), None)
        .await
        .unwrap();
    assert!(!repeated.granted);
    assert!(!repeated.prompted);
    assert_eq!(prompt.asked().len(), 1);

    let reloaded = Kernel::new(config, Arc::new(ScriptedPrompt::default()));
    assert_eq!(
        reloaded.permissions().grant_for(ORIGIN, Scope::CallTool, None),
        Grant::Denied
    );

    assert!(reloaded.permissions().revoke(ORIGIN).unwrap());
    assert_eq!(
        reloaded.permissions().grant_for(ORIGIN, Scope::CallTool, None),
        Grant::NotGranted
    );
}

#[tokio::test]
async fn once_grants_are_not_persisted() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    let prompt = Arc::new(ScriptedPrompt::answering([PromptOutcome::Granted {
        kind: GrantKind::Once,
        allowed_tools: Vec::new(),
    }]));
    let kernel = Kernel::new(config.clone(), prompt);
    let request = PromptRequest {
        origin: ORIGIN.to_string(),
        scopes: vec![Scope::PromptModel],
        reason: None,
        tools: Vec::new(),
    };

    let outcome = kernel.request_permissions(&request, None).await.unwrap();
    assert!(outcome.granted);
    assert_eq!(
        kernel.permissions().grant_for(ORIGIN, Scope::PromptModel, None),
        Grant::GrantedOnce
    );

    let reloaded = Kernel::new(config, Arc::new(ScriptedPrompt::default()));
    assert_eq!(
        reloaded.permissions().grant_for(ORIGIN, Scope::PromptModel, None),
        Grant::NotGranted
    );
}

#[tokio::test]
async fn dismissed_prompt_records_nothing() {
    let tmp = TempDir::new().unwrap();
    let prompt = Arc::new(ScriptedPrompt::default());
    let kernel = Kernel::new(config_in(tmp.path()), prompt.clone());

    let outcome = kernel
        .request_permissions(&search_request(), None)
        .await
        .unwrap();
    assert!(!outcome.granted);
    assert!(outcome.prompted);
    assert!(kernel.permissions().permissions_for(ORIGIN).is_none());

    kernel
        .request_permissions(&search_request(), None)
        .await
        .unwrap();
    assert_eq!(prompt.asked().len(), 2);
}
