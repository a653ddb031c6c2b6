use super::{ScriptedPrompt, volatile_config};
use harbor_kernel::agents::{AgentOptions, AgentQuery, InvocationRequest};
use harbor_kernel::permissions::{GrantKind, Scope};
use harbor_kernel::{ErrorCode, Kernel, KernelError};
use serde_json::{Value, json};
use std::sync::Arc;

const APP: &str = "https://app.example";
const PARTNER: &str = "https://partner.example";

fn kernel() -> Kernel {
    Kernel::new(volatile_config(), Arc::new(ScriptedPrompt::default()))
}

fn grant(kernel: &Kernel, origin: &str, scopes: &[Scope], tools: &[&str]) {
    let tools: Vec<String> = tools.iter().map(ToString::to_string).collect();
    kernel
        .permissions()
        .grant(origin, scopes, GrantKind::Always, None, &tools)
        .unwrap();
}

/// Registers a worker that reports what its invocation context allows.
fn register_reporting_worker(kernel: &Kernel, origin: &str, name: &str) -> String {
    let worker = kernel
        .register_agent(origin, AgentOptions::new(name), None)
        .unwrap();
    kernel
        .messaging()
        .register_invocation_handler(&worker.id, |request, context| async move {
            Ok(json!({
                "task": request.task,
                "crossOrigin": context.is_cross_origin(),
                "canSearch": context.check_tool_access("search"),
                "canFetch": context.check_permission(Scope::WebFetch),
            }))
        })
        .unwrap();
    worker.id
}

#[tokio::test]
async fn registration_requires_the_register_agent_scope() {
    let kernel = kernel();
    let err = kernel
        .register_agent(APP, AgentOptions::new("planner"), None)
        .unwrap_err();
    assert!(matches!(err, KernelError::PermissionDenied(_)));

    grant(&kernel, APP, &[Scope::RegisterAgent], &[]);
    let agent = kernel
        .register_agent(APP, AgentOptions::new("planner"), None)
        .unwrap();
    assert_eq!(agent.origin, APP);
    assert_eq!(kernel.agents().len(), 1);
}

#[tokio::test]
async fn same_origin_invocation_sees_shared_grants() {
    let kernel = kernel();
    grant(
        &kernel,
        APP,
        &[Scope::RegisterAgent, Scope::CallTool, Scope::WebFetch],
        &["search"],
    );
    let planner = kernel
        .register_agent(APP, AgentOptions::new("planner"), None)
        .unwrap();
    let worker = register_reporting_worker(&kernel, APP, "worker");

    let response = kernel
        .messaging()
        .invoke(
            &worker,
            InvocationRequest::new("summarize", Value::Null),
            &planner.id,
            APP,
            None,
        )
        .await;
    assert!(response.success, "{response:?}");
    assert_eq!(
        response.result.unwrap(),
        json!({"task": "summarize", "crossOrigin": false, "canSearch": true, "canFetch": true})
    );
    assert_eq!(kernel.agents().usage(&planner.id).unwrap().invocations_made, 1);
}

#[tokio::test]
async fn cross_origin_invocation_needs_the_scope_and_intersects_grants() {
    let kernel = kernel();
    grant(
        &kernel,
        APP,
        &[Scope::RegisterAgent, Scope::CallTool, Scope::WebFetch],
        &["search"],
    );
    grant(&kernel, PARTNER, &[Scope::RegisterAgent, Scope::CallTool], &["search"]);
    let planner = kernel
        .register_agent(APP, AgentOptions::new("planner"), None)
        .unwrap();
    let worker = register_reporting_worker(&kernel, PARTNER, "partner-worker");

    let denied = kernel
        .messaging()
        .invoke(
            &worker,
            InvocationRequest::new("t", Value::Null),
            &planner.id,
            APP,
            None,
        )
        .await;
    assert!(!denied.success);
    assert_eq!(denied.error.unwrap().code, ErrorCode::PermissionDenied);

    grant(&kernel, APP, &[Scope::CrossOriginMessaging], &[]);
    let allowed = kernel
        .messaging()
        .invoke(
            &worker,
            InvocationRequest::new("t", Value::Null),
            &planner.id,
            APP,
            None,
        )
        .await;
    assert!(allowed.success, "{allowed:?}");
    let report = allowed.result.unwrap();
    assert_eq!(report["crossOrigin"], json!(true));
    assert_eq!(report["canSearch"], json!(true));
    // The partner never held web-fetch, so the pair does not either.
    assert_eq!(report["canFetch"], json!(false));
}

#[tokio::test]
async fn invoker_cannot_delegate_scopes_it_lacks() {
    let kernel = kernel();
    grant(&kernel, APP, &[Scope::RegisterAgent], &[]);
    let planner = kernel
        .register_agent(APP, AgentOptions::new("planner"), None)
        .unwrap();
    let worker = register_reporting_worker(&kernel, APP, "worker");

    let mut request = InvocationRequest::new("fetch it", Value::Null);
    request.required_scopes = vec![Scope::WebFetch];
    let response = kernel
        .messaging()
        .invoke(&worker, request, &planner.id, APP, None)
        .await;
    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, ErrorCode::PermissionDenied);
}

#[tokio::test]
async fn discovery_respects_origin_boundaries() {
    let kernel = kernel();
    grant(&kernel, APP, &[Scope::RegisterAgent, Scope::DiscoverAgents], &[]);
    grant(&kernel, PARTNER, &[Scope::RegisterAgent], &[]);
    kernel
        .register_agent(
            APP,
            AgentOptions::new("Planner").with_capabilities(["plan"]),
            None,
        )
        .unwrap();
    kernel
        .register_agent(
            PARTNER,
            AgentOptions::new("Translator").with_capabilities(["translate"]),
            None,
        )
        .unwrap();

    let err = kernel
        .discover_agents(PARTNER, &AgentQuery::default(), None)
        .unwrap_err();
    assert!(matches!(err, KernelError::PermissionDenied(_)));

    let cross = AgentQuery {
        include_cross_origin: true,
        ..AgentQuery::default()
    };
    let visible = kernel.discover_agents(APP, &cross, None).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].name, "Planner");

    grant(&kernel, APP, &[Scope::CrossOriginMessaging], &[]);
    let visible = kernel.discover_agents(APP, &cross, None).unwrap();
    assert_eq!(visible.len(), 2);
    assert!(visible.iter().any(|agent| !agent.same_origin));

    let by_capability = AgentQuery {
        capabilities: vec!["translate".to_string()],
        ..cross
    };
    let found = kernel.discover_agents(APP, &by_capability, None).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].origin, PARTNER);
}

#[tokio::test]
async fn unregistering_drops_handlers() {
    let kernel = kernel();
    grant(&kernel, APP, &[Scope::RegisterAgent], &[]);
    let planner = kernel
        .register_agent(APP, AgentOptions::new("planner"), None)
        .unwrap();
    let worker = register_reporting_worker(&kernel, APP, "worker");

    let err = kernel.unregister_agent(&worker, PARTNER).unwrap_err();
    assert!(matches!(err, KernelError::PermissionDenied(_)));

    kernel.unregister_agent(&worker, APP).unwrap();
    let response = kernel
        .messaging()
        .invoke(
            &worker,
            InvocationRequest::new("t", Value::Null),
            &planner.id,
            APP,
            None,
        )
        .await;
    assert_eq!(response.error.unwrap().code, ErrorCode::AgentNotFound);
}
