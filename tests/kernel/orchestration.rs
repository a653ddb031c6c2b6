use super::{ScriptedPrompt, volatile_config};
use harbor_kernel::agents::AgentOptions;
use harbor_kernel::orchestration::{
    AssignmentStrategy, CombineStrategy, OutputTransform, ParallelJob, PipelineStep, Route,
    RouteCondition, RouterConfig, SupervisorConfig, SupervisorTask,
};
use harbor_kernel::permissions::{GrantKind, Scope};
use harbor_kernel::{ErrorCode, Kernel, KernelError};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

const APP: &str = "https://app.example";

struct Fixture {
    kernel: Kernel,
    lead: String,
}

impl Fixture {
    fn new() -> Self {
        let kernel = Kernel::new(volatile_config(), Arc::new(ScriptedPrompt::default()));
        kernel
            .permissions()
            .grant(APP, &[Scope::RegisterAgent], GrantKind::Always, None, &[])
            .unwrap();
        let lead = kernel
            .register_agent(APP, AgentOptions::new("lead"), None)
            .unwrap()
            .id;
        Self { kernel, lead }
    }

    /// Worker that replies `{"by": name, "task": task}`.
    fn echo_worker(&self, name: &'static str, capabilities: &[&str]) -> String {
        let id = self
            .kernel
            .register_agent(
                APP,
                AgentOptions::new(name).with_capabilities(capabilities.iter().copied()),
                None,
            )
            .unwrap()
            .id;
        self.kernel
            .messaging()
            .register_invocation_handler(&id, move |request, _| async move {
                Ok(json!({"by": name, "task": request.task}))
            })
            .unwrap();
        id
    }
}

#[tokio::test]
async fn pipeline_chains_real_agents() {
    let fx = Fixture::new();
    let upper = fx
        .kernel
        .register_agent(APP, AgentOptions::new("upper"), None)
        .unwrap()
        .id;
    fx.kernel
        .messaging()
        .register_invocation_handler(&upper, |request, _| async move {
            Ok(Value::String(request.task.to_uppercase()))
        })
        .unwrap();
    let echo = fx.echo_worker("echo", &[]);

    let orchestrator = fx.kernel.orchestrator(&fx.lead, APP).unwrap();
    let steps = vec![
        PipelineStep::new(upper.clone(), "{{ data.text }}"),
        PipelineStep::new(echo.clone(), "wrap {{ input }}")
            .with_transform(OutputTransform::Pick("task".into())),
    ];
    let result = orchestrator
        .pipeline(&steps, json!({"text": "hello"}), &CancellationToken::new())
        .await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.output.unwrap(), json!("wrap HELLO"));
    assert_eq!(result.steps.len(), 2);
    assert_eq!(
        fx.kernel.agents().usage(&fx.lead).unwrap().invocations_made,
        2
    );
}

#[tokio::test]
async fn only_the_owning_origin_may_orchestrate() {
    let fx = Fixture::new();
    let err = fx
        .kernel
        .orchestrator(&fx.lead, "https://intruder.example")
        .err()
        .unwrap();
    assert!(matches!(err, KernelError::PermissionDenied(_)));
}

#[tokio::test]
async fn parallel_fans_out_over_messaging() {
    let fx = Fixture::new();
    let a = fx.echo_worker("a", &[]);
    let b = fx.echo_worker("b", &[]);
    let orchestrator = fx.kernel.orchestrator(&fx.lead, APP).unwrap();

    let result = orchestrator
        .parallel(
            vec![
                ParallelJob::new(a, "first", Value::Null),
                ParallelJob::new(b, "second", Value::Null),
            ],
            CombineStrategy::Array,
            &CancellationToken::new(),
        )
        .await;
    assert!(result.success, "{result:?}");
    assert_eq!(
        result.output.unwrap(),
        json!([
            {"by": "a", "task": "first"},
            {"by": "b", "task": "second"},
        ])
    );
}

#[tokio::test]
async fn router_dispatches_to_the_matching_agent() {
    let fx = Fixture::new();
    let coder = fx.echo_worker("coder", &[]);
    let general = fx.echo_worker("general", &[]);
    let orchestrator = fx.kernel.orchestrator(&fx.lead, APP).unwrap();
    let config = RouterConfig {
        routes: vec![Route::new(
            RouteCondition::Equals {
                path: "kind".into(),
                value: json!("code"),
            },
            coder.clone(),
        )],
        default_agent_id: Some(general.clone()),
        task_template: Some("{{ data.body }}".into()),
    };

    let routed = orchestrator
        .route(
            &config,
            json!({"kind": "code", "body": "fix it"}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(routed.agent_id, coder);
    assert_eq!(routed.output, json!({"by": "coder", "task": "fix it"}));

    let fallback = orchestrator
        .route(
            &config,
            json!({"kind": "chat", "body": "hi"}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(fallback.agent_id, general);
    assert_eq!(fallback.matched_route, None);
}

#[tokio::test]
async fn supervisor_matches_capabilities_and_retries_on_another_worker() {
    let fx = Fixture::new();
    let flaky = fx
        .kernel
        .register_agent(
            APP,
            AgentOptions::new("flaky").with_capabilities(["translate"]),
            None,
        )
        .unwrap()
        .id;
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    fx.kernel
        .messaging()
        .register_invocation_handler(&flaky, move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("flaky worker gave up")
            }
        })
        .unwrap();
    let steady = fx.echo_worker("steady", &["translate"]);
    let painter = fx.echo_worker("painter", &["draw"]);

    let orchestrator = fx.kernel.orchestrator(&fx.lead, APP).unwrap();
    let mut config = SupervisorConfig {
        workers: vec![flaky.clone(), steady.clone(), painter.clone()],
        strategy: AssignmentStrategy::CapabilityMatch,
        ..SupervisorConfig::default()
    };
    config.retry.max_attempts = 2;
    config.retry.reassign_on_failure = true;

    let tasks = vec![
        SupervisorTask::new("t1", "translate this", Value::Null).requiring(["translate"]),
        SupervisorTask::new("t2", "draw that", Value::Null).requiring(["draw"]),
    ];
    let result = orchestrator
        .supervise(&config, tasks, &CancellationToken::new())
        .await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.stats.succeeded, 2);
    let translated = &result.results[0];
    assert_eq!(translated.worker.as_deref(), Some(steady.as_str()));
    assert_eq!(translated.attempts.len(), 2);
    assert_eq!(translated.attempts[0].worker, flaky);
    assert_eq!(
        translated.attempts[0].error.as_ref().unwrap().code,
        ErrorCode::InvocationFailed
    );
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(result.results[1].worker.as_deref(), Some(painter.as_str()));
}

#[tokio::test]
async fn cancelling_a_pipeline_stops_before_the_next_step() {
    let fx = Fixture::new();
    let slow = fx
        .kernel
        .register_agent(APP, AgentOptions::new("slow"), None)
        .unwrap()
        .id;
    fx.kernel
        .messaging()
        .register_invocation_handler(&slow, |_, _| async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(Value::Null)
        })
        .unwrap();
    let echo = fx.echo_worker("echo", &[]);

    let orchestrator = fx.kernel.orchestrator(&fx.lead, APP).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        trigger.cancel();
    });
    let steps = vec![
        PipelineStep::new(slow, "wait"),
        PipelineStep::new(echo.clone(), "never"),
    ];
    let result = orchestrator.pipeline(&steps, Value::Null, &cancel).await;

    assert!(result.cancelled);
    assert!(!result.success);
    assert!(result.steps.is_empty());
    assert_eq!(fx.kernel.agents().usage(&echo).unwrap().invocations_received, 0);
}
