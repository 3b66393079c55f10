//! Tool capability surface tests: dispositions, context, registry

use emissary::{FnTool, Tool, ToolContext, ToolError, ToolRegistry};

use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn test_context() -> ToolContext {
    // Lazy pools never connect unless a query runs.
    let pool = PgPoolOptions::new()
        .connect_lazy("postgresql://localhost/test")
        .unwrap();
    ToolContext {
        run_id: Uuid::new_v4(),
        session_id: Uuid::new_v4(),
        variables: json!({"tenant": "acme", "retries": 2}),
        db: pool,
    }
}

#[tokio::test]
async fn tool_receives_variables() {
    let tool = FnTool::new(
        "whoami",
        "Report the tenant",
        json!({"type": "object", "properties": {}}),
        |ctx: ToolContext, _input| async move {
            ctx.var("tenant")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| ToolError::failed("no tenant"))
        },
    );

    let output = tool.execute(&test_context(), json!({})).await.unwrap();
    assert_eq!(output, "acme");
}

#[tokio::test]
async fn flaky_tool_models_retry_then_success() {
    // The S3 shape: fail on attempt 1, succeed on attempt 2.
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_tool = attempts.clone();

    let tool = FnTool::new(
        "flaky",
        "Fails once",
        json!({"type": "object", "properties": {}}),
        move |_ctx, _input| {
            let attempts = attempts_in_tool.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ToolError::failed("transient"))
                } else {
                    Ok("recovered".to_string())
                }
            }
        },
    );

    let ctx = test_context();
    let first = tool.execute(&ctx, json!({})).await;
    assert!(matches!(first, Err(ToolError::Failed(_))));
    assert!(!first.unwrap_err().is_permanent());

    let second = tool.execute(&ctx, json!({})).await.unwrap();
    assert_eq!(second, "recovered");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn snooze_is_not_permanent() {
    let tool = FnTool::new(
        "ratelimited",
        "Asks to be called later",
        json!({"type": "object", "properties": {}}),
        |_ctx, _input| async move {
            Err::<String, _>(ToolError::Snooze(Duration::from_secs(1)))
        },
    );

    let error = tool.execute(&test_context(), json!({})).await.unwrap_err();
    match error {
        ToolError::Snooze(duration) => assert_eq!(duration, Duration::from_secs(1)),
        other => panic!("unexpected disposition: {:?}", other),
    }
    assert!(!ToolError::Snooze(Duration::from_secs(1)).is_permanent());
}

#[tokio::test]
async fn cancel_and_discard_are_permanent() {
    assert!(ToolError::Cancel("stop".into()).is_permanent());
    assert!(ToolError::Discard("drop".into()).is_permanent());
}

#[test]
fn registry_gates_capabilities() {
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(FnTool::new(
            "echo",
            "Echo",
            json!({"type": "object", "properties": {}}),
            |_ctx, input| async move { Ok(input.to_string()) },
        )))
        .unwrap();

    assert!(registry.contains("echo"));
    assert!(!registry.contains("rm_rf"));
    assert_eq!(registry.names(), vec!["echo".to_string()]);

    // The delegate namespace is engine-owned.
    let hijack = Arc::new(FnTool::new(
        "agent__echo",
        "",
        json!({"type": "object"}),
        |_ctx, _input| async move { Ok(String::new()) },
    ));
    assert!(registry.register(hijack).is_err());
}
