//! End-to-end scenarios for bounded concurrency and retry

use flowbus_e2e_tests::{init_test_tracing, OutcomeCounter};
use flowbus_engine::test_utils::{
    CollectorProducer, FailingService, FlakyService, RecordingHandler, SlowService,
};
use flowbus_engine::{
    lifecycle, AddMetadataService, EngineConfig, FailureDigest, MessageFactory, PoolConfig,
    PoolingWorkflow, RetryErrorHandler, ServiceList, StandardWorkflow, Workflow, WorkflowConfig,
    WorkflowRegistry,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn pooled_workflow_caps_concurrency_at_pool_size() -> anyhow::Result<()> {
    init_test_tracing();

    let slow = SlowService::new("slow", Duration::from_millis(40));
    let peak = slow.peak_handle();
    let services = ServiceList::new("services").add_service(Box::new(slow));
    let producer = Arc::new(CollectorProducer::new());
    let pool = PoolConfig {
        pool_size: 3,
        min_idle: 1,
        max_idle: 3,
        ..PoolConfig::default()
    };
    let mut workflow = PoolingWorkflow::new(
        WorkflowConfig::new("wf-pooled", "channel-1"),
        pool,
        services,
        producer.clone(),
    );
    lifecycle::request_start(&mut workflow).await?;

    let factory = MessageFactory::new();
    for _ in 0..8 {
        workflow.deliver(factory.new_message(Vec::new())).await;
    }
    lifecycle::request_stop(&mut workflow).await;

    assert_eq!(producer.count(), 8);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    Ok(())
}

#[tokio::test]
async fn pooled_shutdown_loses_no_message() -> anyhow::Result<()> {
    init_test_tracing();

    let services = ServiceList::new("services")
        .add_service(Box::new(SlowService::new("slow", Duration::from_millis(400))));
    let producer = Arc::new(CollectorProducer::new());
    let handler = Arc::new(RecordingHandler::new());
    let pool = PoolConfig {
        pool_size: 4,
        min_idle: 1,
        max_idle: 4,
        shutdown_wait: Duration::from_millis(50),
        ..PoolConfig::default()
    };
    let mut workflow = PoolingWorkflow::new(
        WorkflowConfig::new("wf-pooled", "channel-1"),
        pool,
        services,
        producer.clone(),
    )
    .with_error_handler(handler.clone());
    lifecycle::request_start(&mut workflow).await?;

    let factory = MessageFactory::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let message = factory.new_message(Vec::new());
        ids.push(message.id().to_string());
        workflow.deliver(message).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    lifecycle::request_stop(&mut workflow).await;

    // Every message reached exactly one outcome: produced or handled.
    let produced: Vec<String> = producer
        .produced()
        .iter()
        .map(|m| m.id().to_string())
        .collect();
    let handled = handler.handled_ids();
    for id in &ids {
        let was_produced = produced.contains(id);
        let was_handled = handled.contains(id);
        assert!(
            was_produced ^ was_handled,
            "message {id} produced={was_produced} handled={was_handled}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn retries_recover_a_transient_failure() -> anyhow::Result<()> {
    init_test_tracing();

    let registry = WorkflowRegistry::new();
    let digest = Arc::new(FailureDigest::default());
    let retry = Arc::new(RetryErrorHandler::new(
        "retry",
        flowbus_engine::RetryConfig {
            retry_limit: Some(5),
            retry_interval: Duration::from_millis(25),
        },
        registry.clone(),
        digest.clone(),
    ));

    // Fails twice, then succeeds on the third attempt.
    let services = ServiceList::new("services")
        .add_service(Box::new(FlakyService::new("flaky", 2)))
        .add_service(Box::new(
            AddMetadataService::new("stamp").with_entry("processed", "true"),
        ));
    let producer = Arc::new(CollectorProducer::new());
    let workflow = StandardWorkflow::new(
        WorkflowConfig::new("wf-flaky", "channel-1"),
        services,
        producer.clone(),
    )
    .with_error_handler(retry.clone());
    let shared = registry.register(Box::new(workflow));
    {
        let mut guard = shared.lock().await;
        lifecycle::request_start(&mut **guard).await?;
    }

    let factory = MessageFactory::new();
    let outcome = OutcomeCounter::new();
    shared
        .lock()
        .await
        .process_message(factory.new_message(b"persistent".to_vec()), outcome.callbacks())
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(outcome.successes(), 1);
    assert_eq!(outcome.failures(), 0);
    assert_eq!(producer.count(), 1);
    assert_eq!(producer.produced()[0].metadata_value("processed"), Some("true"));
    assert_eq!(retry.pending_count(), 0);
    assert!(digest.is_empty());
    Ok(())
}

#[tokio::test]
async fn retry_limit_ends_in_exactly_one_terminal_failure() -> anyhow::Result<()> {
    init_test_tracing();

    let registry = WorkflowRegistry::new();
    let digest = Arc::new(FailureDigest::default());
    let retry = Arc::new(RetryErrorHandler::new(
        "retry",
        flowbus_engine::RetryConfig {
            retry_limit: Some(2),
            retry_interval: Duration::from_millis(25),
        },
        registry.clone(),
        digest.clone(),
    ));

    let services =
        ServiceList::new("services").add_service(Box::new(FailingService::new("always-fails")));
    let workflow = StandardWorkflow::new(
        WorkflowConfig::new("wf-doomed", "channel-1"),
        services,
        Arc::new(CollectorProducer::new()),
    )
    .with_error_handler(retry.clone());
    let shared = registry.register(Box::new(workflow));
    {
        let mut guard = shared.lock().await;
        lifecycle::request_start(&mut **guard).await?;
    }

    let factory = MessageFactory::new();
    let message = factory.new_message(Vec::new());
    let message_id = message.id().to_string();
    let outcome = OutcomeCounter::new();
    shared
        .lock()
        .await
        .process_message(message, outcome.callbacks())
        .await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    // Initial attempt plus two retries, then one terminal verdict.
    assert_eq!(outcome.successes(), 0);
    assert_eq!(outcome.failures(), 1);
    assert_eq!(retry.pending_count(), 0);
    assert!(digest.contains_message(&message_id));
    assert_eq!(digest.len(), 1);
    Ok(())
}

#[tokio::test]
async fn config_file_wires_a_pooled_workflow_with_retry() -> anyhow::Result<()> {
    init_test_tracing();

    let config = EngineConfig::from_toml(
        r#"
        [workflow]
        id = "wf-config"
        channel_id = "channel-config"

        [pool]
        pool_size = 2
        min_idle = 1
        max_idle = 2
        shutdown_wait_ms = 2000

        [retry]
        retry_limit = 1
        retry_interval_ms = 25
        "#,
    )?;

    let registry = WorkflowRegistry::new();
    let digest = Arc::new(FailureDigest::default());
    let retry = Arc::new(RetryErrorHandler::new(
        "retry",
        config.retry_config(),
        registry.clone(),
        digest.clone(),
    ));

    let services = ServiceList::new("services").add_service(Box::new(
        AddMetadataService::new("stamp").with_entry("processed", "true"),
    ));
    let producer = Arc::new(CollectorProducer::new());
    let workflow = PoolingWorkflow::new(
        config.workflow_config(),
        config.pool_config(),
        services,
        producer.clone(),
    )
    .with_error_handler(retry);
    let shared = registry.register(Box::new(workflow));
    {
        let mut guard = shared.lock().await;
        lifecycle::request_start(&mut **guard).await?;
    }

    let factory = MessageFactory::new();
    {
        let mut guard = shared.lock().await;
        guard.deliver(factory.new_message(b"configured".to_vec())).await;
        lifecycle::request_stop(&mut **guard).await;
    }

    assert_eq!(producer.count(), 1);
    assert_eq!(producer.produced()[0].metadata_value("processed"), Some("true"));
    assert!(digest.is_empty());
    Ok(())
}
