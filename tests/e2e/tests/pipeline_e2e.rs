//! End-to-end pipeline scenarios: consume, service chain, produce

use flowbus_e2e_tests::{init_test_tracing, OutcomeCounter};
use flowbus_engine::test_utils::{CollectorProducer, RecordingHandler};
use flowbus_engine::{
    lifecycle, AddMetadataService, BranchingServiceCollection, CloneMessageServiceList,
    MessageFactory, ServiceList, StandardWorkflow, Workflow, WorkflowConfig, END_OF_CHAIN,
};
use std::collections::HashMap;
use std::sync::Arc;

fn started_workflow(
    services: ServiceList,
    producer: Arc<CollectorProducer>,
    handler: Arc<RecordingHandler>,
) -> StandardWorkflow {
    StandardWorkflow::new(
        WorkflowConfig::new("wf-e2e", "channel-e2e"),
        services,
        producer,
    )
    .with_error_handler(handler)
}

#[tokio::test]
async fn consumed_message_is_transformed_and_produced() -> anyhow::Result<()> {
    init_test_tracing();

    let producer = Arc::new(CollectorProducer::new());
    let handler = Arc::new(RecordingHandler::new());
    let services = ServiceList::new("services").add_service(Box::new(
        AddMetadataService::new("stamp").with_entry("processed", "true"),
    ));
    let mut workflow = started_workflow(services, producer.clone(), handler.clone());
    lifecycle::request_start(&mut workflow).await?;

    let factory = MessageFactory::new();
    let mut metadata = HashMap::new();
    metadata.insert("k".to_string(), "v".to_string());
    let message = factory.new_message_with_metadata(b"hello".to_vec(), metadata);

    let outcome = OutcomeCounter::new();
    workflow.process_message(message, outcome.callbacks()).await;

    assert_eq!(outcome.successes(), 1);
    assert_eq!(outcome.failures(), 0);
    assert!(handler.handled_ids().is_empty());

    let produced = producer.produced();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].payload(), b"hello");
    assert_eq!(produced[0].metadata_value("k"), Some("v"));
    assert_eq!(produced[0].metadata_value("processed"), Some("true"));

    // The trail shows receipt, the service, and the produce step, in order.
    let trail = produced[0].trail();
    assert!(trail.len() >= 2);
    assert!(trail.iter().all(|m| m.success));
    assert_eq!(trail[0].component_name, "wf-e2e");

    lifecycle::request_close(&mut workflow).await;
    Ok(())
}

#[tokio::test]
async fn branching_chain_follows_dynamic_routing() -> anyhow::Result<()> {
    init_test_tracing();

    // "classify" routes straight to "audit", skipping nothing by id order
    // but terminating via the end-of-chain sentinel afterwards.
    let branching = BranchingServiceCollection::new("branch", "classify")
        .add_service(Box::new(
            AddMetadataService::new("classify")
                .with_entry("category", "bulk")
                .with_next_service("audit"),
        ))
        .add_service(Box::new(
            AddMetadataService::new("reject").with_entry("category", "rejected"),
        ))
        .add_service(Box::new(
            AddMetadataService::new("audit")
                .with_entry("audited", "yes")
                .with_next_service(END_OF_CHAIN),
        ));

    let producer = Arc::new(CollectorProducer::new());
    let handler = Arc::new(RecordingHandler::new());
    let services = ServiceList::new("root").add_service(Box::new(branching));
    let mut workflow = started_workflow(services, producer.clone(), handler.clone());
    lifecycle::request_start(&mut workflow).await?;

    let factory = MessageFactory::new();
    workflow.deliver(factory.new_message(b"order".to_vec())).await;

    let produced = producer.produced();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].metadata_value("category"), Some("bulk"));
    assert_eq!(produced[0].metadata_value("audited"), Some("yes"));
    assert!(handler.handled_ids().is_empty());
    Ok(())
}

#[tokio::test]
async fn clone_fanout_copies_back_only_configured_keys() -> anyhow::Result<()> {
    init_test_tracing();

    let fanout = CloneMessageServiceList::new("fanout")
        .with_copy_metadata_key("verdict")
        .add_service(Box::new(
            AddMetadataService::new("scorer")
                .with_entry("verdict", "pass")
                .with_entry("scratch", "internal"),
        ));

    let producer = Arc::new(CollectorProducer::new());
    let handler = Arc::new(RecordingHandler::new());
    let services = ServiceList::new("root").add_service(Box::new(fanout));
    let mut workflow = started_workflow(services, producer.clone(), handler.clone());
    lifecycle::request_start(&mut workflow).await?;

    let factory = MessageFactory::new();
    workflow.deliver(factory.new_message(Vec::new())).await;

    let produced = producer.produced();
    assert_eq!(produced.len(), 1);
    // Only the configured key survived the clone boundary.
    assert_eq!(produced[0].metadata_value("verdict"), Some("pass"));
    assert_eq!(produced[0].metadata_value("scratch"), None);
    Ok(())
}

#[tokio::test]
async fn produce_failure_reaches_error_handler_not_success_callback() -> anyhow::Result<()> {
    init_test_tracing();

    let producer = Arc::new(CollectorProducer::new());
    producer.fail_next();
    let handler = Arc::new(RecordingHandler::new());
    let services = ServiceList::new("services").add_service(Box::new(
        AddMetadataService::new("stamp").with_entry("processed", "true"),
    ));
    let mut workflow = started_workflow(services, producer.clone(), handler.clone());
    lifecycle::request_start(&mut workflow).await?;

    let factory = MessageFactory::new();
    let outcome = OutcomeCounter::new();
    workflow
        .process_message(factory.new_message(b"doomed".to_vec()), outcome.callbacks())
        .await;

    assert_eq!(outcome.successes(), 0);
    assert_eq!(handler.handled_ids().len(), 1);
    assert!(handler.handled_errors()[0].contains("injected produce failure"));
    Ok(())
}
