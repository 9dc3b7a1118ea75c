//! End-to-end stage behaviour: configuration through factory to collaborator

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use transform_stage::test_utils::{FailingCollaborator, RecordingCollaborator, SlowCollaborator};
use transform_stage::{
    CollaboratorError, CompletionSignal, ConnectionOwnership, ConnectionPool, Expression, Payload,
    Record, Stage, StageError, StageFactory, StagesConfig, TargetKind, TargetSpec, WriteStage,
};

fn shared_pool() -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new("scenario", 8))
}

fn build(toml: &str, name: &str, collaborator: Arc<RecordingCollaborator>) -> Arc<dyn Stage> {
    let config = StagesConfig::from_toml(toml).unwrap();
    StageFactory::new(collaborator, shared_pool())
        .build_named(&config, name)
        .unwrap()
}

#[test]
fn both_or_neither_target_options_fail_construction() {
    let both = r#"
        [stages.s]
        type = "mongodb"
        collection = "T"
        collection_expression = "headers['dest']"
    "#;
    let neither = r#"
        [stages.s]
        type = "mongodb"
    "#;

    let factory = StageFactory::new(Arc::new(RecordingCollaborator::new()), shared_pool());
    for toml in [both, neither] {
        let config = StagesConfig::from_toml(toml).unwrap();
        let err = assert_err!(factory.build_named(&config, "s"));
        assert!(err.is_configuration());
    }
}

#[tokio::test]
async fn literal_target_receives_payload() {
    let collaborator = Arc::new(RecordingCollaborator::new());
    let stage = build(
        r#"
        [stages.s]
        type = "redis"
        queue = "T"
        "#,
        "s",
        collaborator.clone(),
    );

    let signal = stage.process(Record::new("hello")).await;
    assert_eq!(signal, CompletionSignal::Accepted);

    let writes = collaborator.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].payload, Payload::from("hello"));
    assert_eq!(writes[0].target, "T");
    assert_eq!(writes[0].kind, TargetKind::Queue);
}

#[tokio::test]
async fn expression_target_reads_header() {
    let collaborator = Arc::new(RecordingCollaborator::new());
    let stage = build(
        r#"
        [stages.s]
        type = "store"
        table_expression = "headers['dest']"
        "#,
        "s",
        collaborator.clone(),
    );

    let record = Record::builder(json!({"id": 1})).header("dest", "Q2").build();
    assert!(stage.process(record).await.is_accepted());

    let writes = collaborator.writes();
    assert_eq!(writes[0].target, "Q2");
    assert_eq!(writes[0].payload, Payload::Structured(json!({"id": 1})));
}

#[test]
fn target_resolution_is_repeatable() {
    let spec = TargetSpec::Expression(Expression::parse("'orders-' + headers['region']").unwrap());
    let record = Record::builder("x").header("region", "eu").build();
    let first = assert_ok!(spec.resolve(&record));
    let second = assert_ok!(spec.resolve(&record));
    assert_eq!(first, "orders-eu");
    assert_eq!(first, second);
}

#[tokio::test]
async fn connectivity_failure_is_rejected_and_contained() {
    let stage = WriteStage::builder("s", TargetKind::Topic, TargetSpec::literal("T")).build(
        Arc::new(FailingCollaborator::new(CollaboratorError::connection_failed(
            "connection refused",
        ))),
        ConnectionOwnership::Owned { max_connections: 1 },
    );

    // The stage keeps working for later records
    for _ in 0..3 {
        match stage.process(Record::new("x")).await {
            CompletionSignal::Rejected(StageError::Collaborator(err)) => {
                assert!(err.is_connection_error())
            }
            other => panic!("expected collaborator rejection, got {:?}", other),
        }
    }
    assert_eq!(stage.metadata().records_rejected, 3);
    assert_eq!(stage.pool().active_leases(), 0);
}

#[tokio::test]
async fn every_record_yields_a_signal() {
    let collaborator = Arc::new(RecordingCollaborator::new());
    let stage = build(
        r#"
        [stages.s]
        type = "rabbit"
        routing_key_expression = "payload.region.toLowerCase()"
        "#,
        "s",
        collaborator.clone(),
    );

    let records = vec![
        Record::new(json!({"region": "EU"})),
        Record::new(json!({"other": 1})),
        Record::new(json!("plain string")),
        Record::new(b"\xff\xfe".to_vec()),
        Record::new(serde_json::Value::Null),
    ];

    let mut accepted = 0;
    for record in records {
        match stage.process(record).await {
            CompletionSignal::Accepted | CompletionSignal::AcceptedWith(_) => accepted += 1,
            CompletionSignal::Rejected(err) => assert!(err.is_evaluation(), "{}", err),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(collaborator.writes()[0].route.as_deref(), Some("eu"));
}

#[tokio::test]
async fn text_payloads_are_decoded_before_writing() {
    let collaborator = Arc::new(RecordingCollaborator::new());
    let stage = build(
        r#"
        [stages.s]
        type = "redis"
        key = "k"
        "#,
        "s",
        collaborator.clone(),
    );

    stage
        .process(Record::builder(b"hi".to_vec()).content_type("text/plain").build())
        .await;
    stage
        .process(
            Record::builder(vec![0u8, 1])
                .content_type("application/octet-stream")
                .build(),
        )
        .await;

    let writes = collaborator.writes();
    assert_eq!(writes[0].payload, Payload::Text("hi".to_string()));
    assert!(writes[1].payload.is_bytes());
}

#[tokio::test]
async fn decoding_can_be_disabled() {
    let collaborator = Arc::new(RecordingCollaborator::new());
    let stage = build(
        r#"
        [stages.s]
        type = "redis"
        key = "k"
        decode_text = false
        "#,
        "s",
        collaborator.clone(),
    );

    stage.process(Record::new(b"{}".to_vec())).await;
    assert!(collaborator.writes()[0].payload.is_bytes());
}

#[tokio::test]
async fn owned_pool_bounds_in_flight_writes() {
    let collaborator = Arc::new(SlowCollaborator::new(Duration::from_millis(15)));
    let config = StagesConfig::from_toml(
        r#"
        [stages.s]
        type = "redis"
        topic = "t"
        ownership = "owned"
        max_in_flight = 3
        "#,
    )
    .unwrap();
    let stage = StageFactory::new(collaborator.clone(), shared_pool())
        .build_named(&config, "s")
        .unwrap();

    let signals = futures_util::future::join_all((0..9).map(|i| {
        let stage = stage.clone();
        async move { stage.process(Record::new(format!("{}", i))).await }
    }))
    .await;

    assert!(signals.iter().all(CompletionSignal::is_accepted));
    assert_eq!(collaborator.write_count(), 9);
    assert!(collaborator.max_concurrent() <= 3);
}

#[tokio::test]
async fn task_launch_request_from_record() {
    let stage = build(
        r#"
        [stages.launch]
        type = "task_launch"
        task_name_expression = "headers['task']"
        args = ["--mode=batch"]
        arg_expressions = "file=payload.trim()"
        deployment_properties = "deployer.memory=1g"
        "#,
        "launch",
        Arc::new(RecordingCollaborator::new()),
    );

    let record = Record::builder(" input.csv ").header("task", "ingest").build();
    let out = stage.process(record).await.into_result().unwrap().unwrap();
    assert_eq!(
        out.payload().to_value(),
        json!({
            "name": "ingest",
            "args": ["--mode=batch", "file=input.csv"],
            "deploymentProps": {"deployer.memory": "1g"},
        })
    );
}
