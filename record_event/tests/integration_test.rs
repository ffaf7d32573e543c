use lambda_runtime::LambdaEvent;
use serde_json::{json, Value};
use std::env;

#[test]
fn test_persistence_failure_returns_500() {
    // Static dummy credentials keep the SDK from probing the instance
    // metadata service; the closed port makes the put fail immediately.
    env::set_var("AWS_ACCESS_KEY_ID", "test");
    env::set_var("AWS_SECRET_ACCESS_KEY", "test");
    env::set_var("AWS_REGION", "us-east-1");
    env::set_var("DYNAMODB_ENDPOINT", "http://127.0.0.1:9");
    env::set_var("TABLE_NAME", "EventMonitoringTable");

    let future = record_event::function_handler(LambdaEvent {
        payload: json!({
            "source": "aws.s3",
            "detail": {
                "requestParameters": {"bucketName": "my-bucket"},
                "userIdentity": {"userName": "bob"}
            }
        }),
        context: Default::default(),
    });
    let response = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
        .unwrap();

    assert_eq!(response.status_code, 500);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["error"], "Failed to process event");
    assert!(body["details"].is_string());
}
