use aws_config::meta::region::RegionProviderChain;
use aws_sdk_dynamodb as ddb;
use aws_sdk_dynamodb::model::AttributeValue;
use lambda_runtime::{Error, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::time::SystemTime;
use tracing::{error, info};

const TABLE_NAME: &str = "TABLE_NAME";
const DYNAMODB_ENDPOINT: &str = "DYNAMODB_ENDPOINT";
const DEFAULT_TABLE_NAME: &str = "EventMonitoringTable";

const UNKNOWN: &str = "unknown";
const SYSTEM: &str = "system";

/// One monitoring item, stored as-is in DynamoDB. All fields are strings
/// so the table schema never sees a null attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    #[serde(rename = "EventId")]
    pub event_id: String,
    #[serde(rename = "EventTime")]
    pub event_time: String,
    #[serde(rename = "EventSource")]
    pub event_source: String,
    #[serde(rename = "EventName")]
    pub event_name: String,
    #[serde(rename = "ResourceName")]
    pub resource_name: String,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "RawEvent")]
    pub raw_event: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandlerResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SuccessBody {
    message: String,
    #[serde(rename = "eventId")]
    event_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    details: String,
}

impl HandlerResponse {
    fn stored(event_id: &str) -> Result<Self, Error> {
        Ok(HandlerResponse {
            status_code: 200,
            body: serde_json::to_string(&SuccessBody {
                message: String::from("Event processed successfully"),
                event_id: event_id.to_string(),
            })?,
        })
    }

    fn failed(details: &str) -> Result<Self, Error> {
        Ok(HandlerResponse {
            status_code: 500,
            body: serde_json::to_string(&ErrorBody {
                error: String::from("Failed to process event"),
                details: details.to_string(),
            })?,
        })
    }
}

fn string_field(event: &Value, key: &str) -> String {
    match event.get(key).and_then(Value::as_str) {
        Some(s) => s.to_string(),
        None => String::from(UNKNOWN),
    }
}

/// Pick a username out of a `userIdentity` object, most specific field
/// first. An absent or empty identity means the event was not initiated
/// by a principal at all (e.g. an EC2 state change), which is reported
/// as "system" rather than "unknown".
pub fn extract_username(identity: Option<&Value>) -> String {
    let identity = match identity.and_then(Value::as_object) {
        Some(map) if !map.is_empty() => map,
        _ => return String::from(SYSTEM),
    };
    if let Some(name) = identity.get("userName").and_then(Value::as_str) {
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if let Some(arn) = identity.get("arn").and_then(Value::as_str) {
        if let Some(last) = arn.rsplit('/').next() {
            if !last.is_empty() {
                return last.to_string();
            }
        }
    }
    if let Some(principal) = identity.get("principalId").and_then(Value::as_str) {
        if let Some(last) = principal.rsplit(':').next() {
            if !last.is_empty() {
                return last.to_string();
            }
        }
    }
    match identity.get("type").and_then(Value::as_str) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => String::from(UNKNOWN),
    }
}

pub fn synthesize_event_id(source: &str) -> String {
    let secs = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    };
    format!("{}-{}-{}", source, secs, uuid::Uuid::new_v4())
}

/// Flatten a raw CloudWatch envelope into an [`EventRecord`]. Lookups
/// never fail: missing or malformed substructure degrades to the
/// "unknown" default instead of erroring.
pub fn normalize(event: &Value) -> EventRecord {
    let source = string_field(event, "source");
    let detail = event.get("detail");

    let mut resource_name = String::from(UNKNOWN);
    let mut username = String::from(UNKNOWN);

    match source.as_str() {
        "aws.s3" => {
            if let Some(bucket) = detail
                .and_then(|d| d.get("requestParameters"))
                .and_then(|p| p.get("bucketName"))
                .and_then(Value::as_str)
            {
                if !bucket.is_empty() {
                    resource_name = bucket.to_string();
                }
            }
            username = extract_username(detail.and_then(|d| d.get("userIdentity")));
        }
        "aws.ec2" => {
            if let Some(id) = detail
                .and_then(|d| d.get("instance-id"))
                .and_then(Value::as_str)
            {
                resource_name = id.to_string();
            }
            username = extract_username(detail.and_then(|d| d.get("userIdentity")));
        }
        // No extraction rule for other sources.
        _ => {}
    }

    EventRecord {
        event_id: synthesize_event_id(&source),
        event_time: string_field(event, "time"),
        event_source: source,
        event_name: string_field(event, "detail-type"),
        resource_name,
        region: string_field(event, "region"),
        username,
        raw_event: event.to_string(),
    }
}

async fn store_record(ddb_client: &ddb::Client, table_name: String, record: &EventRecord) -> Result<(), Error> {
    ddb_client.put_item()
        .table_name(table_name)
        .item("EventId", AttributeValue::S(record.event_id.clone()))
        .item("EventTime", AttributeValue::S(record.event_time.clone()))
        .item("EventSource", AttributeValue::S(record.event_source.clone()))
        .item("EventName", AttributeValue::S(record.event_name.clone()))
        .item("ResourceName", AttributeValue::S(record.resource_name.clone()))
        .item("Region", AttributeValue::S(record.region.clone()))
        .item("Username", AttributeValue::S(record.username.clone()))
        .item("RawEvent", AttributeValue::S(record.raw_event.clone()))
        .send()
        .await?;
    Ok(())
}

pub async fn process_event(event: &Value) -> Result<EventRecord, Error> {
    let record = normalize(event);
    let table_name = env::var(TABLE_NAME).unwrap_or_else(|_| String::from(DEFAULT_TABLE_NAME));

    let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
    let config = aws_config::from_env().region(region_provider).load().await;
    let ddb_config = match env::var(DYNAMODB_ENDPOINT) {
        Ok(endpoint) => ddb::config::Builder::from(&config).endpoint_url(endpoint).build(),
        _ => ddb::config::Builder::from(&config).build()
    };
    let ddb_client = ddb::Client::from_conf(ddb_config);

    store_record(&ddb_client, table_name, &record).await?;
    info!("stored event {}", record.event_id);
    Ok(record)
}

pub async fn function_handler(event: LambdaEvent<Value>) -> Result<HandlerResponse, Error> {
    info!("received event: {}", event.payload);
    match process_event(&event.payload).await {
        Ok(record) => HandlerResponse::stored(&record.event_id),
        Err(e) => {
            error!("error processing event: {}", e);
            HandlerResponse::failed(&e.to_string())
        }
    }
}

#[cfg(test)]
use serde_json::json;

#[test]
fn test_s3_bucket_and_user() {
    let event = json!({
        "source": "aws.s3",
        "detail": {
            "requestParameters": {"bucketName": "my-bucket"},
            "userIdentity": {"userName": "bob"}
        }
    });
    let record = normalize(&event);
    assert_eq!(record.event_source, "aws.s3");
    assert_eq!(record.resource_name, "my-bucket");
    assert_eq!(record.username, "bob");
}

#[test]
fn test_s3_missing_bucket() {
    let event = json!({
        "source": "aws.s3",
        "detail": {"userIdentity": {"userName": "bob"}}
    });
    let record = normalize(&event);
    assert_eq!(record.resource_name, "unknown");
    assert_eq!(record.username, "bob");
}

#[test]
fn test_ec2_instance_no_identity() {
    let event = json!({
        "source": "aws.ec2",
        "detail": {"instance-id": "i-123"}
    });
    let record = normalize(&event);
    assert_eq!(record.resource_name, "i-123");
    assert_eq!(record.username, "system");
}

#[test]
fn test_username_priority() {
    assert_eq!(extract_username(Some(&json!({"userName": "alice"}))), "alice");
    assert_eq!(
        extract_username(Some(&json!({"arn": "arn:aws:iam::123:role/deploy"}))),
        "deploy"
    );
    assert_eq!(
        extract_username(Some(&json!({"principalId": "AID:session1"}))),
        "session1"
    );
    assert_eq!(
        extract_username(Some(&json!({"type": "AssumedRole"}))),
        "AssumedRole"
    );
    assert_eq!(extract_username(Some(&json!({}))), "system");
    assert_eq!(extract_username(None), "system");
}

#[test]
fn test_username_skips_empty_segments() {
    // userName present but empty, arn ends with a slash: both are skipped.
    let identity = json!({
        "userName": "",
        "arn": "arn:aws:iam::123:role/",
        "principalId": "AID:session2"
    });
    assert_eq!(extract_username(Some(&identity)), "session2");
}

#[test]
fn test_empty_envelope_defaults() {
    let record = normalize(&json!({}));
    assert_eq!(record.event_time, "unknown");
    assert_eq!(record.event_source, "unknown");
    assert_eq!(record.event_name, "unknown");
    assert_eq!(record.resource_name, "unknown");
    assert_eq!(record.region, "unknown");
    assert_eq!(record.username, "unknown");
    assert!(record.event_id.starts_with("unknown-"));
}

#[test]
fn test_raw_event_round_trip() {
    let event = json!({
        "source": "aws.s3",
        "region": "eu-west-1",
        "detail": {"requestParameters": {"bucketName": "b"}, "extra": [1, 2, 3]}
    });
    let record = normalize(&event);
    let round_tripped: Value = serde_json::from_str(&record.raw_event).unwrap();
    assert_eq!(round_tripped, event);
}

#[test]
fn test_response_bodies() {
    let ok = HandlerResponse::stored("aws.s3-1-abc").unwrap();
    assert_eq!(ok.status_code, 200);
    let body: Value = serde_json::from_str(&ok.body).unwrap();
    assert_eq!(body["eventId"], "aws.s3-1-abc");
    assert!(body["message"].is_string());

    let err = HandlerResponse::failed("table missing").unwrap();
    assert_eq!(err.status_code, 500);
    let body: Value = serde_json::from_str(&err.body).unwrap();
    assert_eq!(body["details"], "table missing");
    assert!(body["error"].is_string());
}
