use amqp_relay::{ConnectionConfig, ConnectionManager, RabbitMQError, Shutdown};
use std::time::Duration;

use crate::common::{broker_uri, connect};

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_connection_establishes_and_closes() {
    let shutdown = Shutdown::new();
    let connection = connect(&shutdown).await;

    assert!(!connection.is_closed().await);
    assert_eq!(connection.generation().await, 1);
    let handle = connection.get_connection().await.expect("live handle");
    assert!(handle.status().connected());

    // Already connected: no second dial.
    connection.connect().await.unwrap();
    assert_eq!(connection.generation().await, 1);

    connection.close().await.unwrap();
    assert!(connection.is_closed().await);
    assert!(connection.get_connection().await.is_none());
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_root_cancel_closes_connection_supervision() {
    let root = Shutdown::new();
    let connection = connect(&root).await;

    root.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(connection.get_connection().await.is_none());
    assert!(matches!(connection.connect().await, Err(RabbitMQError::Cancelled)));
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_bad_credentials_are_fatal() {
    let mut uri = broker_uri();
    if let Some(at) = uri.rfind('@') {
        uri = format!("amqp://nobody:wrong{}", &uri[at..]);
    }
    let result = ConnectionManager::open(&ConnectionConfig::from_uri(uri), &Shutdown::new()).await;
    assert!(matches!(result, Err(RabbitMQError::ConnectionError(_))));
}
