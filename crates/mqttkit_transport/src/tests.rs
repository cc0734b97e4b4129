use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::mock::MockConnector;
use super::*;

#[tokio::test]
async fn test_tcp_connector_plain_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&[0xD0, 0x00]).await.unwrap();
        buf
    });

    let mut stream = TcpConnector::new()
        .open("127.0.0.1", port, false)
        .await
        .unwrap();
    stream.writer.write_all(&[0xC0, 0x00]).await.unwrap();
    stream.writer.flush().await.unwrap();

    let mut reply = [0u8; 2];
    stream.reader.read_exact(&mut reply).await.unwrap();

    assert_eq!(reply, [0xD0, 0x00]);
    assert_eq!(server.await.unwrap(), [0xC0, 0x00]);
}

#[tokio::test]
async fn test_tcp_connector_refused() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let result = TcpConnector::new().open("127.0.0.1", port, false).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_mock_connector_pipes_bytes() {
    let (connector, mut broker) = MockConnector::new();

    let mut stream = connector.open("broker", 1883, false).await.unwrap();
    let mut server = broker.accept().await.unwrap();

    stream.writer.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    server.write_all(b"pong").await.unwrap();
    stream.reader.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test]
async fn test_mock_connector_refuses_when_asked() {
    let (connector, mut broker) = MockConnector::new();
    broker.refuse_connections(true);

    let err = connector.open("broker", 1883, false).await.unwrap_err();
    assert_eq!(err, TransportError::Refused);
    assert!(broker.try_accept().is_none());

    broker.refuse_connections(false);
    assert!(connector.open("broker", 1883, false).await.is_ok());
    assert!(broker.try_accept().is_some());
    assert_eq!(broker.attempts(), 2);
}

#[tokio::test]
async fn test_mock_broker_drop_closes_stream() {
    let (connector, mut broker) = MockConnector::new();
    let mut stream = connector.open("broker", 1883, false).await.unwrap();
    drop(broker.accept().await.unwrap());

    let mut buf = [0u8; 1];
    assert_eq!(stream.reader.read(&mut buf).await.unwrap(), 0);
}

#[test]
fn test_io_error_mapping() {
    let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
    assert_eq!(TransportError::from(refused), TransportError::Refused);

    let other = std::io::Error::other("boom");
    assert_eq!(TransportError::from(other), TransportError::Io("boom".to_string()));
}
