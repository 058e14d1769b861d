//! MQTT over plain TCP.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::link::{BrokerLink, ConnectOptions, Connector, LinkEvent};
use super::packet::{self, Packet, PacketError, DEFAULT_MAX_PACKET};
use crate::error::BrokerError;

pub const DEFAULT_PORT: u16 = 1883;

/// Bound on TCP connect and on the wait for CONNACK.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// `mqtt://host:port`, `tcp://host:port` or `host[:port]` to `host:port`.
pub fn parse_address(address: &str) -> Result<String, BrokerError> {
    let rest = address
        .strip_prefix("mqtt://")
        .or_else(|| address.strip_prefix("tcp://"))
        .unwrap_or(address)
        .trim_end_matches('/');

    if rest.is_empty() || rest.contains("://") {
        return Err(BrokerError::Address(address.to_string()));
    }

    // [v6]:port or [v6]
    if let Some(v6) = rest.strip_prefix('[') {
        let (host, tail) = v6
            .split_once(']')
            .ok_or_else(|| BrokerError::Address(address.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, address)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(BrokerError::Address(address.to_string())),
        };
        return Ok(format!("[{}]:{}", host, port));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Ok(format!("{}:{}", host, parse_port(port, address)?))
        }
        Some(_) => Err(BrokerError::Address(address.to_string())),
        None => Ok(format!("{}:{}", rest, DEFAULT_PORT)),
    }
}

fn parse_port(port: &str, address: &str) -> Result<u16, BrokerError> {
    port.parse::<u16>()
        .map_err(|_| BrokerError::Address(address.to_string()))
}

fn protocol(e: PacketError) -> BrokerError {
    BrokerError::Protocol(e.to_string())
}

pub struct MqttConnector {
    address: String,
    target: String,
}

impl MqttConnector {
    pub fn new(address: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            address: address.to_string(),
            target: parse_address(address)?,
        })
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn BrokerLink>, BrokerError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.target))
            .await
            .map_err(|_| BrokerError::Timeout(CONNECT_TIMEOUT))??;
        stream.set_nodelay(true)?;

        let mut link = MqttLink::new(stream);
        packet::encode_connect(options, &mut link.write_buf).map_err(protocol)?;
        link.flush().await?;

        let ack = timeout(CONNECT_TIMEOUT, link.read_packet())
            .await
            .map_err(|_| BrokerError::Timeout(CONNECT_TIMEOUT))??;

        match ack {
            Some(Packet::ConnAck { code: 0, .. }) => {
                debug!("CONNACK from {}", self.address);
                Ok(Box::new(link))
            }
            Some(Packet::ConnAck { code, .. }) => {
                Err(BrokerError::Refused(packet::connack_reason(code).to_string()))
            }
            Some(other) => Err(BrokerError::Protocol(format!(
                "expected CONNACK, got {:?}",
                other
            ))),
            None => Err(BrokerError::Closed),
        }
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}

pub struct MqttLink {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    next_pkid: u16,
}

impl MqttLink {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
            next_pkid: 1,
        }
    }

    async fn flush(&mut self) -> Result<(), BrokerError> {
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        Ok(())
    }

    /// `Ok(None)` when the peer closed the stream.
    async fn read_packet(&mut self) -> Result<Option<Packet>, BrokerError> {
        loop {
            if let Some(packet) =
                packet::decode(&mut self.read_buf, DEFAULT_MAX_PACKET).map_err(protocol)?
            {
                return Ok(Some(packet));
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    fn pkid(&mut self) -> u16 {
        let pkid = self.next_pkid;
        self.next_pkid = self.next_pkid.checked_add(1).unwrap_or(1);
        pkid
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let pkid = self.pkid();
        packet::encode_subscribe(pkid, topic, &mut self.write_buf).map_err(protocol)?;
        self.flush().await
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        packet::encode_publish(topic, payload.as_bytes(), &mut self.write_buf).map_err(protocol)?;
        self.flush().await
    }

    async fn ping(&mut self) -> Result<(), BrokerError> {
        packet::encode_pingreq(&mut self.write_buf);
        self.flush().await
    }

    async fn next_event(&mut self) -> Result<LinkEvent, BrokerError> {
        loop {
            match self.read_packet().await? {
                None => return Ok(LinkEvent::Closed),
                Some(Packet::Publish { topic, payload, .. }) => {
                    return Ok(LinkEvent::Message {
                        topic,
                        payload: String::from_utf8_lossy(&payload).into_owned(),
                    });
                }
                Some(Packet::PingResp) => return Ok(LinkEvent::Pong),
                Some(Packet::SubAck { codes, .. }) => {
                    if codes.contains(&0x80) {
                        return Err(BrokerError::Protocol("subscription rejected".to_string()));
                    }
                    return Ok(LinkEvent::Subscribed);
                }
                Some(other) => trace!("ignoring {:?}", other),
            }
        }
    }

    async fn close(&mut self) {
        packet::encode_disconnect(&mut self.write_buf);
        if let Err(e) = self.flush().await {
            debug!("DISCONNECT not sent: {}", e);
        }
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::link::Will;
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_address() {
        let ok = [
            ("mqtt://127.0.0.1:1883", "127.0.0.1:1883"),
            ("tcp://broker.local:1884", "broker.local:1884"),
            ("broker.local", "broker.local:1883"),
            ("mqtt://broker.local/", "broker.local:1883"),
            ("[::1]:1990", "[::1]:1990"),
            ("mqtt://[::1]", "[::1]:1883"),
        ];
        for (input, expected) in ok {
            assert_eq!(parse_address(input).unwrap(), expected, "{}", input);
        }

        for bad in ["", "mqtt://", ":1883", "host:notaport", "ws://host:80", "[::1"] {
            assert!(parse_address(bad).is_err(), "{} should fail", bad);
        }
    }

    fn options() -> ConnectOptions {
        ConnectOptions {
            client_id: "iot-ubusd".to_string(),
            keepalive_secs: 6,
            clean_session: true,
            will: Some(Will {
                topic: "req".to_string(),
                message: "goodbye".to_string(),
            }),
        }
    }

    async fn read_one(stream: &mut TcpStream, buf: &mut BytesMut) -> Packet {
        loop {
            if let Some(p) = packet::decode(buf, DEFAULT_MAX_PACKET).unwrap() {
                return p;
            }
            assert!(stream.read_buf(buf).await.unwrap() > 0, "client hung up");
        }
    }

    #[tokio::test]
    async fn test_session_against_fake_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();

            // CONNECT (type 1) is not an inbound type for the client codec
            assert_eq!(read_one(&mut stream, &mut buf).await, Packet::Other(1));
            stream.write_all(&[0x20, 2, 0, 0]).await.unwrap();

            assert_eq!(read_one(&mut stream, &mut buf).await, Packet::Other(8));
            stream.write_all(&[0x90, 3, 0, 1, 0]).await.unwrap();

            match read_one(&mut stream, &mut buf).await {
                Packet::Publish { topic, payload, .. } => {
                    assert_eq!(topic, "req");
                    assert_eq!(&payload[..], b"hello");
                }
                other => panic!("expected PUBLISH, got {:?}", other),
            }
            let mut out = BytesMut::new();
            packet::encode_publish("resp", br#"{"x":1}"#, &mut out).unwrap();
            stream.write_all(&out).await.unwrap();

            assert_eq!(read_one(&mut stream, &mut buf).await, Packet::Other(12));
            stream.write_all(&[0xD0, 0]).await.unwrap();

            assert_eq!(read_one(&mut stream, &mut buf).await, Packet::Other(14));
        });

        let connector = MqttConnector::new(&format!("mqtt://{}", addr)).unwrap();
        let mut link = connector.connect(&options()).await.unwrap();

        link.subscribe("resp").await.unwrap();
        assert_eq!(link.next_event().await.unwrap(), LinkEvent::Subscribed);

        link.publish("req", "hello").await.unwrap();
        assert_eq!(
            link.next_event().await.unwrap(),
            LinkEvent::Message {
                topic: "resp".to_string(),
                payload: r#"{"x":1}"#.to_string()
            }
        );

        link.ping().await.unwrap();
        assert_eq!(link.next_event().await.unwrap(), LinkEvent::Pong);

        link.close().await;
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            read_one(&mut stream, &mut buf).await;
            stream.write_all(&[0x20, 2, 0, 5]).await.unwrap();
        });

        let connector = MqttConnector::new(&addr.to_string()).unwrap();
        match connector.connect(&options()).await {
            Err(BrokerError::Refused(reason)) => assert_eq!(reason, "not authorized"),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("connection should be refused"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_is_an_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            read_one(&mut stream, &mut buf).await;
            stream.write_all(&[0x20, 2, 0, 0]).await.unwrap();
        });

        let connector = MqttConnector::new(&addr.to_string()).unwrap();
        let mut link = connector.connect(&options()).await.unwrap();
        assert_eq!(link.next_event().await.unwrap(), LinkEvent::Closed);
    }
}
