//! Embedded MQTT broker (rumqttd) and subscriber for end-to-end tests

#![allow(dead_code)]

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Reserve a free local TCP port
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a broker on a free port and return the port
pub fn start_broker() -> u16 {
    let port = free_port();
    let listen: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let router_config = RouterConfig {
        max_segment_size: 1024 * 1024,
        max_segment_count: 10,
        max_connections: 100,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 262144,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    let config = Config {
        id: 0,
        router: router_config,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    };

    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the life of the broker
        let _ = broker.start();
    });

    // Give broker time to start
    thread::sleep(Duration::from_millis(200));
    port
}

/// Subscribe to `topic` and stream received payloads
///
/// Returns once the broker has acknowledged the subscription.
pub async fn subscribe(port: u16, topic: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let mut options = MqttOptions::new("test-subscriber", "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(5));

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    client.subscribe(topic, QoS::AtLeastOnce).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let (subscribed_tx, subscribed_rx) = oneshot::channel();
    tokio::spawn(async move {
        // Keep the client alive as long as the event loop runs
        let _client = client;
        let mut subscribed_tx = Some(subscribed_tx);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    if let Some(ready) = subscribed_tx.take() {
                        let _ = ready.send(());
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if tx.send(publish.payload.to_vec()).is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(5), subscribed_rx)
        .await
        .expect("subscription not acknowledged")
        .unwrap();
    rx
}

/// CONNACK accepting an MQTT 3.1.1 session
pub const CONNACK_V4_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

/// Accept one client on a bare TCP listener, read its CONNECT and answer with `connack`
///
/// Lets tests script broker behaviour a real broker will not produce on demand,
/// such as a specific refusal code or a dropped connection.
pub async fn answer_connect(
    listener: &tokio::net::TcpListener,
    connack: &[u8],
) -> tokio::net::TcpStream {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client did not connect")
        .unwrap();
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(n > 0 && buf[0] == 0x10, "expected CONNECT, got {:02x?}", &buf[..n]);
    stream.write_all(connack).await.unwrap();
    stream
}

/// Collect everything the client writes until it closes the connection
pub async fn read_until_closed(mut stream: tokio::net::TcpStream) -> Vec<u8> {
    use tokio::io::AsyncReadExt;

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .expect("client did not close the connection")
        .unwrap();
    received
}
