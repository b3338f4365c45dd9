//! End-to-end forwarding through an embedded broker

mod common;

use std::net::UdpSocket;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use udp_mqtt_gateway::infra::Config;
use udp_mqtt_gateway::io::{ConnectError, DatagramSocket, Session};
use udp_mqtt_gateway::services::Forwarder;

fn gateway_config(broker_port: u16, extra: &str) -> Config {
    Config::parse_str(&format!(
        "InputUdpPort 9000\n\
         MqttUrl tcp://127.0.0.1:{broker_port}\n\
         MqttTopic test/topic\n\
         MqttClientID gw1\n\
         MqttConnectionTimeout 5000\n\
         StatsIntervalSecs 0\n\
         {extra}"
    ))
    .unwrap()
}

async fn forward_through_broker(extra: &str, datagrams: &[&[u8]]) {
    let broker_port = common::start_broker();
    let mut received = common::subscribe(broker_port, "test/topic").await;

    let config = gateway_config(broker_port, extra);
    let session = Session::connect(&config).await.expect("gateway connects");
    let socket = DatagramSocket::bind_addr("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let gateway_addr = socket.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Forwarder::new(&config, socket, session).run(shutdown_rx));

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for datagram in datagrams {
        sender.send_to(datagram, gateway_addr).unwrap();
    }

    for expected in datagrams {
        let payload = timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("message not delivered")
            .unwrap();
        assert_eq!(&payload[..], *expected);
    }

    shutdown_tx.send(true).unwrap();
    let stats = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(stats.published, datagrams.len() as u64);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_datagram_reaches_subscriber_qos0() {
    forward_through_broker("", &[b"hello"]).await;
}

#[tokio::test]
async fn test_datagrams_arrive_in_order_qos1() {
    forward_through_broker("MqttQosLevel 1\n", &[b"one", b"two", b"three", b"four"]).await;
}

#[tokio::test]
async fn test_datagrams_arrive_in_order_qos2() {
    forward_through_broker("MqttQosLevel 2\n", &[b"first", b"second"]).await;
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let closed_port = common::free_port();
    let config = gateway_config(closed_port, "MqttConnectionTimeout 1000\n");

    let err = Session::connect(&config).await.err().expect("connect must fail");
    assert!(
        matches!(err, ConnectError::Transport(_) | ConnectError::Timeout(_)),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_connect_retries_then_gives_up() {
    let closed_port = common::free_port();
    let config = gateway_config(
        closed_port,
        "MqttConnectionTimeout 500\nMqttConnectAttempts 3\nMqttRetryInterval 20\n",
    );

    let started = std::time::Instant::now();
    let err = Session::connect(&config).await.err().expect("connect must fail");
    assert!(err.is_transient());
    // Two backoff sleeps: 20ms + 40ms
    assert!(started.elapsed() >= Duration::from_millis(60));
}
