//! Forwarding loop - UDP datagrams in, MQTT publishes out
//!
//! Strictly sequential: receive one datagram, publish it, wait for the
//! publish to complete or fail, then receive the next. At most one datagram
//! is in flight, so messages reach the broker in arrival order and
//! throughput is bounded by the publish round trip.
//!
//! Shutdown is observed while waiting for a datagram and during the pause
//! after a receive error, never in the middle of a publish.

use crate::domain::{Datagram, QosLevel};
use crate::infra::config::Config;
use crate::infra::stats::ForwardStats;
use crate::io::mqtt::PublishError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

/// Publish side of the forwarder
///
/// Implemented by `io::mqtt::Session`. Calls never overlap: the forwarder
/// awaits each publish before starting the next.
#[async_trait]
pub trait Publisher: Send {
    /// Publish `payload` with `retain = false` and wait for completion
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        timeout: Duration,
    ) -> Result<(), PublishError>;

    /// Service the connection while no publish is in flight
    async fn idle(&mut self);

    /// Close the connection gracefully
    async fn disconnect(&mut self);
}

/// Receive side of the forwarder
///
/// Implemented by `io::udp::DatagramSocket`. `recv` must be cancel safe.
#[async_trait]
pub trait DatagramSource: Send {
    async fn recv(&mut self) -> io::Result<Datagram>;
}

/// What woke the loop up while waiting for a datagram
enum Wake {
    Shutdown,
    Datagram(io::Result<Datagram>),
    Idle,
    Report,
}

pub struct Forwarder<S: DatagramSource, P: Publisher> {
    source: S,
    publisher: P,
    topic: String,
    qos: QosLevel,
    publish_timeout: Duration,
    receive_backoff: Duration,
    stats_interval: Option<Duration>,
    stats: ForwardStats,
}

impl<S: DatagramSource, P: Publisher> Forwarder<S, P> {
    pub fn new(config: &Config, source: S, publisher: P) -> Self {
        Self {
            source,
            publisher,
            topic: config.mqtt_topic().to_string(),
            qos: config.mqtt_qos(),
            publish_timeout: config.mqtt_connection_timeout(),
            receive_backoff: config.mqtt_retry_interval(),
            stats_interval: config.stats_interval(),
            stats: ForwardStats::new(),
        }
    }

    /// Run until `shutdown` turns true (or its sender goes away)
    ///
    /// Closes the broker session before returning the final counters.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ForwardStats {
        info!(topic = %self.topic, qos = %self.qos, "forwarder_started");

        let mut report = self.stats_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wake = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Wake::Shutdown
                    } else {
                        continue;
                    }
                }
                result = self.source.recv() => Wake::Datagram(result),
                _ = next_report(&mut report) => Wake::Report,
                _ = self.publisher.idle() => Wake::Idle,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Datagram(Ok(datagram)) => self.forward(datagram).await,
                Wake::Datagram(Err(e)) => {
                    self.stats.record_receive_error();
                    warn!(error = %e, retry_ms = %self.receive_backoff.as_millis(), "udp_receive_failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.receive_backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Wake::Report => self.stats.log("forward_stats"),
                Wake::Idle => {}
            }
        }

        info!("forwarder_shutdown");
        self.publisher.disconnect().await;
        self.stats.log("forward_stats_final");
        self.stats
    }

    async fn forward(&mut self, datagram: Datagram) {
        self.stats.record_received(datagram.truncated);
        debug!(source = %datagram.source, len = %datagram.len(), "udp_datagram_received");
        if datagram.truncated {
            warn!(source = %datagram.source, len = %datagram.len(), "udp_datagram_truncated");
        }

        let len = datagram.len();
        match self
            .publisher
            .publish(&self.topic, datagram.payload, self.qos, self.publish_timeout)
            .await
        {
            Ok(()) => {
                self.stats.record_published(len);
                debug!(topic = %self.topic, len = %len, "mqtt_published");
            }
            Err(e) => {
                self.stats.record_failed();
                error!(topic = %self.topic, len = %len, error = %e, "mqtt_publish_failed");
            }
        }
    }
}

async fn next_report(report: &mut Option<Interval>) {
    match report {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
