//! Inbound UDP socket
//!
//! Binds `0.0.0.0:<InputUdpPort>` and hands out one datagram per call.
//! Payloads longer than `UDP_BUFFER_SIZE` are cut to that size; the buffer
//! is one byte larger so truncation can be detected and counted.

use crate::domain::{Datagram, UDP_BUFFER_SIZE};
use crate::services::forwarder::DatagramSource;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::info;

pub struct DatagramSocket {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl DatagramSocket {
    /// Bind on all IPv4 interfaces
    pub async fn bind(port: u16) -> io::Result<Self> {
        Self::bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into()).await
    }

    pub async fn bind_addr(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "udp_bound");
        Ok(Self { socket, buf: vec![0u8; UDP_BUFFER_SIZE + 1] })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for the next datagram
    ///
    /// Cancel safe: dropping the future before completion loses nothing.
    pub async fn recv(&mut self) -> io::Result<Datagram> {
        let (len, source) = self.socket.recv_from(&mut self.buf).await?;
        let truncated = len > UDP_BUFFER_SIZE;
        let len = len.min(UDP_BUFFER_SIZE);

        Ok(Datagram { payload: Bytes::copy_from_slice(&self.buf[..len]), source, truncated })
    }
}

#[async_trait]
impl DatagramSource for DatagramSocket {
    async fn recv(&mut self) -> io::Result<Datagram> {
        DatagramSocket::recv(self).await
    }
}
