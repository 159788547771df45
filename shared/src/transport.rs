//! Datagram transport seam.
//!
//! Endpoints are generic over [`Transport`] so the same protocol code runs on a
//! real `tokio::net::UdpSocket` and on the in-memory [`crate::sim`] network used
//! to script loss and unresponsive peers in tests.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Unreliable, unordered datagram I/O. All methods take `&self` so one
/// transport can be shared by the receive loop and every sending task.
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl Transport for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}
