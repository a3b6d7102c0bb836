// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Queue-backed reader/writer halves for datagram flows.
//!
//! UDP sockets carry many flows over one socket, so the receive loop
//! feeds each flow's datagrams into its own reader queue. The queue is
//! unbounded and preserves arrival order.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
  pub data: Vec<u8>,
  pub peer: SocketAddr,
}

/// The feeding half held by the receive loop (and the connection map).
#[derive(Clone, Debug)]
pub struct DatagramSender {
  sender: mpsc::UnboundedSender<Datagram>,
}

impl DatagramSender {
  /// Enqueue a datagram, waking any suspended read. Returns false when
  /// the reading half is gone; the datagram is then dropped.
  pub fn feed(&self, data: Vec<u8>, peer: SocketAddr) -> bool {
    self.sender.send(Datagram { data, peer }).is_ok()
  }
}

#[derive(Debug)]
pub struct DatagramReader {
  receiver: mpsc::UnboundedReceiver<Datagram>,
}

impl DatagramReader {
  /// The next datagram in arrival order, or `None` once every sender is
  /// dropped and the queue is drained.
  pub async fn recv(&mut self) -> Option<Datagram> {
    self.receiver.recv().await
  }
}

pub fn channel() -> (DatagramSender, DatagramReader) {
  let (sender, receiver) = mpsc::unbounded_channel();
  (DatagramSender { sender }, DatagramReader { receiver })
}

/// Write half of a datagram flow, pinned to a single peer.
#[derive(Debug)]
pub struct DatagramWriter {
  socket: Arc<UdpSocket>,
  peer: SocketAddr,
}

impl DatagramWriter {
  pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
    Self { socket, peer }
  }

  pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
    self.socket.send_to(data, self.peer).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn reader_preserves_arrival_order() {
    let (sender, mut reader) = channel();
    let peer: SocketAddr = "127.0.0.1:5353".parse().unwrap();
    for payload in &[&b"first"[..], &b"second"[..], &b"third"[..]] {
      assert!(sender.feed(payload.to_vec(), peer));
    }

    for expected in &[&b"first"[..], &b"second"[..], &b"third"[..]] {
      let datagram = reader.recv().await.expect("queued datagram");
      assert_eq!(&datagram.data[..], *expected);
      assert_eq!(datagram.peer, peer);
    }
  }

  #[tokio::test]
  async fn reader_ends_when_senders_are_dropped() {
    let (sender, mut reader) = channel();
    let peer: SocketAddr = "127.0.0.1:5353".parse().unwrap();
    sender.feed(b"last".to_vec(), peer);
    drop(sender);

    assert!(reader.recv().await.is_some());
    assert!(reader.recv().await.is_none());
  }

  #[tokio::test]
  async fn writer_sends_to_its_peer() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let writer = DatagramWriter::new(Arc::new(sender), receiver.local_addr().unwrap());

    writer.send(b"ping").await.unwrap();

    let mut buf = [0u8; 16];
    let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"ping");
  }
}
