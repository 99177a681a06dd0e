//! Transport abstraction for relay connections.
//!
//! A transport is split into a [`FrameSource`] (read half, owned by the
//! dispatch loop) and a [`FrameSink`] (write half, owned by the connection's
//! writer task). The server adapts WebSocket halves to these traits; the
//! [`memory`] transport backs tests and embedded use.

use async_trait::async_trait;

use crate::RelayError;

/// One inbound unit of transport activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An application text frame carrying one encoded message.
    Text(String),
    /// Control traffic (ping or pong). Proves the peer is alive but
    /// carries no message.
    Heartbeat,
}

/// Read half of a duplex transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly.
    async fn next_frame(&mut self) -> Result<Option<Frame>, RelayError>;
}

/// Write half of a duplex transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one complete text frame.
    async fn send_frame(&mut self, frame: String) -> Result<(), RelayError>;

    /// Ask the peer to prove it is alive. Transports without control
    /// frames accept and ignore it.
    async fn send_ping(&mut self) -> Result<(), RelayError> {
        Ok(())
    }

    /// Close the transport. Further sends fail.
    async fn close(&mut self) -> Result<(), RelayError>;
}

/// In-process transport built on unbounded channels.
pub mod memory {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{Frame, FrameSink, FrameSource};
    use crate::{Message, RelayError};

    /// Create a connected transport.
    ///
    /// Returns the remote peer handle plus the source and sink halves that
    /// are handed to the relay.
    pub fn pair() -> (MemoryPeer, MemorySource, MemorySink) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            MemoryPeer {
                to_server: Some(inbound_tx),
                from_server: outbound_rx,
                pings: 0,
            },
            MemorySource { rx: inbound_rx },
            MemorySink {
                tx: Some(outbound_tx),
            },
        )
    }

    /// The client end of an in-memory transport.
    #[derive(Debug)]
    pub struct MemoryPeer {
        to_server: Option<mpsc::UnboundedSender<Frame>>,
        from_server: mpsc::UnboundedReceiver<Frame>,
        pings: usize,
    }

    impl MemoryPeer {
        /// Send a raw text frame to the server side.
        pub fn send_frame(&self, frame: impl Into<String>) -> Result<(), RelayError> {
            self.send(Frame::Text(frame.into()))
        }

        /// Send a control frame, as a client answering a ping would.
        pub fn send_heartbeat(&self) -> Result<(), RelayError> {
            self.send(Frame::Heartbeat)
        }

        fn send(&self, frame: Frame) -> Result<(), RelayError> {
            match &self.to_server {
                Some(tx) => tx.send(frame).map_err(|_| RelayError::TransportClosed),
                None => Err(RelayError::TransportClosed),
            }
        }

        /// Encode and send a message.
        pub fn send_message(&self, message: &Message) -> Result<(), RelayError> {
            self.send_frame(message.encode()?)
        }

        /// Wait for the next text frame written by the server. Pings are
        /// counted and skipped.
        ///
        /// Returns `None` once the server side has closed the transport.
        pub async fn recv_frame(&mut self) -> Option<String> {
            loop {
                match self.from_server.recv().await? {
                    Frame::Text(text) => return Some(text),
                    Frame::Heartbeat => self.pings += 1,
                }
            }
        }

        /// Wait for the next frame of any kind, pings included.
        pub async fn recv_raw(&mut self) -> Option<Frame> {
            self.from_server.recv().await
        }

        /// Pings skipped so far by [`MemoryPeer::recv_frame`].
        pub fn pings(&self) -> usize {
            self.pings
        }

        /// Wait for the next frame and decode it as a message.
        pub async fn recv_message(&mut self) -> Option<Result<Message, RelayError>> {
            self.recv_frame().await.map(|frame| Message::decode(&frame))
        }

        /// Take a frame if one is already buffered.
        pub fn try_recv_frame(&mut self) -> Option<String> {
            while let Ok(frame) = self.from_server.try_recv() {
                match frame {
                    Frame::Text(text) => return Some(text),
                    Frame::Heartbeat => self.pings += 1,
                }
            }
            None
        }

        /// Close the client-to-server direction, as a browser tab would on exit.
        pub fn hang_up(&mut self) {
            self.to_server = None;
        }

        /// Drop the receive side too, so server writes start failing.
        pub fn disconnect(mut self) {
            self.to_server = None;
            self.from_server.close();
        }
    }

    /// Server-side read half of an in-memory transport.
    #[derive(Debug)]
    pub struct MemorySource {
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn next_frame(&mut self) -> Result<Option<Frame>, RelayError> {
            Ok(self.rx.recv().await)
        }
    }

    /// Server-side write half of an in-memory transport.
    #[derive(Debug)]
    pub struct MemorySink {
        tx: Option<mpsc::UnboundedSender<Frame>>,
    }

    impl MemorySink {
        fn send(&self, frame: Frame) -> Result<(), RelayError> {
            match &self.tx {
                Some(tx) => tx.send(frame).map_err(|_| RelayError::TransportClosed),
                None => Err(RelayError::TransportClosed),
            }
        }
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_frame(&mut self, frame: String) -> Result<(), RelayError> {
            self.send(Frame::Text(frame))
        }

        async fn send_ping(&mut self) -> Result<(), RelayError> {
            self.send(Frame::Heartbeat)
        }

        async fn close(&mut self) -> Result<(), RelayError> {
            self.tx = None;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_frames_flow_both_ways() {
            let (mut peer, mut source, mut sink) = pair();

            peer.send_frame("hello").unwrap();
            assert_eq!(
                source.next_frame().await.unwrap(),
                Some(Frame::Text("hello".to_string()))
            );

            sink.send_frame("world".to_string()).await.unwrap();
            assert_eq!(peer.recv_frame().await.as_deref(), Some("world"));
        }

        #[tokio::test]
        async fn test_heartbeats_in_both_directions() {
            let (mut peer, mut source, mut sink) = pair();

            peer.send_heartbeat().unwrap();
            assert_eq!(source.next_frame().await.unwrap(), Some(Frame::Heartbeat));

            sink.send_ping().await.unwrap();
            sink.send_frame("after ping".to_string()).await.unwrap();
            assert_eq!(peer.recv_frame().await.as_deref(), Some("after ping"));
            assert_eq!(peer.pings(), 1);
        }

        #[tokio::test]
        async fn test_hang_up_ends_source() {
            let (mut peer, mut source, _sink) = pair();
            peer.hang_up();
            assert!(source.next_frame().await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_sink_close_ends_peer_stream() {
            let (mut peer, _source, mut sink) = pair();
            sink.close().await.unwrap();
            assert!(peer.recv_frame().await.is_none());
            assert!(matches!(
                sink.send_frame("late".to_string()).await,
                Err(RelayError::TransportClosed)
            ));
        }

        #[tokio::test]
        async fn test_disconnected_peer_fails_writes() {
            let (peer, _source, mut sink) = pair();
            peer.disconnect();
            assert!(sink.send_frame("lost".to_string()).await.is_err());
        }
    }
}
