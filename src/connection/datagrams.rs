use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::frame::Datagram;

/// Number of received datagrams buffered before new arrivals are discarded
const DATAGRAM_RCV_QUEUE_LEN: usize = 128;

/// Queues for the unreliable datagram extension
///
/// Outgoing datagrams wait for the packer; the application experiences backpressure
/// through [`SendDatagramError::Blocked`] once `send_buffer_size` bytes are queued.
/// Incoming datagrams are buffered up to a fixed count, and a datagram arriving at a
/// full queue is quietly dropped: the channel is unreliable by contract.
///
/// Closing is one-shot; the stored error is returned to every subsequent send and
/// receive.
pub(crate) struct DatagramState {
    outgoing: VecDeque<Datagram>,
    outgoing_total: usize,
    send_buffer_size: usize,
    incoming: VecDeque<Bytes>,
    closed: Option<SendDatagramError>,
}

impl DatagramState {
    pub(crate) fn new(send_buffer_size: usize) -> Self {
        Self {
            outgoing: VecDeque::new(),
            outgoing_total: 0,
            send_buffer_size,
            incoming: VecDeque::new(),
            closed: None,
        }
    }

    /// Queue a datagram for transmission
    pub(crate) fn send(&mut self, data: Bytes, max_size: usize) -> Result<(), SendDatagramError> {
        if let Some(ref err) = self.closed {
            return Err(err.clone());
        }
        if data.len() > max_size {
            return Err(SendDatagramError::TooLarge);
        }
        if self.outgoing_total + data.len() > self.send_buffer_size {
            return Err(SendDatagramError::Blocked(data));
        }
        self.outgoing_total += data.len();
        self.outgoing.push_back(Datagram { data });
        Ok(())
    }

    /// Dequeue a datagram for the packer, if the next one fits in `space` bytes
    pub(crate) fn get(&mut self, space: usize, length_prefix: bool) -> Option<Datagram> {
        let datagram = self.outgoing.pop_front()?;
        if datagram.size(length_prefix) > space {
            self.outgoing.push_front(datagram);
            return None;
        }
        self.outgoing_total -= datagram.data.len();
        Some(datagram)
    }

    pub(crate) fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Buffer a datagram received from the peer
    pub(crate) fn received(&mut self, data: Bytes) {
        if self.closed.is_some() {
            return;
        }
        if self.incoming.len() >= DATAGRAM_RCV_QUEUE_LEN {
            debug!(len = data.len(), "discarding DATAGRAM frame");
            return;
        }
        trace!(len = data.len(), "datagram received");
        self.incoming.push_back(data);
    }

    /// Hand a received datagram to the application
    pub(crate) fn recv(&mut self) -> Result<Option<Bytes>, SendDatagramError> {
        match self.incoming.pop_front() {
            Some(data) => Ok(Some(data)),
            None => match self.closed {
                Some(ref err) => Err(err.clone()),
                None => Ok(None),
            },
        }
    }

    /// Poison both directions with `err`; the first close wins
    pub(crate) fn close(&mut self, err: SendDatagramError) {
        if self.closed.is_none() {
            self.closed = Some(err);
        }
    }
}

/// Errors that can arise when sending or receiving a datagram
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SendDatagramError {
    /// The peer does not support receiving datagram frames
    #[error("datagrams not supported by peer")]
    UnsupportedByPeer,
    /// Datagram support is disabled locally
    #[error("datagram support disabled")]
    Disabled,
    /// The datagram is larger than the connection can currently accommodate
    ///
    /// Indicates that the path MTU minus overhead or the limit advertised by the peer
    /// has been exceeded.
    #[error("datagram too large")]
    TooLarge,
    /// The send buffer is full; the datagram is returned for a later retry
    #[error("datagram send buffer full")]
    Blocked(Bytes),
    /// The connection was closed
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_drain() {
        let mut state = DatagramState::new(1024);
        state.send(Bytes::from_static(b"hello"), 1000).unwrap();
        state.send(Bytes::from_static(b"world"), 1000).unwrap();
        let first = state.get(100, true).unwrap();
        assert_eq!(&first.data[..], b"hello");
        let second = state.get(100, true).unwrap();
        assert_eq!(&second.data[..], b"world");
        assert!(state.get(100, true).is_none());
    }

    #[test]
    fn send_backpressure() {
        let mut state = DatagramState::new(8);
        state.send(Bytes::from_static(b"12345678"), 1000).unwrap();
        let err = state.send(Bytes::from_static(b"x"), 1000).unwrap_err();
        assert!(matches!(err, SendDatagramError::Blocked(_)));
        // Draining the queue unblocks the sender
        state.get(1000, true).unwrap();
        state.send(Bytes::from_static(b"x"), 1000).unwrap();
    }

    #[test]
    fn oversized_datagrams_are_rejected() {
        let mut state = DatagramState::new(1024);
        let err = state.send(Bytes::from_static(b"too long"), 4).unwrap_err();
        assert_eq!(err, SendDatagramError::TooLarge);
    }

    #[test]
    fn packer_leaves_datagrams_that_do_not_fit() {
        let mut state = DatagramState::new(1024);
        state.send(Bytes::from_static(b"0123456789"), 1000).unwrap();
        assert!(state.get(5, true).is_none());
        // Still queued for a roomier packet
        assert!(state.has_outgoing());
        assert!(state.get(50, true).is_some());
    }

    #[test]
    fn receive_queue_drops_new_arrivals_when_full() {
        let mut state = DatagramState::new(1024);
        for i in 0..DATAGRAM_RCV_QUEUE_LEN {
            state.received(Bytes::from(vec![i as u8]));
        }
        state.received(Bytes::from_static(b"dropped"));
        // The oldest datagram is still at the front; the new arrival is gone
        assert_eq!(state.recv().unwrap().unwrap(), Bytes::from(vec![0u8]));
        let mut count = 1;
        while let Ok(Some(data)) = state.recv() {
            assert_ne!(&data[..], b"dropped");
            count += 1;
        }
        assert_eq!(count, DATAGRAM_RCV_QUEUE_LEN);
    }

    #[test]
    fn close_poisons_both_directions() {
        let mut state = DatagramState::new(1024);
        state.received(Bytes::from_static(b"pending"));
        state.close(SendDatagramError::ConnectionClosed);
        // Buffered data is still delivered, then the close error surfaces
        assert!(state.recv().unwrap().is_some());
        assert_eq!(state.recv().unwrap_err(), SendDatagramError::ConnectionClosed);
        assert_eq!(
            state.send(Bytes::from_static(b"x"), 1000).unwrap_err(),
            SendDatagramError::ConnectionClosed
        );
        // Only the first close error is kept
        state.close(SendDatagramError::Disabled);
        assert_eq!(state.recv().unwrap_err(), SendDatagramError::ConnectionClosed);
    }
}
