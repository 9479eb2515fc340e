//! Bounded packet FIFOs between the socket tasks and the engine.
//!
//! Each direction (inbound, outbound) gets one ring. The expected regime is
//! single-producer/single-consumer, but the ring does not assume it: all
//! access goes through an internal mutex held only for the slot exchange.
//! A full ring refuses the push and hands the packet back; nothing ever
//! blocks waiting for space.

use crate::config::FIFO_CAPACITY;
use std::sync::Mutex;

/// An owned datagram. Created by the receiver or an encoder, moved through
/// exactly one FIFO, and dropped by whichever task pops it.
pub type Packet = Vec<u8>;

#[derive(Debug, thiserror::Error)]
pub enum FifoError {
    /// The ring is at capacity. The rejected packet rides along so the
    /// caller keeps ownership.
    #[error("packet fifo is full")]
    Full(Packet),
}

#[derive(Debug)]
struct FifoInner {
    slots: Box<[Option<Packet>]>,
    front: usize,
    len: usize,
}

/// Fixed-capacity packet ring. Never reallocates after construction.
#[derive(Debug)]
pub struct PacketFifo {
    inner: Mutex<FifoInner>,
    capacity: usize,
}

impl PacketFifo {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            inner: Mutex::new(FifoInner { slots, front: 0, len: 0 }),
            capacity,
        }
    }

    /// Append a packet at the back of the ring.
    pub fn push(&self, packet: Packet) -> Result<(), FifoError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len == self.capacity {
            return Err(FifoError::Full(packet));
        }
        let slot = (inner.front + inner.len) % self.capacity;
        inner.slots[slot] = Some(packet);
        inner.len += 1;
        Ok(())
    }

    /// Remove and return the front packet, or `None` when the ring is empty.
    pub fn pop(&self) -> Option<Packet> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len == 0 {
            return None;
        }
        let front = inner.front;
        let packet = inner.slots[front].take();
        inner.front = (front + 1) % self.capacity;
        inner.len -= 1;
        packet
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PacketFifo {
    fn default() -> Self {
        Self::new(FIFO_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_orders_packets() {
        let fifo = PacketFifo::new(4);
        fifo.push(vec![1]).unwrap();
        fifo.push(vec![2]).unwrap();
        assert_eq!(fifo.pop(), Some(vec![1]));
        assert_eq!(fifo.pop(), Some(vec![2]));
        assert_eq!(fifo.pop(), None);
    }

    #[test]
    fn test_fifo_full_returns_packet() {
        let fifo = PacketFifo::new(2);
        fifo.push(vec![1]).unwrap();
        fifo.push(vec![2]).unwrap();
        match fifo.push(vec![3]) {
            Err(FifoError::Full(p)) => assert_eq!(p, vec![3]),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(fifo.len(), 2);
    }

    #[test]
    fn test_fifo_wraps_around() {
        let fifo = PacketFifo::new(3);
        // Walk the front index all the way around the ring.
        for i in 0..10u8 {
            fifo.push(vec![i]).unwrap();
            assert_eq!(fifo.pop(), Some(vec![i]));
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_fifo_size_tracks_push_pop_balance() {
        let fifo = PacketFifo::new(5);
        let mut pushed = 0usize;
        let mut popped = 0usize;
        for round in 0..20usize {
            if fifo.push(vec![round as u8]).is_ok() {
                pushed += 1;
            }
            if round % 3 == 0 && fifo.pop().is_some() {
                popped += 1;
            }
            assert_eq!(fifo.len(), pushed - popped);
        }
    }
}
