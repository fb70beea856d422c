//! Bounded event queue between a port's receive path and its poll path.
//!
//! Backed by an SPSC ring buffer. When full, `add` fails and the newest
//! message is dropped; queued messages are never overwritten.

use crate::Message;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Single-owner FIFO. Use [`EventQueue::split`] when the producer lives on another thread.
pub struct EventQueue {
    producer: QueueProducer,
    consumer: QueueConsumer,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = Self::channel(capacity);
        Self { producer, consumer }
    }

    /// Producer/consumer halves for a callback thread and a poll thread.
    pub fn channel(capacity: usize) -> (QueueProducer, QueueConsumer) {
        let rb = HeapRb::<Message>::new(capacity.max(1));
        let (producer, consumer) = rb.split();
        (
            QueueProducer {
                inner: producer,
                dropped: 0,
            },
            QueueConsumer { inner: consumer },
        )
    }

    pub fn split(self) -> (QueueProducer, QueueConsumer) {
        (self.producer, self.consumer)
    }

    /// Returns false (and drops `msg`) when the queue is full.
    #[inline]
    pub fn add(&mut self, msg: Message) -> bool {
        self.producer.push(msg)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Message> {
        self.consumer.pop()
    }

    pub fn front(&self) -> Option<&Message> {
        self.consumer.front()
    }

    pub fn count(&self) -> usize {
        self.consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.producer.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity()
    }

    pub fn clear(&mut self) {
        while self.consumer.pop().is_some() {}
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("count", &self.count())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Write half, owned by whichever thread receives from the native subsystem.
pub struct QueueProducer {
    inner: HeapProd<Message>,
    dropped: u64,
}

impl QueueProducer {
    #[inline]
    pub fn push(&mut self, msg: Message) -> bool {
        if self.inner.try_push(msg).is_ok() {
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    /// Messages rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Read half, owned by the bus that polls.
pub struct QueueConsumer {
    inner: HeapCons<Message>,
}

impl QueueConsumer {
    #[inline]
    pub fn pop(&mut self) -> Option<Message> {
        self.inner.try_pop()
    }

    pub fn front(&self) -> Option<&Message> {
        self.inner.iter().next()
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }
}
