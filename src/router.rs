//! The message-routing fabric connecting devices together.
//!
//! One `MessageRouter` owns a bounded FIFO per registered device. `send`
//! enqueues for the destination (or signals back-pressure); `fetch` dequeues
//! the caller's own queue. Two routers are used per system: one reserved
//! for `TileCmd`/`TileDone` traffic between the host and tiles, one shared
//! by every device for memory/PE traffic — this separates flow control for
//! the control plane from the data plane.

use std::collections::{HashMap, VecDeque};

use crate::clock::Clock;
use crate::device::DeviceId;
use crate::error::RouterError;
use crate::message::Message;

struct Queue {
    capacity: usize,
    messages: VecDeque<Message>,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::new(),
        }
    }

    fn push(&mut self, message: Message) -> bool {
        if self.messages.len() >= self.capacity {
            return false;
        }
        self.messages.push_back(message);
        true
    }

    fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }
}

/// A router between devices, each addressed by the [`DeviceId`] it was
/// issued at registration.
#[derive(Default)]
pub struct MessageRouter {
    queues: HashMap<DeviceId, Queue>,
    next_id: u32,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers a new device with the given inbound-queue capacity and
    /// returns the handle it must use to `send`/`fetch` from now on.
    pub fn add_connection(&mut self, queue_capacity: usize) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        self.queues.insert(id, Queue::new(queue_capacity));
        id
    }

    /// Enqueues `message` for `message.destination`.
    ///
    /// Returns `Ok(true)` if the message was enqueued, `Ok(false)` if the
    /// destination's queue is full (ordinary back-pressure — the caller
    /// should retry next tick), or `Err` if the destination was never
    /// registered (a fatal programming error, never a runtime condition).
    pub fn send(&mut self, mut message: Message, clock: &Clock) -> Result<bool, RouterError> {
        let queue = self
            .queues
            .get_mut(&message.destination)
            .ok_or(RouterError::UnregisteredDevice(message.destination))?;
        message.sent_clock = Some(clock.current());
        Ok(queue.push(message))
    }

    /// Dequeues the next message addressed to `device`, or `None` if its
    /// queue is empty.
    pub fn fetch(&mut self, device: DeviceId, clock: &Clock) -> Result<Option<Message>, RouterError> {
        let queue = self
            .queues
            .get_mut(&device)
            .ok_or(RouterError::UnregisteredDevice(device))?;
        let message = queue.pop();
        Ok(message.map(|mut m| {
            m.recv_clock = Some(clock.current());
            m
        }))
    }

    /// Number of messages presently queued for `device` (0 if unregistered).
    pub fn queue_depth(&self, device: DeviceId) -> usize {
        self.queues.get(&device).map_or(0, |q| q.messages.len())
    }
}
