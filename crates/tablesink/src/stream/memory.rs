//! In-memory message source
//!
//! Replays a fixed script of deliveries and stream errors, recording acknowledgments.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Delivery, MessageSource};
use crate::error::{Result, SinkError};

/// One scripted fetch result
#[derive(Debug, Clone)]
pub enum Scripted {
    Message(Delivery),
    /// Simulated broker outage
    Unavailable(String),
}

/// Scripted source; cloned handles share the acknowledgment log
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    acked: Arc<Mutex<Vec<i64>>>,
    closed: Arc<Mutex<bool>>,
    next_offset: i64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a payload on partition 0 at the next offset
    pub fn push_payload(&mut self, payload: impl Into<Vec<u8>>) -> &mut Self {
        let delivery = Delivery {
            topic: "memory".to_string(),
            partition: 0,
            offset: self.next_offset,
            payload: Some(payload.into()),
        };
        self.next_offset += 1;
        self.push(Scripted::Message(delivery))
    }

    /// Queue a tombstone (no payload)
    pub fn push_tombstone(&mut self) -> &mut Self {
        let delivery = Delivery {
            topic: "memory".to_string(),
            partition: 0,
            offset: self.next_offset,
            payload: None,
        };
        self.next_offset += 1;
        self.push(Scripted::Message(delivery))
    }

    pub fn push_outage(&mut self, reason: impl Into<String>) -> &mut Self {
        self.push(Scripted::Unavailable(reason.into()))
    }

    fn push(&mut self, item: Scripted) -> &mut Self {
        lock(&self.script).push_back(item);
        self
    }

    /// Offsets acknowledged so far, in order
    pub fn acked(&self) -> Vec<i64> {
        lock(&self.acked).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match lock(&self.script).pop_front() {
            Some(Scripted::Message(delivery)) => Ok(Some(delivery)),
            Some(Scripted::Unavailable(reason)) => Err(SinkError::StreamUnavailable(reason)),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        lock(&self.acked).push(delivery.offset);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        *lock(&self.closed) = true;
        Ok(())
    }
}

// A poisoned lock only means another test thread panicked; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
