//! Seam between the harness and a messaging client.
//!
//! The harness only ever talks to these traits; [`crate::memory::InMemoryBroker`]
//! is the implementation shipped with the crate.

use crate::error::ClientError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Queue,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    Transacted,
    Auto,
    Client,
    DupsOk,
}

/// How a topic consumer attaches to its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Plain,
    Durable { name: String },
    Shared { name: String, durable: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub persistent: bool,
    pub priority: u8,
    pub time_to_live: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: 4,
            time_to_live: Duration::ZERO,
        }
    }
}

pub trait Acknowledge: Send + Sync {
    fn acknowledge(&self) -> Result<(), ClientError>;
}

pub struct Message {
    body: Bytes,
    acker: Option<Arc<dyn Acknowledge>>,
}

impl Message {
    pub fn new(body: Bytes) -> Self {
        Self { body, acker: None }
    }

    pub fn with_acker(body: Bytes, acker: Arc<dyn Acknowledge>) -> Self {
        Self {
            body,
            acker: Some(acker),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Acknowledges this and every earlier message of the session.
    pub fn acknowledge(&self) -> Result<(), ClientError> {
        match &self.acker {
            Some(acker) => acker.acknowledge(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.body.len())
            .finish()
    }
}

/// Invoked on a client-owned delivery thread for every pushed message.
pub type DeliveryCallback = Box<dyn Fn(Message) + Send + Sync>;

pub trait MessagingClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect(
        &self,
        endpoint: &str,
        client_id: Option<&str>,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Connection>, ClientError>;
}

pub trait Connection: Send {
    fn create_session(
        &mut self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Box<dyn Session>, ClientError>;

    /// Starts push delivery to registered callbacks.
    fn start(&mut self) -> Result<(), ClientError>;

    /// Stops delivery threads and releases every session of the connection.
    fn close(&mut self) -> Result<(), ClientError>;
}

pub trait Session: Send {
    /// `None` creates an anonymous producer that names the destination per send.
    fn create_producer(
        &mut self,
        destination: Option<&Destination>,
    ) -> Result<Box<dyn Producer>, ClientError>;

    fn create_consumer(
        &mut self,
        destination: &Destination,
        subscription: &Subscription,
        selector: Option<&str>,
    ) -> Result<Box<dyn Consumer>, ClientError>;

    fn commit(&mut self) -> Result<(), ClientError>;
}

pub trait Producer: Send {
    fn send(
        &mut self,
        destination: Option<&Destination>,
        payload: Bytes,
        options: &SendOptions,
    ) -> Result<(), ClientError>;
}

pub trait Consumer: Send {
    /// `None` waits indefinitely.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Message>, ClientError>;

    fn receive_no_wait(&mut self) -> Result<Option<Message>, ClientError>;

    fn set_delivery_callback(&mut self, callback: DeliveryCallback) -> Result<(), ClientError>;
}
