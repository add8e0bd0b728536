//! The transport capability set the session depends on.
//!
//! [`crate::ble::BleTransport`] implements it on top of btleplug; tests drive
//! the session through an in-memory implementation instead.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// One advertisement seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: Option<String>,
    /// Identifier later passed to [`Transport::open`].
    pub address: String,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// Events pushed by an open link into the session's notification queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A GATT notification on a subscribed characteristic.
    Notification { characteristic: Uuid, value: Vec<u8> },
    /// The peripheral dropped the link without being asked to.
    Disconnected,
}

/// Device discovery and connection establishment.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Listen for advertisements for `window` and return everything seen.
    async fn discover(&self, window: Duration) -> Result<Vec<Advertisement>, TransportError>;

    /// Open a GATT connection to `address`.
    ///
    /// Notifications for subscribed characteristics and an unsolicited
    /// disconnect are delivered through `events`.  Implementations must not
    /// block when the queue is full: notifications may be dropped, but
    /// [`LinkEvent::Disconnected`] must eventually be delivered.
    async fn open(
        &self,
        address: &str,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn Link>, TransportError>;
}

/// An open connection to one peripheral.
#[async_trait]
pub trait Link: Send + Sync {
    /// Acknowledged (with-response) characteristic write.
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    /// Close the connection.  Dropping a link without calling this leaves the
    /// peripheral connection to the platform stack.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
