//! Transport Module
//!
//! This module defines the asynchronous BLE transport used by the measurement
//! session: find the scale, open a GATT link, subscribe to notifications and
//! disconnect. Implementations touch a physical radio; every operation may
//! fail or stall, which is why scanning is bounded by a timeout and all other
//! waits are bounded by the session.
use crate::core::errors::{ConnectError, DisconnectError, ScanError, SubscribeError};
use crate::model::reading::Frame;
use anyhow::Result;
use async_trait::async_trait;
use btleplug::api::BDAddr;
use futures::stream::Stream;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Lazy, non-restartable sequence of notification frames. It ends when the
/// link drops or the subscription is released.
pub type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// ScaleTransport trait
///
/// Wraps the platform BLE primitives behind an async interface.
#[async_trait]
pub trait ScaleTransport: Send + Sync + 'static {
    /// Open GATT link to the scale.
    type Connection: Send + Sync + 'static;

    /// Scan until the scale advertises and return its address.
    ///
    /// # Arguments
    ///
    /// * `target` - MAC address of the scale. `None` accepts the first device
    ///   advertising the body composition service.
    /// * `timeout` - Upper bound for the scan; exceeding it yields `ScanError::Timeout`.
    async fn scan(&self, target: Option<BDAddr>, timeout: Duration) -> Result<BDAddr, ScanError>;

    /// Open a GATT connection to a previously scanned device.
    async fn connect(
        &self,
        address: BDAddr,
        timeout: Duration,
    ) -> Result<Self::Connection, ConnectError>;

    /// Register for notifications on `characteristic`.
    async fn subscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<FrameStream, SubscribeError>;

    /// Release the link. Idempotent; calling it on a closed link succeeds.
    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), DisconnectError>;
}

/// AdapterDiscovery trait
///
/// Retrieves the BLE adapters present on the host.
#[async_trait]
pub trait AdapterDiscovery: Sized {
    async fn discover_adapters() -> Result<Vec<Self>>;
}

/// DisplayName trait
///
/// Human readable name of an adapter or peripheral.
#[async_trait]
pub trait DisplayName {
    async fn get_name(&self) -> Result<String>;
}
