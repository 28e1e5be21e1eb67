//! Bluetooth Transport Module
//!
//! This module implements the `ScaleTransport` port on top of `btleplug`. It
//! handles device discovery by MAC address, connection management and the
//! notification subscription of the body composition characteristic.
use crate::api::transport::{AdapterDiscovery, DisplayName, FrameStream, ScaleTransport};
use crate::core::constants::BODY_COMPOSITION_SERVICE_UUID;
use crate::core::errors::{
    ConnectError, ConnectFailure, DisconnectError, ScanError, SubscribeError,
};
use crate::model::reading::Frame;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Manager as _, Peripheral, ScanFilter,
};
use btleplug::platform::{Adapter, Manager};
use futures::{future, StreamExt};
use log::{debug, info, trace, warn};
use std::time::Duration;
use uuid::Uuid;

/// Talks to the scale through a single BLE adapter.
///
/// # Type Parameters
/// - `A`: Bluetooth adapter type; `btleplug::platform::Adapter` outside of tests.
#[derive(Debug, Clone)]
pub struct BluetoothTransport<A: Central> {
    adapter: A,
}

impl<A: Central> BluetoothTransport<A> {
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    async fn find_peripheral(&self, address: BDAddr) -> btleplug::Result<Option<A::Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == address))
    }

    /// Resolves with the address of the first matching advertisement seen
    /// during this scan. Peripherals the adapter merely remembers do not count.
    async fn wait_for_device(&self, target: Option<BDAddr>) -> btleplug::Result<BDAddr> {
        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![BODY_COMPOSITION_SERVICE_UUID],
            })
            .await?;
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
                let peripheral = self.adapter.peripheral(&id).await?;
                trace!("Advertisement from {}", peripheral.address());
                if is_scale(&peripheral, target).await? {
                    return Ok(peripheral.address());
                }
            }
        }
        Err(btleplug::Error::RuntimeError(
            "adapter event stream ended".to_owned(),
        ))
    }
}

/// Whether an advertising peripheral is the scale we are looking for.
async fn is_scale<P: Peripheral>(peripheral: &P, target: Option<BDAddr>) -> btleplug::Result<bool> {
    match target {
        Some(address) => Ok(peripheral.address() == address),
        None => Ok(peripheral
            .properties()
            .await?
            .is_some_and(|p| p.services.contains(&BODY_COMPOSITION_SERVICE_UUID))),
    }
}

impl BluetoothTransport<Adapter> {
    /// Uses the first adapter reported by the platform.
    pub async fn first_adapter() -> Result<Self> {
        let adapter = Adapter::discover_adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(anyhow!("No Bluetooth adapter found"))?;
        info!("Using Bluetooth adapter {}.", adapter.get_name().await?);
        Ok(Self::new(adapter))
    }
}

fn connect_error(e: btleplug::Error) -> ConnectError {
    let reason = match &e {
        btleplug::Error::DeviceNotFound | btleplug::Error::NotConnected => {
            ConnectFailure::Unreachable
        }
        btleplug::Error::TimedOut(_) => ConnectFailure::Timeout,
        _ => ConnectFailure::Rejected,
    };
    ConnectError::new(reason, e.to_string())
}

#[async_trait]
impl<A> ScaleTransport for BluetoothTransport<A>
where
    A: Central + 'static,
    A::Peripheral: 'static,
{
    type Connection = A::Peripheral;

    async fn scan(&self, target: Option<BDAddr>, timeout: Duration) -> Result<BDAddr, ScanError> {
        match target {
            Some(address) => debug!("Scanning for {} (timeout {:?}).", address, timeout),
            None => debug!("Scanning for any body composition scale (timeout {:?}).", timeout),
        }
        let found = tokio::time::timeout(timeout, self.wait_for_device(target)).await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Could not stop scan: {}", e);
        }
        match found {
            Ok(Ok(address)) => {
                info!("Found scale {}.", address);
                Ok(address)
            }
            Ok(Err(e)) => Err(ScanError::Adapter(e.to_string())),
            Err(_) => Err(ScanError::Timeout(timeout)),
        }
    }

    async fn connect(
        &self,
        address: BDAddr,
        timeout: Duration,
    ) -> Result<A::Peripheral, ConnectError> {
        let peripheral = self
            .find_peripheral(address)
            .await
            .map_err(connect_error)?
            .ok_or_else(|| ConnectError::new(ConnectFailure::Unreachable, "peripheral not found"))?;

        let handshake = async {
            peripheral.connect().await.map_err(connect_error)?;
            peripheral
                .discover_services()
                .await
                .map_err(|e| ConnectError::new(ConnectFailure::Rejected, e.to_string()))
        };
        let result = match tokio::time::timeout(timeout, handshake).await {
            Err(_) => Err(ConnectError::new(
                ConnectFailure::Timeout,
                format!("no response within {:?}", timeout),
            )),
            Ok(result) => result,
        };
        if let Err(e) = result {
            // a half-open link is never handed out, release it here
            if let Err(de) = peripheral.disconnect().await {
                debug!("Cleanup after failed connect: {}", de);
            }
            return Err(e);
        }
        debug!("Connected to {}.", address);
        Ok(peripheral)
    }

    async fn subscribe(
        &self,
        connection: &A::Peripheral,
        characteristic: Uuid,
    ) -> Result<FrameStream, SubscribeError> {
        let char = connection
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or(SubscribeError::MissingCharacteristic(characteristic))?;

        let notifications = connection
            .notifications()
            .await
            .map_err(|e| SubscribeError::Transport(e.to_string()))?;
        connection
            .subscribe(&char)
            .await
            .map_err(|e| SubscribeError::Transport(e.to_string()))?;
        debug!("Subscribed to {}.", characteristic);

        Ok(Box::pin(notifications.filter_map(move |n| {
            future::ready((n.uuid == characteristic).then(|| Frame::now(n.value)))
        })))
    }

    async fn disconnect(&self, connection: &A::Peripheral) -> Result<(), DisconnectError> {
        let connected = connection
            .is_connected()
            .await
            .map_err(|e| DisconnectError(e.to_string()))?;
        if connected {
            connection
                .disconnect()
                .await
                .map_err(|e| DisconnectError(e.to_string()))?;
            debug!("Disconnected from {}.", connection.address());
        }
        Ok(())
    }
}

#[async_trait]
impl DisplayName for Adapter {
    async fn get_name(&self) -> Result<String> {
        Ok(self.adapter_info().await?)
    }
}

#[async_trait]
impl AdapterDiscovery for Adapter {
    async fn discover_adapters() -> Result<Vec<Adapter>> {
        let manager = Manager::new().await?;
        Ok(manager.adapters().await?)
    }
}
