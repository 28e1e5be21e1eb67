//! Simulated Transport
//!
//! A scripted `ScaleTransport` standing in for the radio. It backs the
//! `mock` feature of the binary and the session tests, and records every
//! transport call so teardown behaviour can be asserted.
use crate::api::transport::{FrameStream, ScaleTransport};
use crate::core::errors::{
    ConnectError, ConnectFailure, DisconnectError, ScanError, SubscribeError,
};
use crate::model::reading::{encode_frame, Frame};
use async_trait::async_trait;
use btleplug::api::BDAddr;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// A transport operation, as recorded by `SimulatedTransport`.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    Scan(Option<BDAddr>),
    Connect(BDAddr),
    Subscribe(Uuid),
    /// The n-th frame (zero based) was handed to the session.
    Frame(usize),
    Disconnect,
}

/// Script of how the simulated scale behaves.
#[derive(Clone, Debug)]
pub struct SimulatedScale {
    pub address: BDAddr,
    /// `None` keeps the scale silent so every scan times out.
    pub advertise_after: Option<Duration>,
    pub connect: Result<Duration, ConnectFailure>,
    pub subscribe: Result<(), String>,
    /// Raw notifications, each preceded by its delay.
    pub frames: Vec<(Duration, Vec<u8>)>,
    /// Keep the notification stream open after the last frame.
    pub keep_open: bool,
    pub disconnect_after: Duration,
}

impl SimulatedScale {
    pub fn new(address: BDAddr) -> Self {
        Self {
            address,
            advertise_after: Some(Duration::from_millis(200)),
            connect: Ok(Duration::from_millis(100)),
            subscribe: Ok(()),
            frames: Vec::new(),
            keep_open: true,
            disconnect_after: Duration::ZERO,
        }
    }

    /// A person stepping on the scale: the weight climbs towards `weight_kg`
    /// and the last frame is stabilized with an impedance value.
    pub fn stepping_on(address: BDAddr, weight_kg: f64) -> Self {
        let mut frames: Vec<(Duration, Vec<u8>)> = [0.4, 0.8, 0.95, 0.99]
            .iter()
            .map(|f| (Duration::from_millis(500), encode_frame(weight_kg * f, None, false)))
            .collect();
        frames.push((
            Duration::from_millis(500),
            encode_frame(weight_kg, Some(512), true),
        ));
        Self::new(address).with_frames(frames)
    }

    pub fn silent(mut self) -> Self {
        self.advertise_after = None;
        self
    }

    pub fn with_frames(mut self, frames: Vec<(Duration, Vec<u8>)>) -> Self {
        self.frames = frames;
        self
    }

    pub fn refusing_connection(mut self, reason: ConnectFailure) -> Self {
        self.connect = Err(reason);
        self
    }

    pub fn closing_after_frames(mut self) -> Self {
        self.keep_open = false;
        self
    }

    pub fn refusing_subscription(mut self, detail: impl Into<String>) -> Self {
        self.subscribe = Err(detail.into());
        self
    }

    pub fn slow_to_disconnect(mut self, delay: Duration) -> Self {
        self.disconnect_after = delay;
        self
    }
}

#[derive(Debug)]
pub struct SimulatedConnection {
    connected: Arc<AtomicBool>,
}

impl SimulatedConnection {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    scale: SimulatedScale,
    calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl SimulatedTransport {
    pub fn new(scale: SimulatedScale) -> Self {
        Self {
            scale,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every transport operation performed so far, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(calls: &Mutex<Vec<TransportCall>>, call: TransportCall) {
        calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

#[async_trait]
impl ScaleTransport for SimulatedTransport {
    type Connection = SimulatedConnection;

    async fn scan(&self, target: Option<BDAddr>, timeout: Duration) -> Result<BDAddr, ScanError> {
        Self::record(&self.calls, TransportCall::Scan(target));
        let wanted = target.map_or(true, |address| address == self.scale.address);
        match self.scale.advertise_after {
            Some(delay) if wanted && delay <= timeout => {
                tokio::time::sleep(delay).await;
                Ok(self.scale.address)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(ScanError::Timeout(timeout))
            }
        }
    }

    async fn connect(
        &self,
        address: BDAddr,
        timeout: Duration,
    ) -> Result<SimulatedConnection, ConnectError> {
        Self::record(&self.calls, TransportCall::Connect(address));
        match self.scale.connect {
            Ok(delay) if delay <= timeout => {
                tokio::time::sleep(delay).await;
                Ok(SimulatedConnection {
                    connected: Arc::new(AtomicBool::new(true)),
                })
            }
            Ok(_) => {
                tokio::time::sleep(timeout).await;
                Err(ConnectError::new(ConnectFailure::Timeout, "simulated"))
            }
            Err(reason) => Err(ConnectError::new(reason, "simulated")),
        }
    }

    async fn subscribe(
        &self,
        connection: &SimulatedConnection,
        characteristic: Uuid,
    ) -> Result<FrameStream, SubscribeError> {
        Self::record(&self.calls, TransportCall::Subscribe(characteristic));
        self.scale
            .subscribe
            .clone()
            .map_err(SubscribeError::Transport)?;

        let calls = self.calls.clone();
        let connected = connection.connected.clone();
        let frames = stream::iter(self.scale.frames.clone().into_iter().enumerate())
            .then(move |(idx, (delay, bytes))| {
                let calls = calls.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    Self::record(&calls, TransportCall::Frame(idx));
                    Frame::now(bytes)
                }
            })
            .take_while(move |_| futures::future::ready(connected.load(Ordering::SeqCst)));
        if self.scale.keep_open {
            Ok(Box::pin(frames.chain(stream::pending())))
        } else {
            Ok(Box::pin(frames))
        }
    }

    async fn disconnect(&self, connection: &SimulatedConnection) -> Result<(), DisconnectError> {
        Self::record(&self.calls, TransportCall::Disconnect);
        tokio::time::sleep(self.scale.disconnect_after).await;
        connection.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
