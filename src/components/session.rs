//! Measurement Session
//!
//! Drives one acquisition attempt end to end: scan, connect, subscribe,
//! collect frames until one is final, then disconnect. Every state change and
//! every absorbed problem is reported to the `EventSink` in order.
//!
//! Cancellation is cooperative: each suspension point races against the stop
//! signal and the overall deadline, and teardown runs regardless of how the
//! session ended.
use crate::api::events::EventSink;
use crate::api::transport::ScaleTransport;
use crate::core::config::SessionConfig;
use crate::core::constants::{BODY_COMPOSITION_MEASUREMENT_UUID, DISCONNECT_TIMEOUT};
use crate::core::errors::FailureKind;
use crate::core::events::{EventLevel, SessionEvent};
use crate::model::reading::{decode, Reading};
use crate::model::session::{SessionMachine, SessionOutcome, SessionState, Transition};
use crate::model::stability::{StabilityDetector, Verdict};
use btleplug::api::BDAddr;
use futures::StreamExt;
use log::{error, log, trace};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Requests cancellation of a running session.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by the driving task between suspension points.
#[derive(Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> (StopHandle, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (StopHandle { tx }, StopSignal { rx })
    }

    /// Resolves once a stop was requested.
    async fn requested(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // handle dropped without stopping
                futures::future::pending::<()>().await;
            }
        }
    }
}

enum Interrupt {
    Stopped,
    Failed(FailureKind),
}

/// Races `fut` against the stop signal and the overall deadline.
async fn guard<F: Future>(
    stop: &mut StopSignal,
    deadline: Instant,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = stop.requested() => Err(Interrupt::Stopped),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Failed(FailureKind::OverallTimeout)),
        out = fut => Ok(out),
    }
}

pub struct MeasurementSession<'a, T: ScaleTransport> {
    id: Uuid,
    transport: &'a T,
    target: Option<BDAddr>,
    address: Option<BDAddr>,
    config: SessionConfig,
    sink: &'a dyn EventSink,
    machine: SessionMachine,
    detector: StabilityDetector,
}

impl<'a, T: ScaleTransport> MeasurementSession<'a, T> {
    pub fn new(
        id: Uuid,
        transport: &'a T,
        target: Option<BDAddr>,
        config: SessionConfig,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            id,
            transport,
            target,
            address: target,
            config,
            sink,
            machine: SessionMachine::new(),
            detector: StabilityDetector::new(config.stabilization),
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Runs the session to a terminal state. Never fails: failures are part
    /// of the outcome.
    pub async fn run(mut self, mut stop: StopSignal) -> SessionOutcome {
        let deadline = Instant::now() + self.config.overall_timeout;
        let mut connection = None;
        let (outcome, input, message) = match self.drive(&mut connection, &mut stop, deadline).await {
            Ok(reading) => (
                SessionOutcome::Completed(reading),
                Transition::Settled,
                format!("stabilized at {}", reading),
            ),
            Err(Interrupt::Stopped) => (
                SessionOutcome::Cancelled,
                Transition::Stop,
                "measurement cancelled".to_owned(),
            ),
            Err(Interrupt::Failed(kind)) => {
                let message = format!("measurement failed: {}", kind);
                (SessionOutcome::Failed(kind), Transition::Fail, message)
            }
        };
        self.sink.outcome(&outcome);
        self.step(input, message);
        self.teardown(connection).await;
        outcome
    }

    async fn drive(
        &mut self,
        connection: &mut Option<T::Connection>,
        stop: &mut StopSignal,
        deadline: Instant,
    ) -> Result<Reading, Interrupt> {
        let transport = self.transport;
        let scanning = match self.target {
            Some(target) => format!("scanning for {}", target),
            None => "scanning for any body composition scale".to_owned(),
        };
        self.step(Transition::Start, scanning);
        let address = guard(stop, deadline, transport.scan(self.target, self.config.scan_timeout))
            .await?
            .map_err(|e| Interrupt::Failed(e.into()))?;
        self.address = Some(address);
        self.sink.device_found(address);

        self.step(Transition::DeviceFound, format!("found {}, connecting", address));
        let conn = guard(
            stop,
            deadline,
            transport.connect(address, self.config.connect_timeout),
        )
        .await?
        .map_err(|e| Interrupt::Failed(e.into()))?;
        let conn = connection.insert(conn);

        let mut frames = guard(
            stop,
            deadline,
            transport.subscribe(conn, BODY_COMPOSITION_MEASUREMENT_UUID),
        )
        .await?
        .map_err(|e| Interrupt::Failed(e.into()))?;
        self.step(Transition::Ready, "subscribed, step on the scale");

        loop {
            let frame = guard(stop, deadline, frames.next())
                .await?
                .ok_or(Interrupt::Failed(FailureKind::ConnectionLost))?;
            trace!("Frame {:02x?}", frame.bytes);
            match decode(&frame) {
                Ok(reading) => match self.detector.observe(&reading) {
                    Verdict::Settled => return Ok(reading),
                    Verdict::Pending { window, stable_for } => {
                        let message = progress_message(&reading, window, stable_for, &self.config);
                        self.step(Transition::Progress, message);
                    }
                },
                Err(e) => {
                    if let Err(illegal) = self.machine.apply(Transition::DecodeFailed) {
                        error!("{}", illegal);
                    }
                    self.emit(SessionEvent::new(
                        EventLevel::Warn,
                        format!("skipping frame: {}", e),
                    ));
                }
            }
        }
    }

    /// Best-effort disconnect. Problems are reported, never raised.
    async fn teardown(&mut self, connection: Option<T::Connection>) {
        let (Some(conn), Some(address)) = (connection, self.address) else {
            self.emit(SessionEvent::new(
                EventLevel::Debug,
                "disconnect skipped: no connection was open",
            ));
            return;
        };
        self.emit(SessionEvent::new(
            EventLevel::Info,
            format!("disconnecting from {}", address),
        ));
        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.transport.disconnect(&conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.emit(SessionEvent::new(EventLevel::Warn, e.to_string())),
            Err(_) => self.emit(SessionEvent::new(
                EventLevel::Warn,
                format!("disconnect timed out after {:?}", DISCONNECT_TIMEOUT),
            )),
        }
    }

    fn step(&mut self, input: Transition, message: impl Into<String>) {
        match self.machine.apply(input) {
            Ok(state) => self.emit(SessionEvent::transition(state, message)),
            Err(e) => {
                error!("{}", e);
                self.emit(SessionEvent::new(EventLevel::Error, e.to_string()));
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let level: log::Level = event.level.into();
        log!(level, "{}", event);
        self.sink.emit(event.with_session(self.id));
    }
}

fn progress_message(
    reading: &Reading,
    window: Option<(usize, usize)>,
    stable_for: Option<Duration>,
    config: &SessionConfig,
) -> String {
    use crate::core::config::StabilizationPolicy;
    match (window, stable_for, config.stabilization) {
        (Some((n, required)), Some(elapsed), StabilizationPolicy::Window { min_duration, .. }) => {
            format!(
                "stabilizing ({}/{} readings, stable for {:.1}/{:.1}s, weight: {:.2} kg)",
                n,
                required,
                elapsed.as_secs_f64(),
                min_duration.as_secs_f64(),
                reading.weight_kg()
            )
        }
        (Some((n, required)), _, _) => format!(
            "stabilizing ({}/{} readings, weight: {:.2} kg)",
            n,
            required,
            reading.weight_kg()
        ),
        _ => format!("weight {:.2} kg, waiting for the scale to settle", reading.weight_kg()),
    }
}
