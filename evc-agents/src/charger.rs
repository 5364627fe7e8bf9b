//! Charger agent
//!
//! ```text
//!            nozzle_connected            start_charging
//!   Idle ─────────────────────► Connected ─────────────► Charging
//!    ▲  ◄─────────────────────      ▲   ◄─────────────────  │
//!    │     nozzle_disconnected      │   battery_charged /   │
//!    │                              │   safety timeout      │
//!    └──────────────────────────────┼───────────────────────┘
//!    ▲                              nozzle_disconnected (abort)
//!    │ resolved
//!  Error ──── hardware fault ────► Halted
//! ```
//!
//! Every failing effect goes through [`ChargerAgent::fail`], which moves the
//! agent to `Error` and starts recovery outside the event loop. While in
//! `Error` the queue keeps draining and every other event is a no-op.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use evc_core::{
    BusError, CarCommand, CarId, ChargerCommand, ChargerId, ControllerLink, LinkError, MessageBus,
    Subscription, Topic,
};

use crate::config::ChargerConfig;
use crate::retry::RetryPolicy;
use crate::runtime::{TimerFired, Timers};

/// Charger agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargerState {
    Idle,
    Connected,
    Charging,
    Error,
    /// Terminal; reached only from `Error` on a hardware fault
    Halted,
}

/// Failure of a charger effect
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    #[error("Hardware fault: {0}")]
    Hardware(String),

    #[error("Internal failure: {0}")]
    Internal(String),
}

impl From<BusError> for Fault {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Unreachable => Fault::Connectivity(e.to_string()),
            BusError::Encode(_) => Fault::Internal(e.to_string()),
        }
    }
}

/// Active charging session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargingSession {
    pub id: Uuid,
    pub car_id: CarId,
    pub battery_target: u8,
    pub current_battery: u8,
    pub max_charging_time: Duration,
}

/// Observable charger state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargerSnapshot {
    pub charger_id: ChargerId,
    pub state: ChargerState,
    /// Nozzle plugged into a car
    pub connected: bool,
    pub session: Option<ChargingSession>,
    pub last_fault: Option<Fault>,
}

impl ChargerSnapshot {
    /// (car id, battery target, current battery); `(None, 0, 0)` without a session
    pub fn session_fields(&self) -> (Option<CarId>, u8, u8) {
        match &self.session {
            Some(s) => (Some(s.car_id.clone()), s.battery_target, s.current_battery),
            None => (None, 0, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ChargerTimer {
    HealthCheck,
    Safety,
}

#[derive(Debug)]
enum ChargerEvent {
    NozzleConnected,
    NozzleDisconnected,
    Command(ChargerCommand),
    Timer(TimerFired<ChargerTimer>),
    HardwareFault(String),
    Resolved,
    RecoveryFailed,
    Shutdown,
}

impl From<TimerFired<ChargerTimer>> for ChargerEvent {
    fn from(fired: TimerFired<ChargerTimer>) -> Self {
        ChargerEvent::Timer(fired)
    }
}

/// Handle to a running charger agent
pub struct ChargerHandle {
    charger_id: ChargerId,
    events: mpsc::UnboundedSender<ChargerEvent>,
    snapshot: watch::Receiver<ChargerSnapshot>,
    task: JoinHandle<()>,
}

impl ChargerHandle {
    pub fn charger_id(&self) -> ChargerId {
        self.charger_id
    }

    pub fn nozzle_connected(&self) {
        let _ = self.events.send(ChargerEvent::NozzleConnected);
    }

    pub fn nozzle_disconnected(&self) {
        let _ = self.events.send(ChargerEvent::NozzleDisconnected);
    }

    /// Report a hardware fault
    pub fn hardware_fault(&self, reason: impl Into<String>) {
        let _ = self.events.send(ChargerEvent::HardwareFault(reason.into()));
    }

    pub fn snapshot(&self) -> ChargerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChargerSnapshot> {
        self.snapshot.clone()
    }

    /// Stop the agent and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.events.send(ChargerEvent::Shutdown);
        let _ = self.task.await;
    }
}

pub struct ChargerAgent<L: ControllerLink> {
    config: ChargerConfig,
    bus: MessageBus,
    link: Arc<L>,
    state: ChargerState,
    connected: bool,
    session: Option<ChargingSession>,
    last_fault: Option<Fault>,
    events: mpsc::UnboundedSender<ChargerEvent>,
    timers: Timers<ChargerTimer, ChargerEvent>,
    recovery: Option<JoinHandle<()>>,
    snapshot: watch::Sender<ChargerSnapshot>,
}

impl<L: ControllerLink> ChargerAgent<L> {
    /// Subscribe to the charger topic and start the agent task
    pub fn spawn(config: ChargerConfig, bus: MessageBus, link: Arc<L>) -> ChargerHandle {
        let charger_id = config.charger_id;
        let (events, rx) = mpsc::unbounded_channel();

        let inbound = events.clone();
        let subscription = bus.subscribe(Topic::Charger(charger_id), move |delivery| {
            match ChargerCommand::from_bytes(&delivery.payload) {
                Ok(command) => {
                    let _ = inbound.send(ChargerEvent::Command(command));
                }
                Err(e) => debug!("Charger: Dropping malformed message on {}: {}", delivery.topic, e),
            }
        });

        let (snapshot_tx, snapshot_rx) = watch::channel(ChargerSnapshot {
            charger_id,
            state: ChargerState::Idle,
            connected: false,
            session: None,
            last_fault: None,
        });

        let agent = ChargerAgent {
            config,
            bus,
            link,
            state: ChargerState::Idle,
            connected: false,
            session: None,
            last_fault: None,
            events: events.clone(),
            timers: Timers::new(events.clone()),
            recovery: None,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(agent.run(rx, subscription));

        ChargerHandle {
            charger_id,
            events,
            snapshot: snapshot_rx,
            task,
        }
    }

    fn id(&self) -> ChargerId {
        self.config.charger_id
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ChargerEvent>, _subscription: Subscription) {
        info!("Charger {}: Started", self.id());

        // Reset the controller's view of this charger
        self.enter(ChargerState::Idle);
        if let Err(fault) = self.deactivate_at_controller().await {
            self.fail(fault);
        }
        self.publish_snapshot();

        while let Some(event) = rx.recv().await {
            if matches!(event, ChargerEvent::Shutdown) {
                break;
            }
            self.handle(event).await;
            self.publish_snapshot();
        }

        self.timers.cancel_all();
        if let Some(recovery) = self.recovery.take() {
            recovery.abort();
        }
        info!("Charger {}: Stopped", self.id());
    }

    async fn handle(&mut self, event: ChargerEvent) {
        use ChargerEvent as E;
        use ChargerState as S;

        if let E::Timer(fired) = &event {
            if !self.timers.accept(fired) {
                return;
            }
        }

        match (self.state, event) {
            (S::Idle, E::NozzleConnected) => {
                info!("Charger {}: Nozzle connected", self.id());
                self.connected = true;
                self.enter(S::Connected);
            }

            (S::Connected, E::NozzleDisconnected) => {
                info!("Charger {}: Nozzle disconnected", self.id());
                self.connected = false;
                self.enter(S::Idle);
            }

            (
                S::Connected,
                E::Command(ChargerCommand::StartCharging {
                    car_id,
                    battery_target,
                    max_charging_time,
                }),
            ) => {
                self.start_session(car_id, battery_target, max_charging_time);
            }

            (S::Idle, E::Command(ChargerCommand::StartCharging { car_id, .. })) => {
                warn!(
                    "Charger {}: start_charging for car {} without a connected nozzle, releasing",
                    self.id(),
                    car_id
                );
                if let Err(fault) = self.deactivate_at_controller().await {
                    self.fail(fault);
                }
            }

            (S::Idle | S::Connected, E::Timer(TimerFired { key: ChargerTimer::HealthCheck, .. })) => {
                self.health_check().await;
            }

            (S::Charging, E::Command(ChargerCommand::BatteryUpdate { percentage })) => {
                let reached = match self.session.as_mut() {
                    Some(session) => {
                        session.current_battery = percentage;
                        debug!(
                            "Charger {}: Session {} at {}% (target {}%)",
                            self.config.charger_id, session.id, percentage, session.battery_target
                        );
                        percentage >= session.battery_target
                    }
                    None => false,
                };
                if reached {
                    self.finish_session("battery charged", S::Connected).await;
                }
            }

            (S::Charging, E::Command(ChargerCommand::StopCharging)) => {
                self.finish_session("stop requested", S::Connected).await;
            }

            (S::Charging, E::Timer(TimerFired { key: ChargerTimer::Safety, .. })) => {
                self.finish_session("maximum charging time reached", S::Connected).await;
            }

            (S::Charging, E::NozzleDisconnected) => {
                self.connected = false;
                self.finish_session("nozzle disconnected", S::Idle).await;
            }

            (S::Idle | S::Connected | S::Charging, E::HardwareFault(reason)) => {
                self.fail(Fault::Hardware(reason));
            }

            (S::Error, E::HardwareFault(reason)) => {
                error!("Charger {}: Hardware fault while in error: {}", self.id(), reason);
                self.last_fault = Some(Fault::Hardware(reason));
                self.enter(S::Halted);
            }

            (S::Error, E::Resolved) => {
                info!("Charger {}: Recovered", self.id());
                self.recovery = None;
                self.last_fault = None;
                self.connected = false;
                self.enter(S::Idle);
            }

            (S::Error, E::RecoveryFailed) => {
                error!("Charger {}: Recovery gave up", self.id());
                self.recovery = None;
                self.enter(S::Halted);
            }

            (state, event) => {
                debug!("Charger {}: Ignoring {:?} in {:?}", self.id(), event, state);
            }
        }
    }

    /// Set the state and arm or cancel the health-check timer to match
    fn enter(&mut self, state: ChargerState) {
        if self.state != state {
            debug!("Charger {}: {:?} -> {:?}", self.id(), self.state, state);
        }
        self.state = state;

        match state {
            ChargerState::Idle => self
                .timers
                .start(ChargerTimer::HealthCheck, self.config.idle_health_interval),
            ChargerState::Connected => self
                .timers
                .start(ChargerTimer::HealthCheck, self.config.connected_health_interval),
            ChargerState::Charging | ChargerState::Error => {
                self.timers.cancel(ChargerTimer::HealthCheck)
            }
            ChargerState::Halted => {
                self.timers.cancel_all();
                if let Some(recovery) = self.recovery.take() {
                    recovery.abort();
                }
            }
        }
    }

    /// A zero `max_charging_time` arms an already-expired safety timer, so
    /// the session ends as soon as it has started
    fn start_session(&mut self, car_id: CarId, battery_target: u8, max_charging_time: u64) {
        let max_charging_time = Duration::from_secs(max_charging_time);
        let session = ChargingSession {
            id: Uuid::new_v4(),
            car_id,
            battery_target,
            current_battery: 0,
            max_charging_time,
        };

        info!(
            "Charger {}: Session {} started for car {} (target={}%, max={:?})",
            self.id(),
            session.id,
            session.car_id,
            session.battery_target,
            session.max_charging_time
        );

        let car_id = session.car_id.clone();
        self.session = Some(session);
        self.enter(ChargerState::Charging);
        self.timers.start(ChargerTimer::Safety, max_charging_time);

        let relay = CarCommand::StartCharging {
            charger_id: self.id(),
        };
        if let Err(e) = self.bus.publish_to_car(&car_id, &relay) {
            self.fail(e.into());
        }
    }

    /// Tell the car to stop, release the charger at the controller and
    /// reset the session
    async fn finish_session(&mut self, reason: &str, next: ChargerState) {
        self.timers.cancel(ChargerTimer::Safety);
        let Some(session) = self.session.take() else {
            self.enter(next);
            return;
        };

        info!(
            "Charger {}: Session {} for car {} ended at {}%: {}",
            self.id(),
            session.id,
            session.car_id,
            session.current_battery,
            reason
        );

        let result = match self.bus.publish_to_car(&session.car_id, &CarCommand::StopCharging) {
            Ok(_) => self.deactivate_at_controller().await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => self.enter(next),
            Err(fault) => self.fail(fault),
        }
    }

    async fn health_check(&mut self) {
        let result = self.link.ping().await;
        match result {
            Ok(()) => {
                debug!("Charger {}: Controller reachable", self.id());
                self.enter(self.state);
            }
            Err(e) if e.is_connectivity() => self.fail(Fault::Connectivity(e.to_string())),
            Err(e) => {
                warn!("Charger {}: Health check answered with error: {}", self.id(), e);
                self.enter(self.state);
            }
        }
    }

    /// A refusal from the controller is logged; only an unreachable
    /// controller is a fault
    async fn deactivate_at_controller(&self) -> Result<(), Fault> {
        match self.link.deactivate(self.id()).await {
            Ok(()) => {
                debug!("Charger {}: Released at controller", self.id());
                Ok(())
            }
            Err(e) if e.is_connectivity() => Err(Fault::Connectivity(e.to_string())),
            Err(e) => {
                warn!("Charger {}: Controller refused deactivate: {}", self.id(), e);
                Ok(())
            }
        }
    }

    /// Single entry into the error state
    fn fail(&mut self, fault: Fault) {
        error!("Charger {}: {} (in {:?})", self.id(), fault, self.state);

        self.timers.cancel(ChargerTimer::Safety);
        if let Some(session) = self.session.take() {
            if let Err(e) = self.bus.publish_to_car(&session.car_id, &CarCommand::StopCharging) {
                warn!(
                    "Charger {}: Could not stop car {} for session {}: {}",
                    self.id(),
                    session.car_id,
                    session.id,
                    e
                );
            }
        }

        self.enter(ChargerState::Error);
        self.last_fault = Some(fault.clone());

        if let Fault::Hardware(_) = fault {
            self.enter(ChargerState::Halted);
            return;
        }
        self.spawn_recovery(fault);
    }

    fn spawn_recovery(&mut self, fault: Fault) {
        if let Some(previous) = self.recovery.take() {
            previous.abort();
        }

        let events = self.events.clone();
        let link = self.link.clone();
        let charger_id = self.id();
        let policy = self.config.retry.clone();
        let pause = self.config.error_pause;

        self.recovery = Some(tokio::spawn(async move {
            let event = recover(fault, link, charger_id, policy, pause).await;
            let _ = events.send(event);
        }));
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(ChargerSnapshot {
            charger_id: self.id(),
            state: self.state,
            connected: self.connected,
            session: self.session.clone(),
            last_fault: self.last_fault.clone(),
        });
    }
}

/// Recovery work for one fault, run outside the event loop. Returns the
/// event that moves the charger out of `Error`.
async fn recover<L: ControllerLink>(
    fault: Fault,
    link: Arc<L>,
    charger_id: ChargerId,
    policy: RetryPolicy,
    pause: Duration,
) -> ChargerEvent {
    match fault {
        Fault::Connectivity(_) => {
            let released = policy
                .run("deactivate", |_| {
                    let link = link.clone();
                    async move {
                        match link.deactivate(charger_id).await {
                            Err(e) if e.is_connectivity() => Err(e),
                            // Any answer means the controller is back
                            _ => Ok::<(), LinkError>(()),
                        }
                    }
                })
                .await;
            match released {
                Ok(()) => ChargerEvent::Resolved,
                Err(_) => ChargerEvent::RecoveryFailed,
            }
        }
        Fault::Hardware(_) | Fault::Internal(_) => {
            tokio::time::sleep(pause).await;
            // The fault may have hit after an activation; release once
            match link.deactivate(charger_id).await {
                Ok(()) => debug!("Charger {}: Released at controller after fault", charger_id),
                Err(e) => warn!("Charger {}: Release after fault failed: {}", charger_id, e),
            }
            ChargerEvent::Resolved
        }
    }
}
