//! Car agent
//!
//! Listens on its car topic. `start_charging` starts a periodic battery
//! update towards the named charger; `stop_charging` ends the session and the
//! battery keeps its last value. The battery never goes down and stays at or
//! below [`BATTERY_CAP`].

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use evc_core::{CarCommand, CarId, ChargerCommand, ChargerId, MessageBus, Subscription, Topic};

use crate::config::{CarConfig, BATTERY_CAP};
use crate::runtime::{TimerFired, Timers};

/// Car agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarState {
    Idle,
    Charging,
}

/// Observable car state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarSnapshot {
    pub car_id: CarId,
    pub state: CarState,
    pub battery: u8,
    /// Charger of the current session
    pub charger_id: Option<ChargerId>,
}

/// Battery level after one update
pub fn next_battery(current: u8, step: u8) -> u8 {
    current.saturating_add(step).min(BATTERY_CAP).max(current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CarTimer {
    Update,
}

#[derive(Debug)]
enum CarEvent {
    Command(CarCommand),
    Timer(TimerFired<CarTimer>),
    Shutdown,
}

impl From<TimerFired<CarTimer>> for CarEvent {
    fn from(fired: TimerFired<CarTimer>) -> Self {
        CarEvent::Timer(fired)
    }
}

/// Handle to a running car agent
pub struct CarHandle {
    car_id: CarId,
    events: mpsc::UnboundedSender<CarEvent>,
    snapshot: watch::Receiver<CarSnapshot>,
    task: JoinHandle<()>,
}

impl CarHandle {
    pub fn car_id(&self) -> &CarId {
        &self.car_id
    }

    pub fn snapshot(&self) -> CarSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CarSnapshot> {
        self.snapshot.clone()
    }

    /// Stop the agent and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.events.send(CarEvent::Shutdown);
        let _ = self.task.await;
    }
}

pub struct CarAgent {
    config: CarConfig,
    bus: MessageBus,
    state: CarState,
    battery: u8,
    charger_id: Option<ChargerId>,
    timers: Timers<CarTimer, CarEvent>,
    snapshot: watch::Sender<CarSnapshot>,
}

impl CarAgent {
    /// Subscribe to the car topic and start the agent task
    pub fn spawn(config: CarConfig, bus: MessageBus) -> CarHandle {
        let (events, rx) = mpsc::unbounded_channel();

        let inbound = events.clone();
        let subscription = bus.subscribe(Topic::Car(config.car_id.clone()), move |delivery| {
            match CarCommand::from_bytes(&delivery.payload) {
                Ok(command) => {
                    let _ = inbound.send(CarEvent::Command(command));
                }
                Err(e) => debug!("Car: Dropping malformed message on {}: {}", delivery.topic, e),
            }
        });

        let initial = CarSnapshot {
            car_id: config.car_id.clone(),
            state: CarState::Idle,
            battery: config.initial_battery,
            charger_id: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let agent = CarAgent {
            battery: config.initial_battery,
            config,
            bus,
            state: CarState::Idle,
            charger_id: None,
            timers: Timers::new(events.clone()),
            snapshot: snapshot_tx,
        };
        let car_id = agent.config.car_id.clone();
        let task = tokio::spawn(agent.run(rx, subscription));

        CarHandle {
            car_id,
            events,
            snapshot: snapshot_rx,
            task,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CarEvent>, _subscription: Subscription) {
        info!("Car {}: Started with battery {}%", self.config.car_id, self.battery);

        while let Some(event) = rx.recv().await {
            if matches!(event, CarEvent::Shutdown) {
                break;
            }
            self.handle(event);
            self.snapshot.send_replace(self.snapshot());
        }

        self.timers.cancel_all();
        info!("Car {}: Stopped", self.config.car_id);
    }

    fn handle(&mut self, event: CarEvent) {
        match (self.state, event) {
            (CarState::Idle, CarEvent::Command(CarCommand::StartCharging { charger_id })) => {
                info!("Car {}: Charging at charger {}", self.config.car_id, charger_id);
                self.charger_id = Some(charger_id);
                self.state = CarState::Charging;
                self.timers.start(CarTimer::Update, self.config.update_interval);
            }

            (CarState::Charging, CarEvent::Timer(fired)) => {
                if self.timers.accept(&fired) {
                    self.tick();
                }
            }

            (CarState::Charging, CarEvent::Command(CarCommand::StopCharging)) => {
                info!(
                    "Car {}: Charging stopped at {}%",
                    self.config.car_id, self.battery
                );
                self.timers.cancel(CarTimer::Update);
                self.charger_id = None;
                self.state = CarState::Idle;
            }

            (state, event) => {
                debug!("Car {}: Ignoring {:?} in {:?}", self.config.car_id, event, state);
            }
        }
    }

    fn tick(&mut self) {
        self.battery = next_battery(self.battery, self.config.step);

        if let Some(charger_id) = self.charger_id {
            let update = ChargerCommand::BatteryUpdate {
                percentage: self.battery,
            };
            if let Err(e) = self.bus.publish_to_charger(charger_id, &update) {
                warn!("Car {}: Failed to report battery: {}", self.config.car_id, e);
            } else {
                debug!("Car {}: Battery {}%", self.config.car_id, self.battery);
            }
        }

        self.timers.start(CarTimer::Update, self.config.update_interval);
    }

    fn snapshot(&self) -> CarSnapshot {
        CarSnapshot {
            car_id: self.config.car_id.clone(),
            state: self.state,
            battery: self.battery,
            charger_id: self.charger_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evc_core::Delivery;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn battery_reports(bus: &MessageBus, charger: ChargerId) -> (Arc<Mutex<Vec<u8>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe(Topic::Charger(charger), move |d: Delivery| {
            if let Ok(ChargerCommand::BatteryUpdate { percentage }) = ChargerCommand::from_bytes(&d.payload) {
                sink.lock().push(percentage);
            }
        });
        (seen, sub)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_next_battery() {
        assert_eq!(next_battery(10, 2), 12);
        assert_eq!(next_battery(97, 2), 98);
        assert_eq!(next_battery(98, 2), 98);
        assert_eq!(next_battery(99, 2), 99);
        assert_eq!(next_battery(250, 10), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_charging_reports_every_interval() {
        let bus = MessageBus::default();
        let (reports, _sub) = battery_reports(&bus, ChargerId(1));
        let car = CarAgent::spawn(CarConfig::new("car-A"), bus.clone());

        bus.publish_to_car(car.car_id(), &CarCommand::StartCharging { charger_id: ChargerId(1) })
            .unwrap();
        settle().await;
        assert_eq!(car.snapshot().state, CarState::Charging);
        assert_eq!(car.snapshot().charger_id, Some(ChargerId(1)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*reports.lock(), vec![12, 14, 16]);

        bus.publish_to_car(car.car_id(), &CarCommand::StopCharging).unwrap();
        settle().await;
        let snapshot = car.snapshot();
        assert_eq!(snapshot.state, CarState::Idle);
        assert_eq!(snapshot.battery, 16);
        assert_eq!(snapshot.charger_id, None);

        // No more updates after stop
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(reports.lock().len(), 3);

        car.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_never_exceeds_cap() {
        let bus = MessageBus::default();
        let (reports, _sub) = battery_reports(&bus, ChargerId(2));
        let car = CarAgent::spawn(CarConfig::new("car-B").with_initial_battery(90), bus.clone());

        bus.publish_to_car(car.car_id(), &CarCommand::StartCharging { charger_id: ChargerId(2) })
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let reports = reports.lock().clone();
        assert!(reports.len() >= 10);
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert!(reports.iter().all(|p| *p <= BATTERY_CAP));
        assert_eq!(*reports.last().unwrap(), BATTERY_CAP);

        car.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_unmatched_commands_ignored() {
        let bus = MessageBus::default();
        let car = CarAgent::spawn(CarConfig::new("car-C"), bus.clone());
        let topic = Topic::Car(CarId::new("car-C"));

        bus.publish_raw(&topic, b"{not json".to_vec()).unwrap();
        bus.publish_raw(&topic, br#"{"command":"battery_update","percentage":3}"#.to_vec())
            .unwrap();
        bus.publish_to_car(car.car_id(), &CarCommand::StopCharging).unwrap();
        settle().await;

        let snapshot = car.snapshot();
        assert_eq!(snapshot.state, CarState::Idle);
        assert_eq!(snapshot.battery, 10);

        car.shutdown().await;
        assert_eq!(bus.subscriber_count(&topic), 0);
    }
}
