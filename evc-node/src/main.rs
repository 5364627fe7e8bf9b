//! EVC Node - CLI for the EV charging network
//!
//! Runs the admission controller with its HTTP API, plus one charger agent per
//! registered charger and one car agent per car, all on an in-process bus.
//!
//! # Usage
//!
//! ```bash
//! # API on 127.0.0.1:8000 with two chargers (first one reservable) and car-A
//! evc-node serve
//!
//! # More chargers and cars
//! evc-node serve --chargers 4 --reservable 2 --car car-A --car car-B
//!
//! # Chargers reach the controller through its HTTP API
//! evc-node serve --server-url http://127.0.0.1:8000
//!
//! # Scripted session without HTTP
//! evc-node simulate --target 30
//! ```
//!
//! While `serve` runs, stdin accepts:
//!
//! - `nozzle <charger_id>` toggles the nozzle of a charger
//! - `fault <charger_id>` reports a hardware fault
//! - `partition` / `heal` cut and restore the message bus
//! - `status` prints every agent's state

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use evc_agents::{
    CarAgent, CarConfig, CarHandle, ChargerAgent, ChargerConfig, ChargerHandle, ChargerState,
    HttpControllerLink,
};
use evc_core::{BusConfig, ChargerId, MessageBus};
use evc_server::model::{NewCar, NewCharger};
use evc_server::{
    ActivateRequest, AdmissionConfig, AppState, MemoryStore, ServerConfig, Store, SystemClock,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// EV charging controller and simulated chargers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Topic prefix on the message bus
    #[arg(long, default_value = evc_core::bus::DEFAULT_PREFIX, global = true)]
    prefix: String,

    /// Number of chargers to register
    #[arg(long, default_value = "2", global = true)]
    chargers: u32,

    /// How many of the chargers are reservable
    #[arg(long, default_value = "1", global = true)]
    reservable: u32,

    /// Car ids to register (can be repeated)
    #[arg(long = "car", global = true)]
    cars: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and run the agents
    Serve {
        /// Address to bind the HTTP API to
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        bind: SocketAddr,

        /// Maximum session length in seconds
        #[arg(long, default_value = "1800")]
        max_session: u64,

        /// Controller API the chargers call; in-process when omitted
        #[arg(long)]
        server_url: Option<String>,
    },

    /// Run one charging session on a non-reservable charger and exit
    Simulate {
        /// Battery target in percent
        #[arg(short, long, default_value = "30")]
        target: i32,

        /// Maximum session length in seconds
        #[arg(long, default_value = "60")]
        max_session: u64,
    },
}

/// Controller, agents and the shared bus
struct Network {
    state: AppState,
    bus: MessageBus,
    chargers: BTreeMap<ChargerId, ChargerHandle>,
    cars: Vec<CarHandle>,
    plain_charger: Option<ChargerId>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.cars.is_empty() {
        args.cars.push("car-A".to_string());
    }

    match args.command {
        Command::Serve {
            bind,
            max_session,
            ref server_url,
        } => {
            let config = ServerConfig::default()
                .with_bind_addr(bind)
                .with_max_session_secs(max_session);
            print_banner("serve", &args, &bind.to_string(), server_url.as_deref());

            // Bind before the chargers start so an HTTP link can connect
            let listener = TcpListener::bind(config.bind_addr).await?;
            let network = build_network(&args, config.admission.clone(), server_url.as_deref())?;
            let server = evc_server::serve_listener(listener, network.state.clone());
            tokio::pin!(server);

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut stdin_open = true;
            loop {
                tokio::select! {
                    result = &mut server => {
                        result?;
                        break;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Node: Interrupted");
                        break;
                    }
                    line = lines.next_line(), if stdin_open => match line? {
                        Some(line) => network.console(&line),
                        None => stdin_open = false,
                    },
                }
            }

            network.shutdown().await;
        }

        Command::Simulate { target, max_session } => {
            print_banner("simulate", &args, "-", None);
            let admission = AdmissionConfig { max_session_secs: max_session };
            let network = build_network(&args, admission, None)?;
            simulate(&network, target).await?;
            network.shutdown().await;
        }
    }

    Ok(())
}

fn print_banner(mode: &str, args: &Args, bind: &str, server_url: Option<&str>) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             EVC Node - EV Charging Controller                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Mode:       {:<48} ║", mode);
    println!("║  Bind:       {:<48} ║", bind);
    println!("║  Prefix:     {:<48} ║", truncate(&args.prefix, 48));
    println!("║  Chargers:   {:<48} ║", format!("{} ({} reservable)", args.chargers, args.reservable));
    println!("║  Cars:       {:<48} ║", truncate(&args.cars.join(", "), 48));
    println!(
        "║  Link:       {:<48} ║",
        truncate(server_url.unwrap_or("in-process"), 48)
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Register entities and spawn one agent per charger and car
fn build_network(
    args: &Args,
    admission: AdmissionConfig,
    server_url: Option<&str>,
) -> Result<Network, Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let bus = MessageBus::new(BusConfig::default().with_prefix(&args.prefix));
    let state = AppState::new(store.clone(), bus.clone(), Arc::new(SystemClock), admission);
    let http_link = match server_url {
        Some(url) => Some(Arc::new(HttpControllerLink::new(url)?)),
        None => None,
    };

    let station = store.insert_station();
    let mut chargers = BTreeMap::new();
    let mut plain_charger = None;
    for n in 0..args.chargers {
        let charger = store.insert_charger(NewCharger {
            is_reservable: n < args.reservable,
            station_id: station.id,
        })?;
        if !charger.is_reservable && plain_charger.is_none() {
            plain_charger = Some(charger.id);
        }
        let config = ChargerConfig::new(charger.id);
        let handle = match &http_link {
            Some(link) => ChargerAgent::spawn(config, bus.clone(), link.clone()),
            None => ChargerAgent::spawn(config, bus.clone(), state.admission.clone()),
        };
        chargers.insert(charger.id, handle);
    }

    let mut cars = Vec::new();
    for car_id in &args.cars {
        store.insert_car(NewCar { id: car_id.as_str().into() })?;
        cars.push(CarAgent::spawn(CarConfig::new(car_id.as_str()), bus.clone()));
    }

    info!(
        "Node: Station {} with {} chargers and {} cars ready",
        station.id,
        chargers.len(),
        cars.len()
    );

    Ok(Network {
        state,
        bus,
        chargers,
        cars,
        plain_charger,
    })
}

impl Network {
    /// Handle one console line
    fn console(&self, line: &str) {
        let mut words = line.split_whitespace();
        let command = words.next();
        let target = words.next().and_then(|w| w.parse::<u32>().ok()).map(ChargerId);

        match (command, target) {
            (Some("nozzle"), Some(id)) => match self.chargers.get(&id) {
                Some(charger) if charger.snapshot().connected => charger.nozzle_disconnected(),
                Some(charger) => charger.nozzle_connected(),
                None => warn!("Node: No charger {}", id),
            },
            (Some("fault"), Some(id)) => match self.chargers.get(&id) {
                Some(charger) => charger.hardware_fault("reported from console"),
                None => warn!("Node: No charger {}", id),
            },
            (Some("partition"), _) => self.bus.partition(),
            (Some("heal"), _) => self.bus.heal(),
            (Some("status"), _) => self.print_status(),
            (None, _) => {}
            _ => warn!(
                "Node: Unknown command '{}' (nozzle <id> | fault <id> | partition | heal | status)",
                line.trim()
            ),
        }
    }

    fn print_status(&self) {
        for charger in self.chargers.values() {
            let s = charger.snapshot();
            let (car, target, current) = s.session_fields();
            println!(
                "charger {:>3}  {:<10} connected={:<5} car={:<8} {}/{}%",
                s.charger_id,
                format!("{:?}", s.state),
                s.connected,
                car.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                current,
                target
            );
        }
        for car in &self.cars {
            let s = car.snapshot();
            println!(
                "car {:<10} {:<10} battery={}%",
                s.car_id,
                format!("{:?}", s.state),
                s.battery
            );
        }
    }

    async fn shutdown(self) {
        for (_, charger) in self.chargers {
            charger.shutdown().await;
        }
        for car in self.cars {
            car.shutdown().await;
        }
        info!("Node: Shut down");
    }
}

/// Plug in, activate a plain charger and wait for the session to end
async fn simulate(network: &Network, target: i32) -> Result<(), Box<dyn std::error::Error>> {
    let charger_id = network
        .plain_charger
        .ok_or("simulate needs at least one non-reservable charger")?;
    let charger = network
        .chargers
        .get(&charger_id)
        .ok_or("charger agent missing")?;
    let car = network.cars.first().ok_or("no car registered")?;

    // Let agents finish their start-up
    tokio::time::sleep(Duration::from_millis(100)).await;

    charger.nozzle_connected();
    let mut watch = charger.watch();
    watch.wait_for(|s| s.state == ChargerState::Connected).await?;

    let granted = network
        .state
        .admission
        .activate(charger_id, ActivateRequest::new(car.car_id().as_str(), target))?;
    info!(
        "Node: Charger {} activated for {} (max {}s)",
        charger_id,
        car.car_id(),
        granted.max_charging_time
    );

    watch.wait_for(|s| s.state == ChargerState::Charging).await?;
    let ended = watch
        .wait_for(|s| s.state != ChargerState::Charging)
        .await?
        .clone();

    // Give the car a moment to process the stop
    tokio::time::sleep(Duration::from_millis(100)).await;
    network.print_status();

    if ended.state == ChargerState::Connected {
        info!("Node: Session finished, car at {}%", car.snapshot().battery);
    } else {
        warn!("Node: Session ended in {:?}", ended.state);
    }
    Ok(())
}

/// Truncate string with ellipsis, counting chars
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
