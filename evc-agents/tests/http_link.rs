//! Charger to controller over the real HTTP API on an ephemeral port

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use evc_agents::*;
use evc_core::{ChargerCommand, ChargerId, ControllerLink, ErrorKind, LinkError, MessageBus};
use evc_server::model::{NewCar, NewCharger};
use evc_server::*;
use tokio::net::TcpListener;

struct Controller {
    state: AppState,
    store: Arc<MemoryStore>,
    bus: MessageBus,
    charger_id: ChargerId,
    url: String,
}

async fn controller() -> Controller {
    let store = Arc::new(MemoryStore::new());
    store.insert_car(NewCar { id: "car-A".into() }).unwrap();
    let station = store.insert_station();
    let charger_id = store
        .insert_charger(NewCharger { is_reservable: false, station_id: station.id })
        .unwrap()
        .id;

    let bus = MessageBus::default();
    let state = AppState::new(store.clone(), bus.clone(), Arc::new(SystemClock), AdmissionConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_listener(listener, state.clone()));

    Controller {
        state,
        store,
        bus,
        charger_id,
        url: format!("http://{}", addr),
    }
}

/// Address nothing listens on
async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn available(c: &Controller) -> bool {
    c.store.charger(c.charger_id).unwrap().is_available
}

#[tokio::test]
async fn test_ping_reaches_hello() {
    let c = controller().await;
    let link = HttpControllerLink::new(&c.url).unwrap();
    assert_eq!(link.ping().await, Ok(()));
}

#[tokio::test]
async fn test_deactivate_maps_statuses() {
    let c = controller().await;
    let link = HttpControllerLink::new(c.url.clone()).unwrap();

    let err = link.deactivate(c.charger_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(!err.is_connectivity());
    assert!(matches!(&err, LinkError::Rejected { reason, .. } if reason.contains("currently available")));

    let err = link.deactivate(ChargerId(99)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    c.state
        .admission
        .activate(c.charger_id, ActivateRequest::new("car-A", 80))
        .unwrap();
    assert!(!available(&c));
    assert_eq!(link.deactivate(c.charger_id).await, Ok(()));
    assert!(available(&c));
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let addr = closed_addr().await;
    let link = HttpControllerLink::with_timeout(format!("http://{}", addr), Duration::from_millis(500)).unwrap();

    let err = link.ping().await.unwrap_err();
    assert!(err.is_connectivity(), "{}", err);
    assert_eq!(err.kind(), ErrorKind::Connectivity);

    let err = link.deactivate(ChargerId(1)).await.unwrap_err();
    assert!(err.is_connectivity(), "{}", err);
}

#[tokio::test]
async fn test_charger_session_released_over_http() {
    let c = controller().await;
    let link = Arc::new(HttpControllerLink::new(c.url.clone()).unwrap());
    let charger = ChargerAgent::spawn(ChargerConfig::new(c.charger_id), c.bus.clone(), link);
    let mut watch = charger.watch();

    charger.nozzle_connected();
    tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| s.state == ChargerState::Connected))
        .await
        .expect("charger never connected")
        .unwrap();

    c.state
        .admission
        .activate(c.charger_id, ActivateRequest::new("car-A", 20))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| s.state == ChargerState::Charging))
        .await
        .expect("charger never started")
        .unwrap();

    c.bus
        .publish_to_charger(c.charger_id, &ChargerCommand::BatteryUpdate { percentage: 20 })
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        watch.wait_for(|s| s.state == ChargerState::Connected && s.session.is_none()),
    )
    .await
    .expect("session never finished")
    .unwrap();

    assert!(available(&c));
    assert_eq!(charger.snapshot().last_fault, None);
    charger.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_controller_enters_error() {
    let addr = closed_addr().await;
    let link = Arc::new(
        HttpControllerLink::with_timeout(format!("http://{}", addr), Duration::from_millis(500)).unwrap(),
    );
    let charger = ChargerAgent::spawn(ChargerConfig::new(ChargerId(1)), MessageBus::default(), link);
    let mut watch = charger.watch();

    // Start-up deactivate fails to connect
    let snapshot = tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| s.state == ChargerState::Error))
        .await
        .expect("charger never failed")
        .unwrap()
        .clone();
    assert!(matches!(snapshot.last_fault, Some(Fault::Connectivity(_))));

    charger.shutdown().await;
}
