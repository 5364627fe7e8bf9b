//! Entity registry
//!
//! Thin layer over the store for registering cars, stations and chargers and
//! for building the nested views returned by the API.

use std::sync::Arc;

use tracing::info;

use evc_core::{CarId, ChargerId, StationId};

use crate::model::*;
use crate::store::{Store, StoreError};

pub struct Registry {
    store: Arc<dyn Store>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn create_car(&self, car: NewCar) -> Result<CarView, StoreError> {
        let car = self.store.insert_car(car)?;
        info!("Registry: Registered car {}", car.id);
        self.car(&car.id)
    }

    pub fn car(&self, id: &CarId) -> Result<CarView, StoreError> {
        let car = self
            .store
            .car(id)
            .ok_or_else(|| StoreError::CarNotFound(id.clone()))?;
        Ok(CarView {
            reservations: self.store.reservations_for_car(&car.id),
            id: car.id,
        })
    }

    pub fn create_station(&self) -> StationView {
        let station = self.store.insert_station();
        info!("Registry: Registered station {}", station.id);
        StationView {
            id: station.id,
            chargers: Vec::new(),
        }
    }

    pub fn station(&self, id: StationId) -> Result<StationView, StoreError> {
        let station = self
            .store
            .station(id)
            .ok_or(StoreError::StationNotFound(id))?;
        let chargers = self
            .store
            .chargers_at(station.id)
            .into_iter()
            .map(|c| self.charger_view(c))
            .collect();
        Ok(StationView {
            id: station.id,
            chargers,
        })
    }

    pub fn create_charger(&self, charger: NewCharger) -> Result<ChargerView, StoreError> {
        let charger = self.store.insert_charger(charger)?;
        info!(
            "Registry: Registered charger {} at station {}",
            charger.id, charger.station_id
        );
        Ok(self.charger_view(charger))
    }

    pub fn charger(&self, id: ChargerId) -> Result<ChargerView, StoreError> {
        let charger = self
            .store
            .charger(id)
            .ok_or(StoreError::ChargerNotFound(id))?;
        Ok(self.charger_view(charger))
    }

    pub fn update_charger(
        &self,
        id: ChargerId,
        update: ChargerUpdate,
    ) -> Result<ChargerView, StoreError> {
        let charger = self.store.update_charger(id, update)?;
        info!(
            "Registry: Updated charger {} (reservable={}, available={})",
            charger.id, charger.is_reservable, charger.is_available
        );
        Ok(self.charger_view(charger))
    }

    fn charger_view(&self, charger: Charger) -> ChargerView {
        ChargerView {
            reservations: self.store.reservations_for_charger(charger.id),
            id: charger.id,
            station_id: charger.station_id,
            is_reservable: charger.is_reservable,
            is_available: charger.is_available,
        }
    }
}
