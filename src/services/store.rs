// src/services/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Client;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::{
    ride::RideRequest,
    trip::Trip,
    user::User,
    vehicle::{RiderAvailability, Vehicle},
};

// ------------------------------
// Key layout
// ------------------------------

/// Key generators for the entity namespaces. One entity per key, JSON value;
/// secondary lookups are small index keys pointing at primary ids.
pub struct StoreKeys;

impl StoreKeys {
    pub fn user(id: &str) -> String {
        format!("user:id:{}", id)
    }

    pub fn user_by_phone(phone: &str) -> String {
        format!("user:phone:{}", phone)
    }

    pub fn vehicle(id: &str) -> String {
        format!("vehicle:id:{}", id)
    }

    pub fn vehicle_by_owner(owner_id: &str) -> String {
        format!("vehicle:owner:{}", owner_id)
    }

    pub fn availability(rider_id: &str) -> String {
        format!("availability:rider:{}", rider_id)
    }

    pub fn request(id: &str) -> String {
        format!("request:id:{}", id)
    }

    pub fn active_request_by_traveller(traveller_id: &str) -> String {
        format!("request:active:traveller:{}", traveller_id)
    }

    pub fn trip(id: &str) -> String {
        format!("trip:id:{}", id)
    }

    pub fn trip_by_request(request_id: &str) -> String {
        format!("trip:request:{}", request_id)
    }

    pub fn active_trip_by_rider(rider_id: &str) -> String {
        format!("trip:active:rider:{}", rider_id)
    }

    pub fn archived(key: &str) -> String {
        format!("archive:{}", key)
    }
}

// ------------------------------
// Backends
// ------------------------------

#[async_trait]
trait KvOperations: Send + Sync {
    async fn get_raw(&self, key: &str) -> DispatchResult<Option<String>>;
    async fn set_raw(&self, key: &str, value: String) -> DispatchResult<()>;
    async fn delete_raw(&self, key: &str) -> DispatchResult<()>;
    async fn keys_with_prefix(&self, prefix: &str) -> DispatchResult<Vec<String>>;
}

/// In-process backend; authoritative for tests and single-node deployments.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvOperations for MemoryStore {
    async fn get_raw(&self, key: &str) -> DispatchResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String) -> DispatchResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_raw(&self, key: &str) -> DispatchResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> DispatchResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Redis backend for multi-node deployments; same record layout as memory.
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> DispatchResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| DispatchError::RedisConnection(e.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> DispatchResult<redis::aio::Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| DispatchError::RedisConnection(e.to_string()))
    }
}

#[async_trait]
impl KvOperations for RedisStore {
    async fn get_raw(&self, key: &str) -> DispatchResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: String) -> DispatchResult<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_raw(&self, key: &str) -> DispatchResult<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> DispatchResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", prefix))
            .query_async(&mut conn)
            .await?;
        Ok(keys)
    }
}

enum Backend {
    Memory(MemoryStore),
    Redis(RedisStore),
}

#[async_trait]
impl KvOperations for Backend {
    async fn get_raw(&self, key: &str) -> DispatchResult<Option<String>> {
        match self {
            Backend::Memory(store) => store.get_raw(key).await,
            Backend::Redis(store) => store.get_raw(key).await,
        }
    }

    async fn set_raw(&self, key: &str, value: String) -> DispatchResult<()> {
        match self {
            Backend::Memory(store) => store.set_raw(key, value).await,
            Backend::Redis(store) => store.set_raw(key, value).await,
        }
    }

    async fn delete_raw(&self, key: &str) -> DispatchResult<()> {
        match self {
            Backend::Memory(store) => store.delete_raw(key).await,
            Backend::Redis(store) => store.delete_raw(key).await,
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> DispatchResult<Vec<String>> {
        match self {
            Backend::Memory(store) => store.keys_with_prefix(prefix).await,
            Backend::Redis(store) => store.keys_with_prefix(prefix).await,
        }
    }
}

// ------------------------------
// Entity store
// ------------------------------

/// Durable state for users, vehicles, availability, ride requests and trips.
/// A handle is passed explicitly to every service; there is no process-wide
/// singleton. Cross-entity invariants are enforced by the dispatch
/// coordinator under the owning entity's lock, not here.
pub struct EntityStore {
    backend: Backend,
}

impl EntityStore {
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(MemoryStore::new()),
        }
    }

    pub fn redis(redis_url: &str) -> DispatchResult<Self> {
        Ok(Self {
            backend: Backend::Redis(RedisStore::new(redis_url)?),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> DispatchResult<Option<T>> {
        match self.backend.get_raw(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> DispatchResult<()> {
        let json = serde_json::to_string(value)?;
        self.backend.set_raw(key, json).await
    }

    // ---- users ----

    pub async fn put_user(&self, user: &User) -> DispatchResult<()> {
        self.set_json(&StoreKeys::user(&user.id), user).await?;
        self.backend
            .set_raw(&StoreKeys::user_by_phone(&user.phone), user.id.clone())
            .await
    }

    pub async fn get_user(&self, id: &str) -> DispatchResult<Option<User>> {
        self.get_json(&StoreKeys::user(id)).await
    }

    pub async fn find_user_by_phone(&self, phone: &str) -> DispatchResult<Option<User>> {
        match self.backend.get_raw(&StoreKeys::user_by_phone(phone)).await? {
            Some(id) => self.get_user(&id).await,
            None => Ok(None),
        }
    }

    // ---- vehicles ----

    pub async fn put_vehicle(&self, vehicle: &Vehicle) -> DispatchResult<()> {
        self.set_json(&StoreKeys::vehicle(&vehicle.id), vehicle).await?;
        self.backend
            .set_raw(&StoreKeys::vehicle_by_owner(&vehicle.owner_id), vehicle.id.clone())
            .await
    }

    pub async fn get_vehicle(&self, id: &str) -> DispatchResult<Option<Vehicle>> {
        self.get_json(&StoreKeys::vehicle(id)).await
    }

    pub async fn vehicle_by_owner(&self, owner_id: &str) -> DispatchResult<Option<Vehicle>> {
        match self.backend.get_raw(&StoreKeys::vehicle_by_owner(owner_id)).await? {
            Some(id) => self.get_vehicle(&id).await,
            None => Ok(None),
        }
    }

    // ---- availability ----

    pub async fn put_availability(&self, availability: &RiderAvailability) -> DispatchResult<()> {
        self.set_json(&StoreKeys::availability(&availability.rider_id), availability)
            .await
    }

    pub async fn get_availability(&self, rider_id: &str) -> DispatchResult<Option<RiderAvailability>> {
        self.get_json(&StoreKeys::availability(rider_id)).await
    }

    // ---- ride requests ----

    pub async fn put_request(&self, request: &RideRequest) -> DispatchResult<()> {
        self.set_json(&StoreKeys::request(&request.id), request).await?;
        let active_key = StoreKeys::active_request_by_traveller(&request.traveller_id);
        if request.status.is_terminal() {
            // A terminal request stops counting against the traveller.
            if self.backend.get_raw(&active_key).await?.as_deref() == Some(&request.id) {
                self.backend.delete_raw(&active_key).await?;
            }
        } else {
            self.backend.set_raw(&active_key, request.id.clone()).await?;
        }
        Ok(())
    }

    pub async fn get_request(&self, id: &str) -> DispatchResult<Option<RideRequest>> {
        self.get_json(&StoreKeys::request(id)).await
    }

    pub async fn active_request_for_traveller(
        &self,
        traveller_id: &str,
    ) -> DispatchResult<Option<RideRequest>> {
        let key = StoreKeys::active_request_by_traveller(traveller_id);
        match self.backend.get_raw(&key).await? {
            Some(id) => self.get_request(&id).await,
            None => Ok(None),
        }
    }

    // ---- trips ----

    pub async fn put_trip(&self, trip: &Trip) -> DispatchResult<()> {
        self.set_json(&StoreKeys::trip(&trip.id), trip).await?;
        self.backend
            .set_raw(&StoreKeys::trip_by_request(&trip.ride_request_id), trip.id.clone())
            .await?;
        let active_key = StoreKeys::active_trip_by_rider(&trip.rider_id);
        if trip.state.is_terminal() {
            if self.backend.get_raw(&active_key).await?.as_deref() == Some(&trip.id) {
                self.backend.delete_raw(&active_key).await?;
            }
        } else {
            self.backend.set_raw(&active_key, trip.id.clone()).await?;
        }
        Ok(())
    }

    pub async fn get_trip(&self, id: &str) -> DispatchResult<Option<Trip>> {
        self.get_json(&StoreKeys::trip(id)).await
    }

    pub async fn trip_by_request(&self, request_id: &str) -> DispatchResult<Option<Trip>> {
        match self.backend.get_raw(&StoreKeys::trip_by_request(request_id)).await? {
            Some(id) => self.get_trip(&id).await,
            None => Ok(None),
        }
    }

    pub async fn active_trip_for_rider(&self, rider_id: &str) -> DispatchResult<Option<Trip>> {
        match self.backend.get_raw(&StoreKeys::active_trip_by_rider(rider_id)).await? {
            Some(id) => {
                // The index trails transitions by one write; re-check the record.
                match self.get_trip(&id).await? {
                    Some(trip) if !trip.state.is_terminal() => Ok(Some(trip)),
                    _ => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    // ---- archival ----

    /// Move terminal trip and request records older than the cutoff into the
    /// archive namespace. Records are retained for audit, never deleted.
    pub async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> DispatchResult<usize> {
        let mut archived = 0usize;

        for key in self.backend.keys_with_prefix("trip:id:").await? {
            if let Some(trip) = self.get_json::<Trip>(&key).await? {
                if trip.state.is_terminal() && trip.updated_at < cutoff {
                    self.set_json(&StoreKeys::archived(&key), &trip).await?;
                    self.backend.delete_raw(&key).await?;
                    archived += 1;
                }
            }
        }

        for key in self.backend.keys_with_prefix("request:id:").await? {
            if let Some(request) = self.get_json::<RideRequest>(&key).await? {
                if request.status.is_terminal() && request.updated_at < cutoff {
                    self.set_json(&StoreKeys::archived(&key), &request).await?;
                    self.backend.delete_raw(&key).await?;
                    archived += 1;
                }
            }
        }

        Ok(archived)
    }
}
