// src/services/mod.rs
pub mod store;
pub mod geo_index;
pub mod matcher;
pub mod notify_service;
pub mod user_service;
pub mod rider_service;
pub mod dispatch_service;
