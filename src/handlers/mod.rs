// src/handlers/mod.rs
pub mod ride_handler;
pub mod rider_handler;
pub mod user_handler;
