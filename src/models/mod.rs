// src/models/mod.rs
pub mod geo;
pub mod user;
pub mod vehicle;
pub mod ride;
pub mod trip;

pub use geo::*;
pub use user::*;
pub use vehicle::*;
pub use ride::*;
pub use trip::*;
