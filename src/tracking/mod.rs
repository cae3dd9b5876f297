pub mod active;
pub mod controller;
pub mod daily;
pub mod day_split;
pub mod domain;
pub mod idle;
pub mod interval;

pub use controller::{SessionController, TrackingSettings};
