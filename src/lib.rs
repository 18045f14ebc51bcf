pub mod api;
pub mod config;
pub mod controller;
pub mod device;
pub mod domain;
pub mod ephemeris;
pub mod history;
pub mod notify;
pub mod plan;
pub mod prices;
pub mod schedule;
pub mod store;
pub mod telemetry;
pub mod ups;
