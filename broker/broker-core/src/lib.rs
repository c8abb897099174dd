//! FleetCam session broker.
//!
//! Devices connect to one endpoint and register, report liveness and push
//! frames; viewers connect to another and receive every frame any device
//! pushes. See [`Broker`] for the wiring.

pub mod broker;
pub mod config;
pub mod registry;
pub mod sweeper;
pub mod telemetry;
pub mod viewers;

pub use broker::{Broker, BrokerHandle, FleetStatus};
pub use config::BrokerConfig;
pub use registry::{DeviceLink, DeviceRegistry, SessionId};
pub use sweeper::StalenessSweeper;
pub use viewers::{BroadcastReport, ViewerId, ViewerSet};
