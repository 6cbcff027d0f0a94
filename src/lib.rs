pub mod addr;
pub mod agent;
pub mod api;
pub mod config;
pub mod controller;
pub mod direct;
pub mod metrics;
pub mod readiness;
pub mod registry;
pub mod runner;
pub mod stun;
pub mod wg;

// Re-export key types for easier access by consumers
pub use api::{ApiClient, PeerCandidate, RegisterRequest, RegisterResponse};
pub use config::{Config, ControllerConfig, NodeConfig};
pub use controller::Server;
pub use direct::{Responder, SharedSocket};
pub use readiness::{DirectReadiness, ReadyPolicy};
pub use registry::Registry;
pub use runner::{OsRunner, Runner};
pub use stun::NatClass;
pub use wg::{Manager, Peer};
