pub mod admin;
pub mod consumption;
pub mod control_server;
pub mod dispatcher;
pub mod health;
pub mod log_client;
pub mod registry;
pub mod retry_park;
pub mod router;

pub use consumption::{ConsumptionConfig, ConsumptionLoop};
pub use control_server::run_control_server;
pub use dispatcher::Dispatcher;
pub use health::run_health_monitor;
pub use log_client::{LogClient, RedisLogClient};
pub use registry::{HealthThresholds, Registry};
pub use retry_park::RetryPark;
pub use router::Router;
