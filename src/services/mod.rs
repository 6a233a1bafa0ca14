pub mod lease_service;
pub mod metrics_service;
pub mod runner_service;
pub mod stall_service;
