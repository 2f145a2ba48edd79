// Supervision module - Core service lifecycle management

mod backoff;
mod group;
pub mod probe;
mod supervisor;

pub use backoff::RestartPolicy;
pub use group::SupervisionGroup;
pub use supervisor::{ServiceStatus, ServiceSupervisor, StatusSnapshot};
