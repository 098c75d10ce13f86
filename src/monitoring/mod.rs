//! Network probes used by uptime monitors and node app health checks.

pub mod probe;
