pub mod agent_routes;
pub mod firewall_routes;
pub mod heartbeat_routes;
pub mod provision_routes;
