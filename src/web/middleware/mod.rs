pub mod agent_auth;
