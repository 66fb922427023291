pub mod agents;
pub mod errors;
pub mod events;
pub mod ids;
pub mod project;
pub mod provider;
