pub mod agent;
pub mod conversation;
pub mod identity;
pub mod message;
pub mod usage;
