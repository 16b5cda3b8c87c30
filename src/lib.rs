pub mod admin;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod keys;
pub mod models;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod settlement;
pub mod sweeper;
pub mod transport;
pub mod upstream;
pub mod vault;
