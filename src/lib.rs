//! Content distribution between the blogs of a multisite network and to
//! remote networks.
pub mod app;
pub mod config;
pub mod connection;
pub mod db;
pub mod destination;
pub mod distributor;
pub mod error;
pub mod gid;
pub mod hooks;
pub mod model;
pub mod post;
pub mod queue;
pub mod remote;
pub mod server;
pub mod store;
pub mod translation;
