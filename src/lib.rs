pub mod app_error;
pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod middleware;
pub mod models;
pub mod notifications;
pub mod poller;
pub mod presence;
pub mod realtime;
pub mod routes;
pub mod runtime;
pub mod schema;
pub mod session;
pub mod state_machine;
pub mod stores;
pub mod tracking;
