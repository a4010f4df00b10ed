#![forbid(unsafe_code)]

pub mod auth_state;
pub mod connection;
pub mod error;
pub mod routing;
pub mod rpc;
pub mod sequence;
pub mod service;
pub mod session_hub;
pub mod store;
pub mod update_log;



#[cfg(test)]
mod service_tests;

#[cfg(test)]
mod session_hub_tests;
