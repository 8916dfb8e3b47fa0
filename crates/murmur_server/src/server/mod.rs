#![forbid(unsafe_code)]

pub mod connection;
pub mod health;
pub mod history;
pub mod policy;
pub mod registry;
pub mod room;
pub mod signature;
pub mod store;

#[cfg(test)]
mod policy_tests;
