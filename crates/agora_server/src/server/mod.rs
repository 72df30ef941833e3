#![forbid(unsafe_code)]

pub mod connection;
pub mod directory;
pub mod engine;
pub mod events;
pub mod health;
pub mod history;
pub mod hub;



#[cfg(test)]
mod hub_tests;
