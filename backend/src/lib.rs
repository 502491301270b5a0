pub mod config;
pub mod database;
pub mod error;
pub mod jobs;
pub mod services;

pub use error::{BillingError, BillingResult};

#[cfg(test)]
mod tests;
