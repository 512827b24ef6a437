pub mod agents;
pub mod config;
pub mod dead_letters;
pub mod health;
pub mod leases;
pub mod stats;
