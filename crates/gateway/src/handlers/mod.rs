//! API handlers module

pub mod evaluations;
pub mod health;
pub mod knowledge;
pub mod suppliers;
pub mod tenants;
pub mod users;
