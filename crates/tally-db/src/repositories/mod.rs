//! Repository modules for durable-store access

pub mod customer_repo;
pub mod event_repo;
pub mod feature_repo;
