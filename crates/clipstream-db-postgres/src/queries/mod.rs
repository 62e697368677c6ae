//! SQL query implementations for the PostgreSQL durable store.
//!
//! Every function is generic over the sqlx executor so the same statement runs
//! against the pool or inside a transaction (`&mut **tx`).

pub mod comments;
pub mod relations;
pub mod users;
pub mod videos;
