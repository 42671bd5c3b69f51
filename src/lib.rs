//! Floodgate - Admission Control Engine
//!
//! This crate implements interchangeable rate limiting strategies (token
//! bucket, leaky bucket, fixed and sliding windows, concurrency and adaptive
//! limits) behind one [`Limiter`](ratelimit::Limiter) interface, plus per-key
//! and store-backed distributed variants. Every limiter reads time through an
//! injected [`Clock`](clock::Clock), so behaviour is testable in virtual time.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
mod task;
