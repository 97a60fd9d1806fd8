//! Report-card backend - profile agent, content pipeline, and payment-gated polls.
//!
//! Routines run on a small durable-execution substrate (`durable`); the
//! poll and the journal are ractor actors; the JSON API is axum.

pub mod activities;
pub mod actors;
pub mod api;
pub mod app_state;
pub mod config;
pub mod durable;
