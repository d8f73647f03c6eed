//! souq-guard - Rate Limiting and Abuse Prevention
//!
//! This crate protects the authentication and registration endpoints of the
//! Souq services marketplace. It combines a sliding window rate limiter backed
//! by Redis (with an in-process fallback) with account lockout after repeated
//! failed logins and an append-only security event log.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod security;
pub mod service;
