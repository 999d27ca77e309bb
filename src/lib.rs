//! KIS Trend-ATR Trading Engine Library
//!
//! Core components for the multi-day trend/ATR trading engine: domain
//! entities and services, the KIS broker client, the SQLite persistence
//! layer, and the order/position synchronization engine.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
