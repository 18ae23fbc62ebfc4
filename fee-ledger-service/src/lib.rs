//! Fee Ledger Service - student billing, payment reconciliation and finance
//! reporting.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
