//! Tuition invoicing: line-item editing, total recalculation and
//! reconciliation of invoice edits against storage.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
