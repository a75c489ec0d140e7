//! HTTP routes

pub mod internal;
pub mod ledger;
