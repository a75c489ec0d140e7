//! Business logic behind the HTTP routes

pub mod internal;
pub mod ledger;
