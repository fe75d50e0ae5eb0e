pub mod auditor;
pub mod cli;
pub mod config;
pub mod engine;
pub mod hostel;
pub mod journal;
pub mod ledger;
pub mod limits;
pub mod listener;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
