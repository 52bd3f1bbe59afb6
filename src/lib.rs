pub mod config;
pub mod crawler;
pub mod diff;
pub mod engine;
pub mod humanize;
pub mod ledger;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod queue;
pub mod server;
pub mod throttle;
pub mod worker;
