//! Core modules: change groups, validation pipeline, approval gate, atomic
//! apply and the durable store they share.

pub mod applier;
pub mod audit;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod files;
pub mod finding;
pub mod gate;
pub mod group;
pub mod ledger;
pub mod locks;
pub mod lookup;
pub mod manifest;
pub mod pipeline;
pub mod rules;
pub mod schemas;
pub mod service;
pub mod store;
pub mod time;
