//! # pmx-host: PMX host service
//!
//! Long-running process that listens on `pmx.<service>.<host>` and answers
//! console commands with a set of built-ins. Host log events are captured
//! into a bounded in-memory store and pushed to every attached console.

pub mod config;
pub mod handlers;
pub mod logging;
pub mod service;
