//! Arqueo - queue-driven cash-reconciliation processor.
//!
//! Consumes reconciliation tasks from a message queue, types each one into
//! the legacy accounting application through a driver, and publishes the
//! outcome to a fixed results queue.
//!
//! ```text
//! [inbound queue] -> consumer -> transform -> orchestrator -> publisher -> [results queue]
//!                                                 |
//!                                                 v
//!                                      [legacy driver] (duplicate query, form entry)
//! ```

pub mod bus;
pub mod config;
pub mod consumer;
pub mod driver;
pub mod duplicates;
pub mod history;
pub mod mapping;
pub mod model;
pub mod observer;
pub mod orchestrator;
pub mod transform;
pub mod utils;
