//! HTTP front end for the slotserve slot scheduler.

pub mod api;
pub mod config;
pub mod logging;
pub mod shutdown;
