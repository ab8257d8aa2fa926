//! Browser time tracking engine: turns tab and focus triggers into per-domain
//! sessions, classifies them, buffers them durably and ships them to a collector.

pub mod api;
pub mod buffer;
pub mod category;
pub mod clock;
pub mod config;
pub mod controller;
pub mod device;
pub mod domain;
pub mod error;
pub mod session;
pub mod stats;
pub mod store;
pub mod sync;
