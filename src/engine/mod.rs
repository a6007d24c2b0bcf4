//! Core engine — the seed → expand → match → classify → promote loop.

pub mod accumulator;
pub mod classifier;
pub mod context;
pub mod controller;
pub mod expander;
pub mod matcher;
pub mod normalizer;
pub mod service;

pub use context::CancelFlag;
pub use controller::TraversalController;
pub use service::{DetectionService, RunHandle};
