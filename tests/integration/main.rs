//! Integration tests for the detection engine.

mod detection;
mod mock_backend;
mod simulation;
