//! pvt library
//!
//! See, decide, act. Reads the screen through OCR, asks a language model
//! for exactly one action from a closed vocabulary, grounds it against the
//! text that is actually visible, and only then moves the mouse or types.
//!
//! Screen capture and input injection are behind the `vision` and `input`
//! features and are off by default.

pub mod cli;
pub mod core;
pub mod input;
pub mod logging;
pub mod memory;
pub mod providers;
pub mod vision;
pub mod vla;
