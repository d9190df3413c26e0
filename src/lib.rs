//! Strata: a WebGPU-style object model with an in-process device.
//!
//! Everything lives in [`graphics`]; the common types are re-exported here.

pub use strata_graphics as graphics;
pub use strata_graphics::*;
