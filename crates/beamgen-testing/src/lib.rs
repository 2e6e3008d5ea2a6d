// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! # beamgen Testing Utilities
//!
//! This crate re-exports the mock capabilities from beamgen core for
//! convenience, so downstream crates can depend on one testing crate:
//!
//! - **MockLanguage**: scripted prompt refinement and combination
//! - **MockImage**: deterministic image rendering with fault injection
//! - **MockVision**: scripted scoring and comparative ranking
//!
//! ## Quick Start
//!
//! ```rust
//! use beamgen_testing::{MockImage, MockLanguage, MockVision};
//!
//! let language = MockLanguage::new()
//!     .with_refine_handler(|text, dim| Ok(format!("{text} [{dim}]")));
//! let image = MockImage::new().with_batch();
//! let vision = MockVision::new().with_max_images(4);
//! ```

pub use beamgen::testing::{
    AnalyzeHandler, CombineHandler, CompareHandler, MockImage, MockLanguage, MockVision,
    RefineHandler,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{MockImage, MockLanguage, MockVision};
}
