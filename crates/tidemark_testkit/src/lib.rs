//! # Tidemark Testkit
//!
//! Test utilities for Tidemark.
//!
//! This crate provides:
//! - An in-memory storage collaborator emulating the storage extension
//! - A scripted HTTP client recording every request
//! - A recording backend connector with configurable upload behavior
//! - Stream line fixtures and a wired-up connection manager
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidemark_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs() {
//!     let harness = TestHarness::new();
//!     harness.http.push_stream(StreamScript::lines_then_open([/* lines */]));
//!     harness.connect().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connector;
pub mod fixtures;
pub mod generators;
pub mod http;
pub mod memory;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connector::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::http::*;
    pub use crate::memory::*;
}

pub use connector::*;
pub use fixtures::*;
pub use generators::*;
pub use http::*;
pub use memory::*;
