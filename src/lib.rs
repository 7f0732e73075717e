//! capdispatch library
//!
//! Resolves action verbs to signed capabilities, verifies their trust, and
//! runs them in QuickJS, WASM or interpreter sandboxes. Unknown verbs are
//! escalated to a reasoning capability whose plans are cached per verb.

pub mod cli;
pub mod config;
pub mod credentials;
pub mod logging;
pub mod plugins;
pub mod registry;
pub mod usage;
pub mod verbs;
