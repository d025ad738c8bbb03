//! Cache and serve anonymized repository content.
//!
//! [`sync::TreeSynchronizer`] rebuilds complete trees from a listing API that
//! truncates large recursive answers; [`storage`] persists fetched content per
//! repository and streams subtrees out as zip or tar archives.

pub mod config;
pub mod engine;
pub mod error;
pub mod source;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod tree;

pub use error::{Error, Result};
