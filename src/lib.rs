//! checkoutfs-overlay - Inode overlay storage engine
//!
//! The persistent local-divergence record of a lazily materialized
//! virtual checkout filesystem. The immutable snapshot itself lives
//! with the remote backend; this crate only tracks what the working
//! copy has created, edited, renamed, or deleted on top of it, with
//! transactional durability across process crashes.

pub mod config;
pub mod error;
pub mod overlay;

pub use config::OverlayConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::OverlayConfig;
    pub use crate::error::{Error, Result};
    pub use crate::overlay::{EntryKind, InodeId, OverlayEntry, OverlaySession, ROOT_ID};
}
