//! KDL configuration parsing for buildhook.
//!
//! Settings are read from a layered list of KDL files; later files override
//! values set by earlier ones and missing files are skipped.

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{GeneralSettings, LogSettings, ServerSettings, Settings, StoreSettings};
