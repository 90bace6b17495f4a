pub mod error;
pub mod json_bridge;
pub mod schema;
pub mod settings;
pub mod store;

pub use error::{Result, StoreError};
pub use json_bridge::DirectoryFile;
pub use settings::{SettingsStore, default_base_dir, resolve_base_dir};
pub use store::Store;
