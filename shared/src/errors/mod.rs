mod config_errors;
mod lpc_errors;
mod patch_errors;

pub use config_errors::ConfigError;
pub use lpc_errors::LpcError;
pub use patch_errors::PatchError;
