pub mod logparse;
pub mod patch;
pub mod vault;

pub use logparse::{parse_log, ErrorBlock, ErrorType, Severity};
pub use patch::{apply_changes, FilePatch, LineChange, PatchError};
pub use vault::{Vault, VaultError};
