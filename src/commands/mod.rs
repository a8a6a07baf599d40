//! CLI commands implementation

pub mod init;
pub mod jobs;
pub mod run;
pub mod status;

pub use init::*;
pub use jobs::*;
pub use run::*;
pub use status::*;
