pub(crate) mod archive;
pub(crate) mod db_dump;
pub(crate) mod encryption;
mod logic;
pub(crate) mod notify;
#[cfg(test)]
pub(crate) mod testing;

pub use logic::{BackupContext, BackupOrchestrator, CONFIG_ARCHIVE, LOGS_ARCHIVE, UPLOADS_ARCHIVE};
