pub(crate) mod db_restore;
mod logic;
pub(crate) mod verification;

pub use logic::{RestoreOrchestrator, RestoreReport};
