pub mod directory;
pub mod ledger;
pub mod notifier;
pub mod orchestrator;
pub mod redis_ledger;
pub mod redis_store;
pub mod state_machine;
pub mod store;
pub mod sweeper;

pub use directory::*;
pub use ledger::*;
pub use notifier::*;
pub use orchestrator::*;
pub use redis_ledger::*;
pub use redis_store::*;
pub use state_machine::*;
pub use store::*;
pub use sweeper::*;
