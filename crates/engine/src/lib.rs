pub mod backoff;
pub mod composer;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod eligibility;
pub mod intake;
pub mod ledger;
pub mod pg_ledger;
pub mod scheduler;

pub use config::{ConfigError, DispatchConfig};
pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
pub use intake::EventIntake;
