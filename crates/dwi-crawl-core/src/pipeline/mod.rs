pub mod command;
pub mod probe;
pub mod reconcile;
pub mod runner;
pub mod stage;

pub use command::MaterializedCommand;
pub use reconcile::{StagePlan, StageResult, SyncReport, UpdateOutcome};
pub use runner::CommandOutcome;
pub use stage::Stage;
