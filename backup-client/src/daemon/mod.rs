pub mod scheduler;
pub mod shutdown;

pub use scheduler::{cron_for, run_sources, BackupScheduler};
pub use shutdown::ShutdownCoordinator;
