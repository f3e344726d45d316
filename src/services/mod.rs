pub mod balance;
pub mod clock;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod retry;
pub mod scheduler;
pub mod wallet;

pub use balance::BalanceService;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::WalletError;
pub use executor::{ExecutionOutcome, WithdrawalExecutor};
pub use idempotency::IdempotencyGuard;
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerConfig, WithdrawalScheduler};
pub use wallet::WalletService;
