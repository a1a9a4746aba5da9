pub mod cancel;
pub mod checksum;
pub mod clock;
pub mod locker;
pub mod retry;
pub mod spool;

pub use cancel::{CancelHandle, CancelSignal};
pub use checksum::{sha256_hex, Checksum};
pub use clock::{Clock, SystemClock};
pub use locker::JobLock;
pub use retry::RetryPolicy;
pub use spool::{Spool, SpoolReader};
