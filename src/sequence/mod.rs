//! Schedule representation and the coordinator that executes it.

pub mod coordinator;
pub mod schedule;
pub mod timer;

pub use coordinator::{SequenceCoordinator, SequenceDevices, SequenceEvent};
pub use schedule::{Schedule, ScheduleAction};
pub use timer::SleepTimer;
