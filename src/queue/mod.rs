pub mod high_priority;
pub mod low_priority;

pub use high_priority::HighPriorityQueue;
pub use low_priority::{EntryRef, LowPriorityQueue};
