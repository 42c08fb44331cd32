pub mod differ;
pub mod engine;
pub mod executor;
pub mod sniff;
pub mod task;

pub use differ::Differ;
pub use engine::SyncEngine;
pub use executor::Executor;
pub use sniff::detect_content_type;
pub use task::{Action, Task};
