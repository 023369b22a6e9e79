pub mod graph;
pub mod history;
pub mod model;
pub mod query;
pub mod state;
pub mod storage;
pub mod store;

pub use store::{CommitDelta, TaskStore};
