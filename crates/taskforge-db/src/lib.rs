//! Persistence layer for the taskforge engine: configuration, the
//! PostgreSQL pool and migrations, the bounded session pool, the task
//! data model, the arena task tree, and the repository contract.

pub mod config;
pub mod models;
pub mod pool;
pub mod repository;
pub mod session;
pub mod tree;

pub use config::DbConfig;
pub use models::{JsonMap, StoredDependency, Task, TaskDependency, TaskStatus};
pub use session::{Session, SessionLimitExceeded, SessionPool};
pub use tree::{TaskTree, TreeError};
