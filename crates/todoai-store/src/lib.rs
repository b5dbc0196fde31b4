//! Repository contracts and in-memory stores for the todoai workers.
//!
//! The workers only depend on the traits in [`repository`]; the in-memory
//! implementations back tests and local runs.

pub mod error;
pub mod memory;
pub mod repository;

pub use error::{StoreError, StoreResult};
pub use memory::{
    MemoryActivityRepository, MemoryPreferencesRepository, MemoryTagStatisticsRepository,
    MemoryTodoRepository,
};
pub use repository::{
    fetch_all_todos, ActivityRepository, Page, PreferencesRepository, TagChangeHook,
    TagStatisticsRepository, TodoRepository,
};
