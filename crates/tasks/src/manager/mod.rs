//! The task manager loop.

mod core;
mod execution;
mod overrun;


pub use self::core::{TaskManager, TaskSubmitter};
