//! Request handlers

pub mod health;
pub mod inputs;
pub mod tasks;

pub use health::{health, llm_status};
pub use inputs::put_input;
pub use tasks::{submit_task, task_status};
