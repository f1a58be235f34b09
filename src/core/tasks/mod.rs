// src/core/tasks/mod.rs

pub mod auto_shutdown;
