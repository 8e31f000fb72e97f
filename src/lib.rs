#![deny(missing_docs)]

//! Keeps the supervisor and critical host services out of reach of the oom killer

pub mod commands;
pub mod container;
pub mod daemon;
pub mod enforcer;
pub mod exit_signal_handler;
pub mod log_fmt;
pub mod oom_score;
pub mod proc;
pub mod prometheus;
pub mod settings;
