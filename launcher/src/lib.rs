//! Process launcher.
//!
//! Spawns a program that exposes a remote-debugging endpoint, watches its
//! stderr for the `DevTools listening on ...` announcement, and hands back
//! the validated address. On every failure the child is killed first.

mod error;
mod launch;
mod scan;

pub use error::LaunchError;
pub use launch::{LaunchConfig, LaunchedProcess, launch};
