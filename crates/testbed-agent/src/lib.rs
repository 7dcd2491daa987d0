//! # testbed-agent
//!
//! Runs inside a testbed sandbox. It answers the control protocol on two TCP
//! ports and serves a small synchronous HTTP surface on a third.
//!
//! ```text
//!              ┌────────────────────────────────────────┐
//!  ping ─────▶ │ Agent::run (dispatch loop)             │ ─────▶ pong
//!  exec ─────▶ │   ├─ spawn ─▶ sh -c <command>          │ ─────▶ exec_status
//!  patch ────▶ │   ├─ spawn ─▶ git apply / patch        │
//!  eval ─────▶ │   └─ spawn ─▶ bash <eval script>       │ ─────▶ result
//!              └────────────────────────────────────────┘
//!              ┌────────────────────────────────────────┐
//!  HTTP ─────▶ │ /health  /exec  /file                  │
//!              └────────────────────────────────────────┘
//! ```
//!
//! Only one execution runs at a time. A request for a different execution
//! while one is running is answered with a `busy` record.

pub mod config;
pub mod dispatch;
pub mod exec;
pub mod fs;
pub mod http;

pub use config::{AgentConfig, ConfigError};
pub use dispatch::{Agent, ExecutionBoard};
