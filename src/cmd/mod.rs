//! CLI command implementations.
//!
//! | Module    | Commands handled                                  |
//! |-----------|----------------------------------------------------|
//! | `project` | `Init`                                             |
//! | `task`    | `Run`, `Resume`, `Status`, `List`, `Export`        |
//! | `config`  | `Config`                                           |

pub mod config;
pub mod project;
pub mod task;

pub use config::cmd_config;
pub use project::cmd_init;
pub use task::{build_request, cmd_export, cmd_list, cmd_resume, cmd_run, cmd_status};
