//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `init_db`  | `InitDb`         |
//! | `config`   | `Config`         |

pub mod config;
pub mod init_db;
pub mod serve;

pub use config::cmd_config;
pub use init_db::cmd_init_db;
pub use serve::{ServeOverrides, cmd_serve};
