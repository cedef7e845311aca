//! Service configuration.
//!
//! Layers, lowest priority first:
//! 1. **Defaults** - compiled in
//! 2. **File** - YAML named by `--config` or `TASK_GRAPH_CONFIG`
//! 3. **Environment** - see below
//! 4. **Command line** - `--database`, `--port`
//!
//! ## Environment Variables
//! - `PORT` - HTTP port (default 8080)
//! - `DB_PATH` - SQLite database file
//! - `APP_ENV` - `development` or `production`
//! - `SEED_DATABASE` - force demo seeding on or off
//! - `JWT_SECRET` - token signing secret, at least 32 bytes (required)
//! - `CORS_ALLOWED_ORIGINS` - comma-separated origins, `*` for any
//! - `CORS_ALLOW_CREDENTIALS` - `true` or `false`

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigTier, apply_env_overrides};
pub use merge::deep_merge;
pub use types::*;
