// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Botyard

// Bundle Storage
pub const BOTYARD_BUNDLES_ROOT: &str = "BOTYARD_BUNDLES_ROOT";

// Sandbox Runtime
pub const BOTYARD_SANDBOX_IMAGE: &str = "BOTYARD_SANDBOX_IMAGE";
pub const BOTYARD_SANDBOX_INTERPRETER: &str = "BOTYARD_SANDBOX_INTERPRETER";
pub const BOTYARD_SANDBOX_MEMORY_MB: &str = "BOTYARD_SANDBOX_MEMORY_MB";
pub const BOTYARD_SANDBOX_MAX_PROCESSES: &str = "BOTYARD_SANDBOX_MAX_PROCESSES";
pub const BOTYARD_IMAGE_PULL_TIMEOUT_SECS: &str = "BOTYARD_IMAGE_PULL_TIMEOUT_SECS";

// Lifecycle
pub const BOTYARD_STOP_GRACE_SECS: &str = "BOTYARD_STOP_GRACE_SECS";
pub const BOTYARD_RECONCILE_ON_STARTUP: &str = "BOTYARD_RECONCILE_ON_STARTUP";

// Log Streaming
pub const BOTYARD_LOG_CAPACITY: &str = "BOTYARD_LOG_CAPACITY";
pub const BOTYARD_LOG_REPLAY_LINES: &str = "BOTYARD_LOG_REPLAY_LINES";

// Defaults
pub const DEFAULT_BUNDLES_ROOT: &str = "./bundles";
pub const DEFAULT_SANDBOX_IMAGE: &str = "node:20-alpine";
pub const DEFAULT_SANDBOX_INTERPRETER: &str = "node";
pub const DEFAULT_SANDBOX_MEMORY_MB: u64 = 256;
pub const DEFAULT_SANDBOX_MAX_PROCESSES: i64 = 64;
pub const DEFAULT_IMAGE_PULL_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;
pub const DEFAULT_LOG_CAPACITY: usize = 2000;
pub const DEFAULT_LOG_REPLAY_LINES: usize = 200;
