// ABOUTME: Sandbox lifecycle and log streaming engine for uploaded bot bundles
// ABOUTME: Runs each bundle in an isolated container and fans its output out to live subscribers

pub mod bundle;
pub mod error;
pub mod guard;
pub mod logs;
pub mod manager;
pub mod providers;
pub mod registry;
pub mod resolver;
pub mod settings;

pub use bundle::BundleId;
pub use error::{EngineError, Result};
pub use logs::{LineSplitter, LogBuffer, LogLine, LogSource, LogSubscription, SubscriptionId};
pub use manager::{BotManager, BotStatus, ReconcileReport};
pub use providers::{
    ContainerConfig, ContainerInfo, DockerProvider, ExitStatus, OutputChunk, OutputStream,
    Provider as SandboxProvider, ProviderError, StreamType,
};
pub use registry::{BotState, SandboxHandle};
pub use resolver::{EntryPoint, EntryPointResolver, EntrySource};
pub use settings::EngineSettings;
