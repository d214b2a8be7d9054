//! Provider registry, factory, and failover/streaming manager (spec
//! §4.4-§4.5).

pub mod manager;
pub mod registry;

pub use manager::{
	AllProvidersFailedError, FailoverSuccess, ManagedBatch, ProviderManager, ProviderManagerConfig, ProviderStream,
	SingleShotOperation, StreamBatch, StreamingOperation,
};
pub use registry::{
	with_global_registry, Capabilities, EnvReader, FactoryConfig, FactoryError, ProcessEnv, ProviderDescriptor,
	ProviderOverride, Registry, ReplayWindow, RequiresApiKey, ResolvedProvider,
};
#[cfg(any(test, feature = "test-util"))]
pub use registry::reset_registry_for_tests;
