//! Settings: defaults → environment (`EXITBOOK__` prefix, `__` separator)
//! → command-line overrides, with a `validate_settings` hook (spec
//! SPEC_FULL.md §1 "Configuration"), mirroring the teacher's `CfSettings`
//! pattern in `api/bin/chainflip-ingress-egress-tracker/src/settings.rs`
//! and `cli/src/settings.rs`. The trait itself lived in the teacher's
//! `utilities` crate, a sibling of `engine/` that sits outside this
//! workspace's copied snapshot, so it is redeclared here rather than
//! imported (see `DESIGN.md`).

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// A settings struct assembled from layered sources and checked once
/// after assembly. Every sub-settings struct used by [`CoreSettings`]
/// implements this too, so `validate_settings` can delegate top-down the
/// same way `CLISettings::validate_settings` delegates to `Eth`/`StateChain`
/// in the teacher.
pub trait CfSettings: Sized {
	type Settings;

	fn validate_settings(&self) -> Result<(), ConfigError>;

	/// Defaults (`file`) layered under environment variables prefixed
	/// `EXITBOOK`, `__`-separated (e.g. `EXITBOOK__PERSISTENCE__DATABASE_URL`).
	fn settings_from_file_and_env(file: &str) -> Result<Self::Settings, ConfigError>
	where
		Self::Settings: serde::de::DeserializeOwned,
	{
		Config::builder()
			.add_source(File::with_name(file).required(false))
			.add_source(Environment::with_prefix("EXITBOOK").separator("__"))
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSettings {
	#[serde(default = "default_database_url")]
	pub database_url: String,
}

fn default_database_url() -> String {
	"sqlite::memory:".to_string()
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self { database_url: "sqlite::memory:".to_string() }
	}
}

impl CfSettings for PersistenceSettings {
	type Settings = Self;

	fn validate_settings(&self) -> Result<(), ConfigError> {
		if self.database_url.is_empty() {
			return Err(ConfigError::Message("persistence.database_url must not be empty".to_string()));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersSettings {
	/// Dedup LRU capacity (spec §9's open question), see
	/// [`exitbook_providers::ProviderManagerConfig::dedup_capacity`].
	#[serde(default = "default_dedup_capacity")]
	pub dedup_capacity: usize,
}

fn default_dedup_capacity() -> usize {
	10_000
}

impl Default for ProvidersSettings {
	fn default() -> Self {
		Self { dedup_capacity: 10_000 }
	}
}

impl CfSettings for ProvidersSettings {
	type Settings = Self;

	fn validate_settings(&self) -> Result<(), ConfigError> {
		if self.dedup_capacity == 0 {
			return Err(ConfigError::Message("providers.dedup_capacity must be greater than zero".to_string()));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentationSettings {
	#[serde(default = "default_metrics_hostname")]
	pub metrics_hostname: String,
	#[serde(default = "default_metrics_port")]
	pub metrics_port: u16,
}

fn default_metrics_hostname() -> String {
	"127.0.0.1".to_string()
}

fn default_metrics_port() -> u16 {
	9898
}

impl Default for InstrumentationSettings {
	fn default() -> Self {
		Self { metrics_hostname: "127.0.0.1".to_string(), metrics_port: 9898 }
	}
}

impl CfSettings for InstrumentationSettings {
	type Settings = Self;

	fn validate_settings(&self) -> Result<(), ConfigError> {
		Ok(())
	}
}

/// The process-wide settings struct (SPEC_FULL.md §1). `exitbook-core`'s
/// own binary-free library surface does not parse argv itself — a CLI
/// collaborator (spec §1 non-goal) is expected to supply
/// [`CoreCommandLineOptions`] after parsing its own argv, exactly as the
/// teacher's `engine` crate never touches `std::env::args` and leaves that
/// to `chainflip-cli`/the tracker binaries.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CoreSettings {
	#[serde(default)]
	pub persistence: PersistenceSettings,
	#[serde(default)]
	pub providers: ProvidersSettings,
	#[serde(default)]
	pub instrumentation: InstrumentationSettings,
}

impl CfSettings for CoreSettings {
	type Settings = Self;

	fn validate_settings(&self) -> Result<(), ConfigError> {
		self.persistence.validate_settings()?;
		self.providers.validate_settings()?;
		self.instrumentation.validate_settings()
	}
}

/// Command-line overrides a collaborator may flatten into its own
/// `clap::Parser`, mirroring `CLICommandLineOptions`'s
/// `#[clap(flatten)]` sub-options in the teacher.
#[derive(Parser, Clone, Debug, Default)]
pub struct CoreCommandLineOptions {
	#[clap(long = "config-path", env = "EXITBOOK_CONFIG_PATH")]
	pub config_path: Option<String>,

	#[clap(long = "database-url", env = "EXITBOOK_DATABASE_URL")]
	pub database_url: Option<String>,

	#[clap(long = "dedup-capacity", env = "EXITBOOK_DEDUP_CAPACITY")]
	pub dedup_capacity: Option<usize>,
}

impl CoreCommandLineOptions {
	fn all_options_are_set(&self) -> bool {
		self.database_url.is_some() && self.dedup_capacity.is_some()
	}
}

impl CoreSettings {
	/// Builds settings the way the teacher's `CLISettings::new` does:
	/// skip the file+env layer entirely when every CLI flag the caller
	/// cares about was already supplied, otherwise load defaults→env from
	/// `opts.config_path` (or the crate's own default file) and apply CLI
	/// overrides on top.
	pub fn new(opts: CoreCommandLineOptions) -> Result<Self, ConfigError> {
		let settings = if opts.all_options_are_set() {
			let mut settings = Self::default();
			apply_cli_overrides(&mut settings, &opts);
			settings
		} else {
			let path = opts.config_path.clone().unwrap_or_else(|| "./exitbook-core/config/default.toml".to_string());
			let mut settings = Self::settings_from_file_and_env(&path)?;
			apply_cli_overrides(&mut settings, &opts);
			settings
		};

		settings.validate_settings()?;
		Ok(settings)
	}
}

fn apply_cli_overrides(settings: &mut CoreSettings, opts: &CoreCommandLineOptions) {
	if let Some(database_url) = &opts.database_url {
		settings.persistence.database_url = database_url.clone();
	}
	if let Some(dedup_capacity) = opts.dedup_capacity {
		settings.providers.dedup_capacity = dedup_capacity;
	}
}
