//! Engine configuration.
//!
//! Settings can be built in code with the `with_*` setters or read from the
//! environment with [`EngineConfig::from_env`]:
//!
//! | Variable | Field |
//! |---|---|
//! | `OPFORGE_BUILD_DIR` | `build_dir_name` |
//! | `OPFORGE_GPU_BACKEND` | `gpu_backend` |
//! | `OPFORGE_ASYNC_EXEC` | `async_exec` (`1`, `true`, `on`, `yes`) |

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`EngineConfig::build_dir_name`].
pub const ENV_BUILD_DIR: &str = "OPFORGE_BUILD_DIR";
/// Environment variable overriding [`EngineConfig::gpu_backend`].
pub const ENV_GPU_BACKEND: &str = "OPFORGE_GPU_BACKEND";
/// Environment variable overriding [`EngineConfig::async_exec`].
pub const ENV_ASYNC_EXEC: &str = "OPFORGE_ASYNC_EXEC";

/// Runtime settings shared by the build cache and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory, relative to each source file, holding artifacts and manifests.
    #[serde(default = "default_build_dir_name")]
    pub build_dir_name: String,

    /// Backend name used for the GPU context (`cuda`, `hip`, ...).
    #[serde(default = "default_gpu_backend")]
    pub gpu_backend: String,

    /// Route kernel calls through a glue's asynchronous engine when it has one.
    #[serde(default)]
    pub async_exec: bool,
}

fn default_build_dir_name() -> String {
    "build".to_string()
}

fn default_gpu_backend() -> String {
    "cuda".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_dir_name: default_build_dir_name(),
            gpu_backend: default_gpu_backend(),
            async_exec: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `OPFORGE_*` environment variables that are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(ENV_BUILD_DIR).filter(|v| !v.trim().is_empty()) {
            config.build_dir_name = dir;
        }
        if let Some(backend) = lookup(ENV_GPU_BACKEND).filter(|v| !v.trim().is_empty()) {
            config.gpu_backend = backend.trim().to_ascii_lowercase();
        }
        if let Some(flag) = lookup(ENV_ASYNC_EXEC) {
            config.async_exec = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "yes"
            );
        }
        config
    }

    /// Set the build directory name.
    pub fn with_build_dir_name(mut self, name: impl Into<String>) -> Self {
        self.build_dir_name = name.into();
        self
    }

    /// Set the GPU backend name.
    pub fn with_gpu_backend(mut self, backend: impl Into<String>) -> Self {
        self.gpu_backend = backend.into();
        self
    }

    /// Enable or disable asynchronous kernel execution.
    pub fn with_async_exec(mut self, enabled: bool) -> Self {
        self.async_exec = enabled;
        self
    }
}
