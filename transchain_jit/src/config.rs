//! Translation-chain and code-cache configuration.
//!
//! Both structs are resolved once at startup and copied into the objects
//! that need them; nothing rereads the environment afterwards.

// =============================================================================
// Chain Configuration
// =============================================================================

/// Default cap on translations per source location.
pub const DEFAULT_MAX_TRANSLATIONS: usize = 12;

/// Settings that govern how source records grow and are invalidated.
///
/// # Example
///
/// ```
/// use transchain_jit::ChainConfig;
///
/// let config = ChainConfig {
///     max_translations: 4,
///     ..Default::default()
/// };
/// assert!(config.allows_invalidation());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainConfig {
    /// Maximum number of translations a single source record may hold.
    ///
    /// The driver enforces this; source records only assert it. One extra
    /// translation past the limit (the interpreter fallback) is tolerated.
    ///
    /// Default: 12
    pub max_translations: usize,

    /// Whole-program mode where incoming branches can span the entire cache.
    ///
    /// Default: false
    pub repo_authoritative: bool,

    /// Profile-guided mode. Permits invalidation even when
    /// `repo_authoritative` is set.
    ///
    /// Default: false
    pub pgo: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_translations: DEFAULT_MAX_TRANSLATIONS,
            repo_authoritative: false,
            pgo: false,
        }
    }
}

impl ChainConfig {
    /// Resolve configuration from `TRANSCHAIN_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_translations = lookup("TRANSCHAIN_MAX_TRANSLATIONS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(defaults.max_translations);

        Self {
            max_translations,
            repo_authoritative: env_bool(&lookup, "TRANSCHAIN_REPO_AUTHORITATIVE"),
            pgo: env_bool(&lookup, "TRANSCHAIN_PGO"),
        }
    }

    /// Whether `replace_old_translations` may run under this configuration.
    #[inline]
    pub fn allows_invalidation(&self) -> bool {
        !self.repo_authoritative || self.pgo
    }
}

/// Check if a variable is set to a non-empty, truthy value.
#[inline]
fn env_bool<F>(lookup: &F, var: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

// =============================================================================
// Code Cache Configuration
// =============================================================================

/// Sizes and protection of the translation cache blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheConfig {
    /// Hot code. Default: 4MB
    pub main_size: usize,
    /// Rarely taken paths. Default: 1MB
    pub cold_size: usize,
    /// Stubs that are never expected to run. Default: 1MB
    pub frozen_size: usize,
    /// Map blocks read-write-execute. Tests that only inspect bytes leave
    /// this off. Default: true
    pub executable: bool,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            main_size: 4 * 1024 * 1024,
            cold_size: 1024 * 1024,
            frozen_size: 1024 * 1024,
            executable: true,
        }
    }
}

impl CodeCacheConfig {
    /// Small, non-executable blocks for tests and tooling.
    pub fn for_testing() -> Self {
        Self {
            main_size: 64 * 1024,
            cold_size: 16 * 1024,
            frozen_size: 16 * 1024,
            executable: false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
