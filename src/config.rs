use figment::Figment;
use figment::providers::Env;

/// Configuration source: environment variables prefixed with `OXIFORWARD_`.
///
/// Nested keys are separated by a double underscore, e.g. `OXIFORWARD_ENDPOINT__HOST`
/// or `OXIFORWARD_OPTIONS__IDLE_TIMEOUT=30s`.
pub fn get_config() -> Figment {
    Figment::new().merge(Env::prefixed("OXIFORWARD_").split("__"))
}
