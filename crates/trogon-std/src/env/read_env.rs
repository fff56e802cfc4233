use std::env;

/// Source of environment variables.
///
/// Implementations are not required to be `Send + Sync`; add the bounds where
/// a value crosses threads:
///
/// ```ignore
/// fn load<E: ReadEnv + Send + Sync + 'static>(env: Arc<E>) { … }
/// ```
pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError>;
}
