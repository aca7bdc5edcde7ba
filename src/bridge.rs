//! Bridge entry point.
//!
//! A [`Bridge`] resolves drivers from a registry and opens handles with the
//! bridge-wide TLS settings applied. One bridge is meant to be shared by
//! every execution context of the embedding runtime.

use crate::config::{ConnectionOptions, TlsConfig};
use crate::db::handle::DatabaseHandle;
use crate::db::registry::{self, DriverId, DriverRegistry};
use crate::error::DbResult;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

#[derive(Debug)]
pub struct Bridge {
    registry: Arc<DriverRegistry>,
    tls: RwLock<TlsConfig>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Bridge over the process-wide registry.
    pub fn new() -> Self {
        Self::with_registry(registry::global())
    }

    /// Bridge over the process-wide registry with the built-in drivers installed.
    pub fn with_default_drivers() -> DbResult<Self> {
        registry::install_default_drivers()?;
        Ok(Self::new())
    }

    pub fn with_registry(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            tls: RwLock::new(TlsConfig::default()),
        }
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Replace the TLS settings used by subsequent `open` calls.
    pub fn load_tls(&self, tls: TlsConfig) -> DbResult<()> {
        tls.validate()?;
        info!(
            enabled = tls.enable_tls,
            skip_verify = tls.insecure_skip_tls_verify,
            min_version = %tls.min_version,
            "Loaded TLS configuration"
        );
        *self.tls.write().unwrap_or_else(PoisonError::into_inner) = tls;
        Ok(())
    }

    /// Replace the TLS settings from a host-provided JSON object.
    pub fn load_tls_json(&self, value: serde_json::Value) -> DbResult<()> {
        self.load_tls(TlsConfig::from_json(value)?)
    }

    pub fn tls_config(&self) -> TlsConfig {
        self.tls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open a handle on `data_source` through the named driver.
    ///
    /// Fails only on configuration errors; connectivity problems surface on
    /// the first call.
    pub async fn open(
        &self,
        driver: impl Into<DriverId>,
        data_source: &str,
        options: Option<ConnectionOptions>,
    ) -> DbResult<DatabaseHandle> {
        let driver_id = driver.into();
        let driver = self.registry.resolve(&driver_id)?;
        let options = options.unwrap_or_default();
        let tls = self.tls_config();

        info!(
            driver = %driver_id,
            data_source = %mask_data_source(data_source),
            max_open = ?options.max_open(),
            max_idle = options.max_idle_or_default(),
            "Opening database handle"
        );

        let pool = driver.open(data_source, &options, &tls)?;
        Ok(DatabaseHandle::new(driver_id, pool, options))
    }
}

/// Hide the password in a data source before it is logged.
pub fn mask_data_source(data_source: &str) -> String {
    if let Ok(mut url) = url::Url::parse(data_source) {
        if url.password().is_some() && url.set_password(Some("****")).is_ok() {
            return url.to_string();
        }
    }

    // user:pass@tcp(host)/db and similar non-URL forms
    match (data_source.find(':'), data_source.rfind('@')) {
        (Some(colon), Some(at)) if colon < at && !data_source[..colon].contains('/') => {
            format!("{}:****{}", &data_source[..colon], &data_source[at..])
        }
        _ => data_source.to_string(),
    }
}
