use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::maintenance;

/// One engine (with its own WAL and compactor task) per tenant. The tenant
/// is the `database` parameter of the pgwire connection; engines are created
/// on first use and live for the rest of the process.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

/// Tenant names become WAL file names, so anything path-like is stripped.
fn wal_file_name(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(invalid("tenant name too long"));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    if safe.is_empty() {
        return Err(invalid("empty tenant name"));
    }
    Ok(format!("{safe}.wal"))
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Look up a tenant's engine, creating it (and replaying its WAL) on
    /// first sight.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(existing) = self.engines.get(tenant) {
            return Ok(existing.value().clone());
        }
        let wal_file = wal_file_name(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = Arc::new(Engine::new(self.data_dir.join(wal_file))?);
        let compactor = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            maintenance::run_compactor(compactor, threshold).await;
        });

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
