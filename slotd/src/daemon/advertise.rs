// mDNS advertisement of the control socket

use crate::daemon::protocol::PRODUCT_VERSION;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use tracing::{debug, info};

pub const SERVICE_TYPE: &str = "_xdk-app-daemon._tcp.local.";

/// Instance name used when the device has no configured name
pub const DEFAULT_INSTANCE: &str = "slotd";

pub struct Advertiser {
    daemon: ServiceDaemon,
    registered: Option<String>,
}

impl Advertiser {
    pub fn new() -> Result<Self, mdns_sd::Error> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            registered: None,
        })
    }

    /// Register (or re-register) the service for `port`
    pub fn advertise(&mut self, name: &str, port: u16) -> Result<(), mdns_sd::Error> {
        self.withdraw();

        let instance = if name.trim().is_empty() {
            DEFAULT_INSTANCE
        } else {
            name.trim()
        };
        let host = format!("{}.local.", host_label(instance));
        let mut txt = HashMap::new();
        txt.insert("name".to_string(), instance.to_string());
        txt.insert("version".to_string(), PRODUCT_VERSION.to_string());

        let service =
            ServiceInfo::new(SERVICE_TYPE, instance, &host, "", port, txt)?.enable_addr_auto();
        let fullname = service.get_fullname().to_string();
        self.daemon.register(service)?;
        info!(service = %fullname, port, "Advertised control socket");
        self.registered = Some(fullname);
        Ok(())
    }

    fn withdraw(&mut self) {
        if let Some(fullname) = self.registered.take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                debug!(service = %fullname, "Unregister failed: {}", e);
            }
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.withdraw();
        let _ = self.daemon.shutdown();
    }
}

/// Lowercase DNS label: alphanumerics kept, everything else becomes `-`
fn host_label(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        DEFAULT_INSTANCE.to_string()
    } else {
        label.chars().take(63).collect()
    }
}
