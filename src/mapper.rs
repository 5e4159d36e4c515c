//! Gateway registry, discovery engine and port-mapping coordinator.
//!
//! Two independent tasks touch the registry: the transport's callback task
//! inserting freshly parsed gateways, and the sweep task aging them. Both
//! take the same lock for the whole read-modify-write span, and neither
//! holds it across network I/O: description fetches happen before the
//! insert, connectivity probes after the snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::device::{UpnpDevice, UpnpService};
use crate::error::{UpnpError, UpnpResult};
use crate::transport::{ControlPoint, DiscoveryEvent, DiscoveryEventKind, SsdpControlPoint};
use crate::xml::{child_with_name, find_device, node_text};

/// Root device class of a NAT router.
pub const INTERNET_GATEWAY_DEVICE: &str =
    "urn:schemas-upnp-org:device:InternetGatewayDevice:1";
/// WAN side of a gateway. Declared for completeness; gateway matching
/// happens on the root IGD type.
pub const WAN_DEVICE: &str = "urn:schemas-upnp-org:device:WANDevice:1";
/// Port-mapping service on routed connections.
pub const WAN_IP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
/// Port-mapping service on PPP links.
pub const WAN_PPP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";

/// Tunables for the discovery engine.
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// SSDP target of the initial search.
    pub search_target: String,
    /// Window of the initial root-device search.
    pub search_timeout: Duration,
    /// Expiration sweep period. Also the window of renewal searches, and
    /// renewals fire once the remaining lifetime drops to twice this value.
    pub sweep_period: Duration,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            search_target: "upnp:rootdevice".to_string(),
            search_timeout: Duration::from_secs(5),
            sweep_period: Duration::from_secs(10),
        }
    }
}

/// Discovers Internet Gateway Devices and keeps their port-mapping services
/// under watch for the lifetime of the tunnel.
///
/// Construction starts discovery immediately; [`PortMapper::shutdown`] (or
/// dropping the mapper) stops it.
pub struct PortMapper {
    inner: Arc<MapperInner>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    closed_rx: watch::Receiver<Option<String>>,
}

struct MapperInner {
    config: MapperConfig,
    local_port: u16,
    control_point: Arc<dyn ControlPoint>,
    devices: Mutex<HashMap<String, UpnpDevice>>,
    closed_tx: watch::Sender<Option<String>>,
}

impl PortMapper {
    /// Build the production SSDP transport, start its advertisement
    /// listener and begin discovery on behalf of `local_port`.
    pub async fn start(local_port: u16) -> UpnpResult<Self> {
        let control_point = Arc::new(SsdpControlPoint::new());
        control_point
            .listen()
            .await
            .map_err(|e| UpnpError::Registration(e.to_string()))?;
        Self::new(control_point, local_port)
    }

    /// Create a mapper over an already-initialized transport and start
    /// discovery immediately.
    pub fn new(control_point: Arc<dyn ControlPoint>, local_port: u16) -> UpnpResult<Self> {
        Self::with_config(control_point, local_port, MapperConfig::default())
    }

    /// Like [`PortMapper::new`] with explicit tunables.
    pub fn with_config(
        control_point: Arc<dyn ControlPoint>,
        local_port: u16,
        config: MapperConfig,
    ) -> UpnpResult<Self> {
        let (closed_tx, closed_rx) = watch::channel(None);
        let inner = Arc::new(MapperInner {
            config,
            local_port,
            control_point,
            devices: Mutex::new(HashMap::new()),
            closed_tx,
        });

        let sink_inner = Arc::clone(&inner);
        inner
            .control_point
            .register(Arc::new(move |event| sink_inner.on_discovery_event(event)))
            .map_err(|e| UpnpError::Registration(e.to_string()))?;

        tracing::info!(
            "port mapper started, searching for gateways (local port {})",
            inner.local_port
        );

        let search_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let target = search_inner.config.search_target.clone();
            let window = search_inner.config.search_timeout;
            if let Err(e) = search_inner.control_point.search(&target, window).await {
                tracing::warn!("initial gateway search failed: {}", e);
            }
        });

        let sweep_inner = Arc::clone(&inner);
        let sweep_task = tokio::spawn(async move {
            // The sweep is the subsystem's heartbeat; it only returns on a
            // fatal error, which callers observe through `closed()`.
            if let Err(e) = sweep_inner.run_sweep().await {
                tracing::error!("expiration sweep failed: {}", e);
                let _ = sweep_inner.closed_tx.send(Some(e.to_string()));
            }
        });

        Ok(Self {
            inner,
            sweep_task: Mutex::new(Some(sweep_task)),
            closed_rx,
        })
    }

    /// Local port the eventual mapping lease will expose.
    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    /// UDNs of every currently registered gateway.
    pub fn registered_udns(&self) -> Vec<String> {
        self.inner.devices.lock().keys().cloned().collect()
    }

    /// Resolves if the subsystem's heartbeat dies, with the fatal error.
    /// The caller should shut down or restart the mapper at that point.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "port mapper shut down".to_string();
            }
        }
    }

    /// Stop the sweep task and detach from the transport. Idempotent.
    pub fn shutdown(&self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
        self.inner.control_point.deregister();
    }
}

impl Drop for PortMapper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MapperInner {
    /// Dispatched on the transport's own task, so it must return quickly:
    /// anything touching the network moves to a freshly spawned task.
    fn on_discovery_event(self: &Arc<Self>, event: DiscoveryEvent) {
        match event.kind {
            DiscoveryEventKind::Alive | DiscoveryEventKind::SearchResult => {
                if event.error_code != 0 {
                    tracing::warn!("{}", UpnpError::Discovery(event.error_code));
                    return;
                }
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner
                        .handle_new_device(&event.location, event.expires)
                        .await
                    {
                        // One malformed advertisement must never take the
                        // subsystem down; drop the device and move on.
                        tracing::warn!("dropping gateway at {}: {}", event.location, e);
                    }
                });
            }
            // Recognized but left untouched pending a product decision on
            // whether byebye should remove the registry entry immediately.
            DiscoveryEventKind::ByeBye => {
                tracing::debug!("byebye from '{}' ignored", event.location);
            }
            DiscoveryEventKind::SearchTimeout => {
                tracing::debug!("search window closed");
            }
            DiscoveryEventKind::EventReceived => {}
        }
    }

    /// Fetch, parse and register the gateway described at `location`, then
    /// run a coordinator pass.
    ///
    /// Re-registering an already known (or just-expired) UDN is a plain
    /// replacement, so late fetches apply idempotently.
    async fn handle_new_device(&self, location: &str, expires: u32) -> UpnpResult<()> {
        let document = self.control_point.fetch_description(location).await?;

        let Some(node) = find_device(&document, INTERNET_GATEWAY_DEVICE) else {
            tracing::debug!("no gateway device in description at {}", location);
            return Ok(());
        };

        let mut base_url = node_text(child_with_name(&document, "urlbase"));
        if base_url.is_empty() {
            base_url = location.to_string();
        }

        let device = UpnpDevice::parse(node, &base_url, expires)?;
        let udn = device.udn().to_string();
        let friendly = device.friendly_name().to_string();
        self.devices.lock().insert(udn.clone(), device);
        tracing::info!(
            "registered gateway '{}' ({}, {}s lease)",
            friendly,
            udn,
            expires
        );

        self.update_mappings().await;
        Ok(())
    }

    /// Heartbeat: one aging pass per period, on an absolute schedule so
    /// execution jitter never accumulates. Never returns except on a fatal
    /// error.
    async fn run_sweep(&self) -> UpnpResult<()> {
        let period = self.config.sweep_period;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            ticker.tick().await;
            for udn in self.age_devices() {
                // Fire-and-forget: a failed renewal search just leaves the
                // entry to expire on a later sweep.
                if let Err(e) = self.control_point.search(&udn, period).await {
                    tracing::warn!("renewal search for {} failed: {}", udn, e);
                }
            }
        }
    }

    /// One aging pass under the registry lock: subtract a period from every
    /// device, dropping the expired ones. Returns the UDNs close enough to
    /// expiry to warrant a renewal search.
    fn age_devices(&self) -> Vec<String> {
        let period = self.config.sweep_period.as_secs() as u32;
        let renewal_window = period * 2;
        let mut renewals = Vec::new();

        let mut devices = self.devices.lock();
        devices.retain(|udn, device| {
            let remaining = device.expiration().saturating_sub(period);
            if remaining == 0 {
                tracing::info!("gateway {} expired", udn);
                return false;
            }
            device.set_expiration(remaining);
            if remaining <= renewal_window {
                renewals.push(udn.clone());
            }
            true
        });

        renewals
    }

    /// Coordinator pass: snapshot every port-mapping-capable service under
    /// the lock, then probe them with the lock released.
    async fn update_mappings(&self) {
        let services: Vec<Arc<UpnpService>> = {
            let devices = self.devices.lock();
            let mut services = Vec::new();
            for device in devices.values() {
                device.services_by_type(WAN_IP_CONNECTION, &mut services);
                device.services_by_type(WAN_PPP_CONNECTION, &mut services);
            }
            services
        };

        for service in services {
            match service.is_connected(self.control_point.as_ref()).await {
                Ok(connected) => {
                    tracing::info!(
                        "{} at {} is {}",
                        service.service_type(),
                        service.control_url(),
                        if connected { "connected" } else { "disconnected" }
                    );
                }
                // One unreachable service must not starve the rest of the
                // pass.
                Err(e) => {
                    tracing::warn!("status check failed for {}: {}", service.control_url(), e);
                }
            }
        }
    }
}
