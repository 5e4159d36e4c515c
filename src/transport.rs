//! Discovery transport: the SSDP/HTTP/SOAP surface the mapper drives.
//!
//! The mapper never touches sockets directly; it talks to a [`ControlPoint`].
//! [`SsdpControlPoint`] is the production implementation: M-SEARCH over UDP
//! multicast, a NOTIFY listener for unsolicited advertisements, description
//! fetch over HTTP and SOAP actions posted to a service's control URL.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use xmltree::Element;

use crate::error::{UpnpError, UpnpResult};
use crate::xml::child_with_name;

const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_PORT: u16 = 1900;

/// Lifetime assumed when an advertisement carries no `max-age`.
const DEFAULT_MAX_AGE: u32 = 1800;

/// What kind of discovery event arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    /// Unsolicited `ssdp:alive` advertisement.
    Alive,
    /// Response to an outstanding search.
    SearchResult,
    /// `ssdp:byebye`: a device announcing its departure.
    ByeBye,
    /// A search window closed.
    SearchTimeout,
    /// GENA event notification from a subscribed service.
    EventReceived,
}

/// One discovery event, delivered on the transport's own task.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    /// Event kind.
    pub kind: DiscoveryEventKind,
    /// URL of the device description document. Empty for events that carry
    /// none (timeouts, transport errors).
    pub location: String,
    /// Advertised lifetime in seconds (`CACHE-CONTROL: max-age`).
    pub expires: u32,
    /// Transport-level error code; zero on success.
    pub error_code: i32,
}

/// Callback sink receiving discovery events.
///
/// Invoked on the transport's own task; implementations must hand off any
/// blocking or long-running work instead of doing it inline.
pub type EventSink = Arc<dyn Fn(DiscoveryEvent) + Send + Sync>;

/// The SSDP/HTTP/SOAP operations the discovery engine needs.
#[async_trait]
pub trait ControlPoint: Send + Sync {
    /// Register the sink that receives all future discovery events,
    /// replacing any previous one.
    fn register(&self, sink: EventSink) -> UpnpResult<()>;

    /// Drop the registered sink; no further events are delivered.
    fn deregister(&self);

    /// Issue an asynchronous search for `target`, delivering results to the
    /// registered sink over the next `window`. Returns as soon as the
    /// search is underway; results arrive via the sink.
    async fn search(&self, target: &str, window: Duration) -> UpnpResult<()>;

    /// Fetch and parse the description document at `location`.
    async fn fetch_description(&self, location: &str) -> UpnpResult<Element>;

    /// Invoke `action` against `control_url`, with `service_type` as the
    /// SOAP namespace. Returns the envelope `Body` element of the response.
    async fn send_action(
        &self,
        control_url: &str,
        service_type: &str,
        action: &str,
    ) -> UpnpResult<Element>;
}

struct SsdpInner {
    sink: RwLock<Option<EventSink>>,
    http: reqwest::Client,
}

impl SsdpInner {
    fn deliver(&self, event: DiscoveryEvent) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }
}

/// Production control point speaking SSDP over UDP multicast, with
/// description fetch and SOAP actions over HTTP.
pub struct SsdpControlPoint {
    inner: Arc<SsdpInner>,
    notify_task: Mutex<Option<JoinHandle<()>>>,
}

impl SsdpControlPoint {
    /// Create a control point. Call [`SsdpControlPoint::listen`] to also
    /// receive unsolicited alive/byebye advertisements.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SsdpInner {
                sink: RwLock::new(None),
                http: reqwest::Client::new(),
            }),
            notify_task: Mutex::new(None),
        }
    }

    /// Bind the SSDP multicast group and start forwarding NOTIFY
    /// advertisements to the registered sink.
    pub async fn listen(&self) -> UpnpResult<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, SSDP_PORT)).await?;
        socket.join_multicast_v4(SSDP_MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, _addr)) => {
                        let message = String::from_utf8_lossy(&buf[..len]);
                        if let Some(event) = parse_notify(&message) {
                            inner.deliver(event);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("SSDP notify listener stopped: {}", e);
                        break;
                    }
                }
            }
        });
        *self.notify_task.lock() = Some(task);

        tracing::debug!("listening for SSDP advertisements on port {}", SSDP_PORT);
        Ok(())
    }
}

impl Default for SsdpControlPoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SsdpControlPoint {
    fn drop(&mut self) {
        if let Some(task) = self.notify_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ControlPoint for SsdpControlPoint {
    fn register(&self, sink: EventSink) -> UpnpResult<()> {
        *self.inner.sink.write() = Some(sink);
        Ok(())
    }

    fn deregister(&self) {
        *self.inner.sink.write() = None;
        if let Some(task) = self.notify_task.lock().take() {
            task.abort();
        }
    }

    async fn search(&self, target: &str, window: Duration) -> UpnpResult<()> {
        // Bind here so setup failures reach the caller; the receive loop
        // itself is fire-and-forget.
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let inner = Arc::clone(&self.inner);
        let target = target.to_string();

        tokio::spawn(async move {
            if let Err(e) = run_search(&inner, socket, &target, window).await {
                tracing::warn!("SSDP search for '{}' failed: {}", target, e);
            }
        });
        Ok(())
    }

    async fn fetch_description(&self, location: &str) -> UpnpResult<Element> {
        let response = self.inner.http.get(location).send().await?;
        let xml = response.error_for_status()?.text().await?;
        Ok(Element::parse(xml.as_bytes())?)
    }

    async fn send_action(
        &self,
        control_url: &str,
        service_type: &str,
        action: &str,
    ) -> UpnpResult<Element> {
        let soap_action = format!("\"{}#{}\"", service_type, action);
        let envelope = format!(
            r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:{action} xmlns:u="{service_type}"/></s:Body>
</s:Envelope>"#,
        );

        let response = self
            .inner
            .http
            .post(control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", soap_action)
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpnpError::ActionFailed {
                action: action.to_string(),
                code: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("HTTP request failed")
                    .to_string(),
            });
        }

        let text = response.text().await?;
        let parsed = Element::parse(text.as_bytes())?;
        let body = child_with_name(&parsed, "Body")
            .ok_or_else(|| UpnpError::MalformedResponse("SOAP Body".to_string()))?;
        Ok(body.clone())
    }
}

async fn run_search(
    inner: &SsdpInner,
    socket: UdpSocket,
    target: &str,
    window: Duration,
) -> UpnpResult<()> {
    let mx = window.as_secs().clamp(1, 5);
    let request = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}:{SSDP_PORT}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx}\r\n\
         ST: {target}\r\n\r\n",
    );
    socket
        .send_to(request.as_bytes(), (SSDP_MULTICAST_ADDR, SSDP_PORT))
        .await?;

    let deadline = Instant::now() + window;
    let mut buf = vec![0u8; 1500];

    while Instant::now() < deadline {
        match timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _addr))) => {
                let response = String::from_utf8_lossy(&buf[..len]);
                if let Some(event) = parse_search_response(&response) {
                    inner.deliver(event);
                }
            }
            Ok(Err(e)) => {
                // Let the engine see the failure through its normal
                // event-validation path before giving up on this window.
                inner.deliver(DiscoveryEvent {
                    kind: DiscoveryEventKind::SearchResult,
                    location: String::new(),
                    expires: 0,
                    error_code: e.raw_os_error().unwrap_or(-1),
                });
                return Err(e.into());
            }
            Err(_) => continue,
        }
    }

    inner.deliver(DiscoveryEvent {
        kind: DiscoveryEventKind::SearchTimeout,
        location: String::new(),
        expires: 0,
        error_code: 0,
    });
    Ok(())
}

/// First header matching `name` (case-insensitive), trimmed.
fn header_value<'a>(message: &'a str, name: &str) -> Option<&'a str> {
    message.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn parse_max_age(cache_control: &str) -> Option<u32> {
    for part in cache_control.split(',') {
        if let Some((key, age)) = part.split_once('=') {
            if key.trim().eq_ignore_ascii_case("max-age") {
                return age.trim().parse().ok();
            }
        }
    }
    None
}

fn parse_search_response(response: &str) -> Option<DiscoveryEvent> {
    let location = header_value(response, "location")?.to_string();
    let expires = header_value(response, "cache-control")
        .and_then(parse_max_age)
        .unwrap_or(DEFAULT_MAX_AGE);

    Some(DiscoveryEvent {
        kind: DiscoveryEventKind::SearchResult,
        location,
        expires,
        error_code: 0,
    })
}

fn parse_notify(message: &str) -> Option<DiscoveryEvent> {
    if !message.starts_with("NOTIFY") {
        return None;
    }

    let nts = header_value(message, "nts")?;
    if nts.eq_ignore_ascii_case("ssdp:byebye") {
        return Some(DiscoveryEvent {
            kind: DiscoveryEventKind::ByeBye,
            location: header_value(message, "location")
                .unwrap_or_default()
                .to_string(),
            expires: 0,
            error_code: 0,
        });
    }
    if !nts.eq_ignore_ascii_case("ssdp:alive") {
        return None;
    }

    let location = header_value(message, "location")?.to_string();
    let expires = header_value(message, "cache-control")
        .and_then(parse_max_age)
        .unwrap_or(DEFAULT_MAX_AGE);

    Some(DiscoveryEvent {
        kind: DiscoveryEventKind::Alive,
        location,
        expires,
        error_code: 0,
    })
}
