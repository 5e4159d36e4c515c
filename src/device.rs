//! Typed device and service model built from UPnP description documents.
//!
//! A description document nests devices inside devices; each level can host
//! services. The tree is parsed once per discovery event and is immutable
//! afterwards, except for the advertised lifetime which the owning registry
//! counts down.

use std::sync::Arc;

use xmltree::Element;

use crate::error::{UpnpError, UpnpResult};
use crate::transport::ControlPoint;
use crate::xml::{child_with_name, children_with_name, node_text};

/// One controllable service hosted by a device. Immutable after parse.
#[derive(Debug, Clone)]
pub struct UpnpService {
    service_type: String,
    control_url: String,
    event_sub_url: String,
}

impl UpnpService {
    /// Build a service from a `<service>` element.
    ///
    /// Never fails: absent fields collapse to URLs equal to `base_url`.
    pub fn parse(node: &Element, base_url: &str) -> Self {
        Self {
            service_type: node_text(child_with_name(node, "servicetype")),
            control_url: format!(
                "{}{}",
                base_url,
                node_text(child_with_name(node, "controlurl"))
            ),
            event_sub_url: format!(
                "{}{}",
                base_url,
                node_text(child_with_name(node, "eventsuburl"))
            ),
        }
    }

    /// Service type URN, e.g. `urn:schemas-upnp-org:service:WANIPConnection:1`.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Absolute URL actions are posted to.
    pub fn control_url(&self) -> &str {
        &self.control_url
    }

    /// Absolute URL for event subscriptions.
    pub fn event_sub_url(&self) -> &str {
        &self.event_sub_url
    }

    /// Ask the gateway whether this connection service is up, via the
    /// `GetStatusInfo` action.
    ///
    /// Transport failures surface as [`UpnpError::ActionFailed`]; a response
    /// without the expected elements as [`UpnpError::MalformedResponse`].
    pub async fn is_connected(&self, control_point: &dyn ControlPoint) -> UpnpResult<bool> {
        let body = control_point
            .send_action(&self.control_url, &self.service_type, "GetStatusInfo")
            .await?;

        let info = child_with_name(&body, "GetStatusInfoResponse")
            .ok_or_else(|| UpnpError::MalformedResponse("GetStatusInfoResponse".to_string()))?;
        let status = child_with_name(info, "NewConnectionStatus")
            .ok_or_else(|| UpnpError::MalformedResponse("NewConnectionStatus".to_string()))?;

        Ok(node_text(Some(status)).eq_ignore_ascii_case("connected"))
    }
}

/// One UPnP device, possibly nesting embedded devices and hosted services.
#[derive(Debug, Clone)]
pub struct UpnpDevice {
    friendly_name: String,
    device_type: String,
    udn: String,
    expiration: u32,
    devices: Vec<UpnpDevice>,
    services: Vec<Arc<UpnpService>>,
}

impl UpnpDevice {
    /// Recursively build a device tree from a `<device>` element.
    ///
    /// The UDN is the device's sole identity for registry deduplication, so
    /// a missing one fails the whole tree. Children keep document order and
    /// inherit `base_url` and `expiration` unchanged.
    pub fn parse(node: &Element, base_url: &str, expiration: u32) -> UpnpResult<Self> {
        let udn = node_text(child_with_name(node, "udn"));
        if udn.is_empty() {
            return Err(UpnpError::InvalidDevice("missing UDN".to_string()));
        }

        let mut devices = Vec::new();
        if let Some(list) = child_with_name(node, "devicelist") {
            for child in children_with_name(list, "device") {
                devices.push(UpnpDevice::parse(child, base_url, expiration)?);
            }
        }

        let mut services = Vec::new();
        if let Some(list) = child_with_name(node, "servicelist") {
            for child in children_with_name(list, "service") {
                services.push(Arc::new(UpnpService::parse(child, base_url)));
            }
        }

        Ok(Self {
            friendly_name: node_text(child_with_name(node, "friendlyname")),
            device_type: node_text(child_with_name(node, "devicetype")),
            udn,
            expiration,
            devices,
            services,
        })
    }

    /// Human-readable device name, possibly empty.
    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    /// Device type URN as advertised in the description.
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Unique Device Name, the stable identity key. Never empty.
    pub fn udn(&self) -> &str {
        &self.udn
    }

    /// Remaining seconds of the advertised lifetime.
    pub fn expiration(&self) -> u32 {
        self.expiration
    }

    /// Update the remaining lifetime.
    ///
    /// Embedded devices share the root advertisement's TTL, so the value
    /// propagates recursively to the whole tree.
    pub fn set_expiration(&mut self, seconds: u32) {
        self.expiration = seconds;
        for device in &mut self.devices {
            device.set_expiration(seconds);
        }
    }

    /// Embedded child devices, in document order.
    pub fn embedded_devices(&self) -> &[UpnpDevice] {
        &self.devices
    }

    /// Services hosted directly by this device, in document order.
    pub fn services(&self) -> &[Arc<UpnpService>] {
        &self.services
    }

    /// Collect every service in the tree whose type is exactly
    /// `service_type`, own services before embedded devices, depth-first.
    ///
    /// Exact comparison on purpose: service URNs are not matched with the
    /// prefix-tolerant rule used for device types.
    pub fn services_by_type(&self, service_type: &str, out: &mut Vec<Arc<UpnpService>>) {
        for service in &self.services {
            if service.service_type == service_type {
                out.push(Arc::clone(service));
            }
        }
        for device in &self.devices {
            device.services_by_type(service_type, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WANIP: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

    fn parse_device(xml: &str, expiration: u32) -> UpnpResult<UpnpDevice> {
        let node = Element::parse(xml.as_bytes()).expect("test XML must parse");
        UpnpDevice::parse(&node, "http://192.168.1.1:5000", expiration)
    }

    fn gateway_xml() -> String {
        format!(
            r#"<device>
                 <friendlyName>Home Router</friendlyName>
                 <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
                 <UDN>uuid:igd-1</UDN>
                 <deviceList>
                   <device>
                     <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
                     <UDN>uuid:wan-1</UDN>
                     <deviceList>
                       <device>
                         <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
                         <UDN>uuid:wanconn-1</UDN>
                         <serviceList>
                           <service>
                             <serviceType>{WANIP}</serviceType>
                             <controlURL>/ctl/ip</controlURL>
                             <eventSubURL>/evt/ip</eventSubURL>
                           </service>
                         </serviceList>
                       </device>
                     </deviceList>
                   </device>
                 </deviceList>
                 <serviceList>
                   <service>
                     <serviceType>{WANIP}</serviceType>
                     <controlURL>/ctl/root</controlURL>
                   </service>
                 </serviceList>
               </device>"#
        )
    }

    #[test]
    fn parses_nested_devices_and_resolves_urls() {
        let device = parse_device(&gateway_xml(), 1800).unwrap();

        assert_eq!(device.friendly_name(), "Home Router");
        assert_eq!(device.udn(), "uuid:igd-1");
        assert_eq!(device.expiration(), 1800);
        assert_eq!(device.embedded_devices().len(), 1);

        let wan = &device.embedded_devices()[0];
        assert_eq!(wan.udn(), "uuid:wan-1");
        assert_eq!(wan.expiration(), 1800);

        let conn = &wan.embedded_devices()[0];
        let service = &conn.services()[0];
        assert_eq!(service.service_type(), WANIP);
        assert_eq!(service.control_url(), "http://192.168.1.1:5000/ctl/ip");
        assert_eq!(service.event_sub_url(), "http://192.168.1.1:5000/evt/ip");
    }

    #[test]
    fn missing_udn_fails_no_matter_how_complete_the_rest_is() {
        let result = parse_device(
            r#"<device>
                 <friendlyName>Router</friendlyName>
                 <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
                 <serviceList>
                   <service><serviceType>x</serviceType></service>
                 </serviceList>
               </device>"#,
            60,
        );

        assert!(matches!(result, Err(UpnpError::InvalidDevice(_))));
    }

    #[test]
    fn missing_udn_in_a_nested_device_fails_the_whole_tree() {
        let result = parse_device(
            r#"<device>
                 <UDN>uuid:root</UDN>
                 <deviceList>
                   <device><friendlyName>anonymous</friendlyName></device>
                 </deviceList>
               </device>"#,
            60,
        );

        assert!(matches!(result, Err(UpnpError::InvalidDevice(_))));
    }

    #[test]
    fn absent_service_fields_yield_the_bare_base_url() {
        let device = parse_device(
            r#"<device>
                 <UDN>uuid:root</UDN>
                 <serviceList><service/></serviceList>
               </device>"#,
            60,
        )
        .unwrap();

        let service = &device.services()[0];
        assert_eq!(service.service_type(), "");
        assert_eq!(service.control_url(), "http://192.168.1.1:5000");
        assert_eq!(service.event_sub_url(), "http://192.168.1.1:5000");
    }

    #[test]
    fn service_collection_is_exact_and_in_document_order() {
        let device = parse_device(&gateway_xml(), 1800).unwrap();

        let mut services = Vec::new();
        device.services_by_type(WANIP, &mut services);
        let urls: Vec<&str> = services.iter().map(|s| s.control_url()).collect();
        // Own services first, then depth-first into embedded devices.
        assert_eq!(
            urls,
            vec![
                "http://192.168.1.1:5000/ctl/root",
                "http://192.168.1.1:5000/ctl/ip",
            ]
        );

        // Case-sensitive: a differently cased type URN collects nothing.
        let mut none = Vec::new();
        device.services_by_type(&WANIP.to_uppercase(), &mut none);
        assert!(none.is_empty());
    }

    #[test]
    fn expiration_propagates_through_every_level() {
        let mut device = parse_device(&gateway_xml(), 1800).unwrap();

        device.set_expiration(42);

        assert_eq!(device.expiration(), 42);
        let wan = &device.embedded_devices()[0];
        assert_eq!(wan.expiration(), 42);
        assert_eq!(wan.embedded_devices()[0].expiration(), 42);
    }
}
