//! Tag-name traversal over parsed UPnP description documents.
//!
//! UPnP stacks in the wild emit element names with arbitrary case and
//! sometimes a namespace prefix (`u:deviceType`). Every lookup here
//! tolerates both, and absent elements read as empty strings rather than
//! errors: only identity-critical fields are validated by callers.

use xmltree::{Element, XMLNode};

/// Compare a name coming off the wire against an expected one.
///
/// Matches ASCII-case-insensitively, and additionally accepts a `prefix:`
/// qualifier on the candidate: a search for `devicetype` matches a node
/// literally named `u:deviceType`.
pub fn upnp_name_matches(candidate: &str, wanted: &str) -> bool {
    if candidate.eq_ignore_ascii_case(wanted) {
        return true;
    }
    match candidate.find(':') {
        Some(idx) => candidate[idx + 1..].eq_ignore_ascii_case(wanted),
        None => false,
    }
}

/// All direct element children of `parent` whose tag matches `name`, in
/// document order.
pub fn children_with_name<'a>(parent: &'a Element, name: &str) -> Vec<&'a Element> {
    parent
        .children
        .iter()
        .filter_map(|node| match node {
            XMLNode::Element(child) if upnp_name_matches(&child.name, name) => Some(child),
            _ => None,
        })
        .collect()
}

/// First direct element child of `parent` whose tag matches `name`.
pub fn child_with_name<'a>(parent: &'a Element, name: &str) -> Option<&'a Element> {
    parent.children.iter().find_map(|node| match node {
        XMLNode::Element(child) if upnp_name_matches(&child.name, name) => Some(child),
        _ => None,
    })
}

/// Text content of a node. Absent node, absent text, or an empty element
/// all yield an empty string.
pub fn node_text(node: Option<&Element>) -> String {
    node.and_then(|n| n.get_text())
        .map(|text| text.into_owned())
        .unwrap_or_default()
}

/// Pre-order search of the whole document for a `<device>` element whose
/// `deviceType` matches `device_type`. Short-circuits on the first match.
///
/// The type comparison uses [`upnp_name_matches`], so prefixed or oddly
/// cased URNs in the document still match the canonical type string.
pub fn find_device<'a>(root: &'a Element, device_type: &str) -> Option<&'a Element> {
    for node in &root.children {
        let XMLNode::Element(child) = node else {
            continue;
        };

        if child.name.eq_ignore_ascii_case("device") {
            let type_text = node_text(child_with_name(child, "devicetype"));
            if upnp_name_matches(&type_text, device_type) {
                return Some(child);
            }
        }

        if let Some(found) = find_device(child, device_type) {
            return Some(found);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const IGD_TYPE: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

    fn parse(xml: &str) -> Element {
        Element::parse(xml.as_bytes()).expect("test XML must parse")
    }

    #[test]
    fn name_matching_is_case_insensitive() {
        assert!(upnp_name_matches("deviceType", "devicetype"));
        assert!(upnp_name_matches("DEVICETYPE", "devicetype"));
        assert!(!upnp_name_matches("deviceType", "servicetype"));
    }

    #[test]
    fn name_matching_tolerates_namespace_prefix() {
        assert!(upnp_name_matches("u:deviceType", "devicetype"));
        assert!(upnp_name_matches("dlna:X_DLNADOC", "x_dlnadoc"));
        // The prefix is only stripped from the candidate, never the query.
        assert!(!upnp_name_matches("deviceType", "u:devicetype"));
    }

    #[test]
    fn urn_matching_handles_prefixed_and_uppercased_values() {
        assert!(upnp_name_matches(
            "URN:SCHEMAS-UPNP-ORG:DEVICE:InternetGatewayDevice:1",
            IGD_TYPE
        ));
        assert!(upnp_name_matches(
            "u:urn:schemas-upnp-org:device:internetgatewaydevice:1",
            IGD_TYPE
        ));
        assert!(!upnp_name_matches(
            "urn:schemas-upnp-org:device:WANDevice:1",
            IGD_TYPE
        ));
    }

    #[test]
    fn children_lookup_is_tolerant_and_ordered() {
        let root = parse(
            r#"<list xmlns:u="urn:x">
                 <item>one</item>
                 <u:Item>two</u:Item>
                 <other>skip</other>
                 <ITEM>three</ITEM>
               </list>"#,
        );

        let items = children_with_name(&root, "item");
        let texts: Vec<String> = items.iter().map(|e| node_text(Some(e))).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);

        assert_eq!(node_text(child_with_name(&root, "item")), "one");
        assert!(child_with_name(&root, "missing").is_none());
    }

    #[test]
    fn node_text_of_absent_or_empty_node_is_empty() {
        let root = parse("<root><empty/></root>");
        assert_eq!(node_text(None), "");
        assert_eq!(node_text(child_with_name(&root, "empty")), "");
    }

    #[test]
    fn find_device_walks_nested_trees_in_preorder() {
        let root = parse(&format!(
            r#"<root xmlns:u="urn:x">
                 <specVersion><major>1</major></specVersion>
                 <device>
                   <deviceType>urn:schemas-upnp-org:device:Basic:1</deviceType>
                   <deviceList>
                     <device>
                       <u:deviceType>{}</u:deviceType>
                       <friendlyName>router</friendlyName>
                     </device>
                   </deviceList>
                 </device>
               </root>"#,
            IGD_TYPE.to_uppercase()
        ));

        let found = find_device(&root, IGD_TYPE).expect("nested gateway should be found");
        assert_eq!(node_text(child_with_name(found, "friendlyname")), "router");
    }

    #[test]
    fn find_device_returns_none_without_a_matching_type() {
        let root = parse(
            r#"<root>
                 <device>
                   <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
                 </device>
               </root>"#,
        );
        assert!(find_device(&root, IGD_TYPE).is_none());
    }
}
