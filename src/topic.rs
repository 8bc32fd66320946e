//! Device topic layout
//!
//! Devices publish on `devices/{deviceId}/data` and receive commands on
//! `devices/{deviceId}/command`. Only the first two segments are needed to
//! identify the device.

/// Root segment shared by all device topics
pub const DEVICE_TOPIC_PREFIX: &str = "devices";

/// Last segment of a device-data topic
pub const DATA_SUFFIX: &str = "data";

/// Placeholder substituted by [`render`]
pub const DEVICE_ID_PLACEHOLDER: &str = "{deviceId}";

/// Extract the device id from a `devices/{deviceId}/...` topic
///
/// Returns `None` for topics with fewer than three segments, a foreign
/// prefix, or an empty id segment.
///
/// ```
/// use device_monitor::topic::extract_device_id;
///
/// assert_eq!(extract_device_id("devices/abc123/data"), Some("abc123"));
/// assert_eq!(extract_device_id("devices/data"), None);
/// ```
pub fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() < 3 || parts[0] != DEVICE_TOPIC_PREFIX {
        return None;
    }

    let device_id = parts[1].trim();
    if device_id.is_empty() {
        return None;
    }

    Some(device_id)
}

/// Whether the topic carries device telemetry
pub fn is_device_data_topic(topic: &str) -> bool {
    topic.starts_with(&format!("{DEVICE_TOPIC_PREFIX}/"))
        && topic.ends_with(&format!("/{DATA_SUFFIX}"))
}

/// Fill the `{deviceId}` placeholder of a topic template
pub fn render(template: &str, device_id: &str) -> String {
    template.replace(DEVICE_ID_PLACEHOLDER, device_id)
}
