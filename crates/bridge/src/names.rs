//! Topic and service naming.
//!
//! Relative names are placed under the node namespace, absolute names (leading
//! `/`) are used as given.

use crate::BridgeError;

/// Inbound camera stream.
pub const IMAGE_TOPIC: &str = "image_raw";

/// Outbound detection batches.
pub const DETECTIONS_TOPIC: &str = "detections";

/// Outbound annotated images.
pub const DETECTIONS_IMAGE_TOPIC: &str = "detections_img";

/// Enable/disable toggle.
pub const ENABLE_SERVICE: &str = "enable";

/// Open-vocabulary class redefinition.
pub const SET_CLASSES_SERVICE: &str = "set_classes";

pub fn resolve(namespace: &str, name: &str) -> Result<String, BridgeError> {
    validate(name)?;

    if name.starts_with('/') {
        return Ok(name.to_string());
    }

    let namespace = namespace.trim_matches('/');
    if namespace.is_empty() {
        Ok(format!("/{}", name))
    } else {
        validate(namespace)?;
        Ok(format!("/{}/{}", namespace, name))
    }
}

fn validate(name: &str) -> Result<(), BridgeError> {
    let invalid = |reason| {
        Err(BridgeError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.contains("//") {
        return invalid("name contains an empty segment");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/')
    {
        return invalid("only alphanumerics, '_' and '/' are allowed");
    }
    Ok(())
}
