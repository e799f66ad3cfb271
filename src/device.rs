//! Camera descriptor and device-type classification.

use serde::{Deserialize, Serialize};

/// Device family derived from a product number's first letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Camera,
    Speaker,
    Intercom,
    AccessControl,
    SystemDevice,
    Bodyworn,
    MountingHardware,
    Unknown,
    Other,
}

impl DeviceType {
    /// Classifies a `ProdNbr` by its first letter.
    pub fn from_product_number(product_number: &str) -> Self {
        match product_number.chars().next() {
            None => DeviceType::Unknown,
            Some(c) => match c.to_ascii_uppercase() {
                'M' | 'P' | 'Q' => DeviceType::Camera,
                'C' => DeviceType::Speaker,
                'I' => DeviceType::Intercom,
                'A' => DeviceType::AccessControl,
                'D' => DeviceType::SystemDevice,
                'W' => DeviceType::Bodyworn,
                'T' => DeviceType::MountingHardware,
                _ => DeviceType::Other,
            },
        }
    }

    pub fn is_camera(self) -> bool {
        matches!(self, DeviceType::Camera)
    }
}

/// A camera identified during a scan. Only devices that classify as [`DeviceType::Camera`]
/// are surfaced as scan hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub ip: String,
    pub manufacturer: String,
    pub model: String,
    pub product_number: String,
    pub serial: String,
    pub device_type: DeviceType,
}

/// The subset of `basicdeviceinfo.cgi`'s `propertyList` this crate cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProperties {
    #[serde(rename = "Brand")]
    pub brand: Option<String>,
    #[serde(rename = "ProdType")]
    pub prod_type: Option<String>,
    #[serde(rename = "ProdNbr")]
    pub prod_nbr: Option<String>,
    #[serde(rename = "ProdFullName")]
    pub prod_full_name: Option<String>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: Option<String>,
}

const REQUIRED_MANUFACTURER: &str = "AXIS";

impl DeviceProperties {
    /// Builds a [`CameraDescriptor`] if and only if the manufacturer is AXIS and the product
    /// number classifies as a camera.
    pub fn as_camera(&self, ip: &str) -> Option<CameraDescriptor> {
        let brand = self.brand.as_deref()?;
        if brand != REQUIRED_MANUFACTURER {
            return None;
        }
        let product_number = self.prod_nbr.clone().unwrap_or_default();
        let device_type = DeviceType::from_product_number(&product_number);
        if !device_type.is_camera() {
            return None;
        }
        Some(CameraDescriptor {
            ip: ip.to_string(),
            manufacturer: brand.to_string(),
            model: self.prod_full_name.clone().unwrap_or_default(),
            product_number,
            serial: self.serial_number.clone().unwrap_or_default(),
            device_type,
        })
    }
}

/// Builds the VAPIX `basicdeviceinfo.cgi` request body used to probe a candidate IP.
pub fn identity_probe_body() -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "1.0",
        "method": "getProperties",
        "params": {
            "propertyList": ["Brand", "ProdType", "ProdNbr", "ProdFullName", "SerialNumber"]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_camera_prefixes() {
        for prefix in ["M3215-LVE", "P1375", "Q1615"] {
            assert_eq!(
                DeviceType::from_product_number(prefix),
                DeviceType::Camera,
                "{prefix}"
            );
        }
    }

    #[test]
    fn classifies_non_camera_prefixes() {
        assert_eq!(DeviceType::from_product_number("C1310"), DeviceType::Speaker);
        assert_eq!(DeviceType::from_product_number("I8016"), DeviceType::Intercom);
        assert_eq!(
            DeviceType::from_product_number("A1601"),
            DeviceType::AccessControl
        );
        assert_eq!(DeviceType::from_product_number("D4100"), DeviceType::SystemDevice);
        assert_eq!(DeviceType::from_product_number("W100"), DeviceType::Bodyworn);
        assert_eq!(
            DeviceType::from_product_number("T91B"),
            DeviceType::MountingHardware
        );
        assert_eq!(DeviceType::from_product_number(""), DeviceType::Unknown);
        assert_eq!(DeviceType::from_product_number("Z999"), DeviceType::Other);
    }

    #[test]
    fn as_camera_requires_axis_brand_and_camera_type() {
        let props = DeviceProperties {
            brand: Some("AXIS".to_string()),
            prod_type: Some("Network Camera".to_string()),
            prod_nbr: Some("M3215-LVE".to_string()),
            prod_full_name: Some("AXIS M3215-LVE".to_string()),
            serial_number: Some("ACCC8E000000".to_string()),
        };
        let camera = props.as_camera("192.168.1.5").expect("should classify as camera");
        assert_eq!(camera.ip, "192.168.1.5");
        assert_eq!(camera.device_type, DeviceType::Camera);

        let non_axis = DeviceProperties {
            brand: Some("HIKVISION".to_string()),
            ..props.clone_for_test()
        };
        assert!(non_axis.as_camera("192.168.1.5").is_none());
    }

    impl DeviceProperties {
        fn clone_for_test(&self) -> Self {
            DeviceProperties {
                brand: self.brand.clone(),
                prod_type: self.prod_type.clone(),
                prod_nbr: self.prod_nbr.clone(),
                prod_full_name: self.prod_full_name.clone(),
                serial_number: self.serial_number.clone(),
            }
        }
    }
}
