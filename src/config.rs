/// Session configuration, read as JSON from a file or stdin.
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::channel;
use crate::device::{Profile, ANT_PLUS_FREQUENCY};
use crate::error::AntError;
use crate::message::ANT_PLUS_NETWORK_KEY;
use crate::Result;

/// ANT USB-m stick.
pub const DEFAULT_VENDOR_ID: u16 = 0x0FCF;
pub const DEFAULT_PRODUCT_ID: u16 = 0x1009;

const DEFAULT_SEARCH_TIMEOUT: u8 = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub network: u8,
    #[serde(default = "default_network_key")]
    pub network_key: [u8; 8],
    #[serde(default)]
    pub timing: Timing,
    /// Skip heart rate records that repeat the previous beat.
    #[serde(default)]
    pub new_beats_only: bool,
    pub devices: Vec<DeviceSettings>,
}

fn default_network_key() -> [u8; 8] {
    ANT_PLUS_NETWORK_KEY
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct UsbSettings {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for UsbSettings {
    fn default() -> Self {
        UsbSettings {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Timing {
    pub command_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub command_retries: u8,
    /// Missed messaging periods before a tracking channel counts as lost.
    pub signal_loss_periods: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            command_timeout_ms: 500,
            read_timeout_ms: 100,
            command_retries: 3,
            signal_loss_periods: 8,
        }
    }
}

impl Timing {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceSettings {
    /// 0 pairs with the first device of the type that is found.
    #[serde(default)]
    pub device_number: u16,
    pub device_type: u8,
    #[serde(default)]
    pub transmission_type: u8,
    pub frequency: Option<u8>,
    pub period: Option<u16>,
    /// 2.5 second units.
    pub search_timeout: Option<u8>,
    #[serde(default)]
    pub search_retries: u8,
    pub channel: Option<u8>,
}

impl DeviceSettings {
    pub fn profile(&self) -> Option<Profile> {
        Profile::from_device_type(self.device_type)
    }

    fn channel_config(&self, profile: Profile) -> channel::Config {
        channel::Config::new()
            .device_number(self.device_number)
            .device_type(self.device_type)
            .transmission_type(self.transmission_type)
            .frequency(self.frequency.unwrap_or(ANT_PLUS_FREQUENCY))
            .period(self.period.unwrap_or_else(|| profile.default_period()))
            .search_timeout(self.search_timeout.unwrap_or(DEFAULT_SEARCH_TIMEOUT))
            .search_retries(self.search_retries)
    }
}

impl Settings {
    /// Reads settings from `path`, or from stdin when `path` is `-`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings> {
        let path = path.as_ref();
        if path == Path::new("-") {
            debug!("Reading configuration from stdin");
            return Settings::from_reader(io::stdin());
        }
        debug!("Reading configuration from {}", path.display());
        let file = File::open(path).map_err(|e| {
            AntError::Configuration(format!("cannot open {}: {}", path.display(), e))
        })?;
        Settings::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Settings> {
        let settings: Settings = serde_json::from_reader(reader)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(AntError::Configuration("no devices configured".into()));
        }
        if self.timing.command_timeout_ms == 0 || self.timing.read_timeout_ms == 0 {
            return Err(AntError::Configuration("timeouts must be non-zero".into()));
        }
        if self.timing.signal_loss_periods == 0 {
            return Err(AntError::Configuration(
                "signalLossPeriods must be at least 1".into(),
            ));
        }
        let mut channels = BTreeSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.profile().is_none() {
                return Err(AntError::Configuration(format!(
                    "device {}: unsupported device type 0x{:02X}",
                    index, device.device_type
                )));
            }
            if device.period == Some(0) {
                return Err(AntError::Configuration(format!(
                    "device {}: period must be non-zero",
                    index
                )));
            }
            if let Some(channel) = device.channel {
                if !channels.insert(channel) {
                    return Err(AntError::Configuration(format!(
                        "device {}: channel {} is already used",
                        index, channel
                    )));
                }
            }
        }
        Ok(())
    }

    /// Channel number and radio configuration for every device. Devices
    /// without an explicit channel take the lowest free number.
    pub fn channels(&self) -> Result<Vec<(u8, channel::Config)>> {
        let mut used: BTreeSet<u8> = self.devices.iter().filter_map(|d| d.channel).collect();
        let mut next = 0u8;
        let mut channels = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let profile = device.profile().ok_or_else(|| {
                AntError::Configuration(format!(
                    "unsupported device type 0x{:02X}",
                    device.device_type
                ))
            })?;
            let number = match device.channel {
                Some(number) => number,
                None => {
                    while used.contains(&next) {
                        next = next.checked_add(1).ok_or_else(|| {
                            AntError::Configuration("ran out of channel numbers".into())
                        })?;
                    }
                    used.insert(next);
                    next
                }
            };
            channels.push((number, device.channel_config(profile)));
        }
        Ok(channels)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let settings =
            Settings::from_reader(r#"{ "devices": [ { "deviceType": 120 } ] }"#.as_bytes())
                .unwrap();
        assert_eq!(settings.usb, UsbSettings::default());
        assert_eq!(settings.usb.vendor_id, 0x0FCF);
        assert_eq!(settings.network, 0);
        assert_eq!(settings.network_key, ANT_PLUS_NETWORK_KEY);
        assert_eq!(settings.timing, Timing::default());
        assert!(!settings.new_beats_only);

        let channels = settings.channels().unwrap();
        assert_eq!(channels.len(), 1);
        let (number, config) = &channels[0];
        assert_eq!(*number, 0);
        assert_eq!(config.get_device_number(), 0);
        assert_eq!(config.get_period(), 8070);
        assert_eq!(config.get_frequency(), 57);
    }

    #[test]
    fn full_config() {
        let json = r#"{
            "usb": { "vendorId": 4047, "productId": 4104 },
            "network": 1,
            "networkKey": [1, 2, 3, 4, 5, 6, 7, 8],
            "timing": { "commandTimeoutMs": 250, "readTimeoutMs": 50,
                        "commandRetries": 1, "signalLossPeriods": 4 },
            "newBeatsOnly": true,
            "devices": [
                { "deviceNumber": 12345, "deviceType": 120, "transmissionType": 1,
                  "frequency": 57, "period": 16140, "searchTimeout": 12,
                  "searchRetries": 2, "channel": 3 },
                { "deviceType": 11 }
            ]
        }"#;
        let settings = Settings::from_reader(json.as_bytes()).unwrap();
        assert_eq!(settings.usb.product_id, 0x1008);
        assert_eq!(settings.timing.command_timeout(), Duration::from_millis(250));
        assert_eq!(settings.timing.signal_loss_periods, 4);
        assert!(settings.new_beats_only);

        let channels = settings.channels().unwrap();
        assert_eq!(channels[0].0, 3);
        assert_eq!(channels[0].1.get_device_number(), 12345);
        assert_eq!(channels[0].1.get_period(), 16140);
        assert_eq!(channels[1].0, 0);
        assert_eq!(channels[1].1.get_period(), 8182);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Settings::from_reader(
            r#"{ "devices": [ { "deviceType": 120, "colour": "red" } ] }"#.as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, AntError::Configuration(_)));
    }

    #[test]
    fn unsupported_device_type() {
        let err = Settings::from_reader(r#"{ "devices": [ { "deviceType": 17 } ] }"#.as_bytes())
            .unwrap_err();
        assert!(matches!(err, AntError::Configuration(m) if m.contains("0x11")));
    }

    #[test]
    fn empty_device_list() {
        assert!(Settings::from_reader(r#"{ "devices": [] }"#.as_bytes()).is_err());
    }

    #[test]
    fn duplicate_channel() {
        let json = r#"{ "devices": [ { "deviceType": 120, "channel": 1 },
                                     { "deviceType": 11, "channel": 1 } ] }"#;
        assert!(Settings::from_reader(json.as_bytes()).is_err());
    }

    #[test]
    fn automatic_channels_skip_explicit_ones() {
        let json = r#"{ "devices": [ { "deviceType": 120 },
                                     { "deviceType": 11, "channel": 1 },
                                     { "deviceType": 119 } ] }"#;
        let settings = Settings::from_reader(json.as_bytes()).unwrap();
        let numbers: Vec<u8> = settings.channels().unwrap().iter().map(|c| c.0).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn malformed_json() {
        assert!(Settings::from_reader("{ devices".as_bytes()).is_err());
    }

    #[test]
    fn missing_file() {
        let err = Settings::load("/nonexistent/antstream.json").unwrap_err();
        assert!(matches!(err, AntError::Configuration(_)));
    }
}
