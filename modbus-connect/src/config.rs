//! Configuration for the Modbus Connect daemon.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use modbus_connect_core::{
    ControlKind, Conversion, DEFAULT_MAX_READ_SIZE, EntityDescriptor, LoggingConfig,
    ModbusDataType, SlaveEntity, mirror_sensor,
};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Gateways to poll
    pub gateways: Vec<GatewayConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for a single Modbus TCP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Modbus slave/unit id (default: 1)
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    /// Poll interval in seconds (default: 30)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,

    /// Also expose writable entities as read-only mirror sensors
    #[serde(default)]
    pub mirror_non_sensors: bool,

    /// Device-imposed maximum registers/bits per read transaction
    #[serde(default = "default_max_read_size")]
    pub max_read_size: u16,

    /// Entities to poll
    pub entities: Vec<EntityConfig>,
}

fn default_port() -> u16 {
    502
}

fn default_slave_id() -> u8 {
    1
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_max_read_size() -> u16 {
    DEFAULT_MAX_READ_SIZE
}

/// Entity control types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    /// Read-only numeric or text reading (default)
    #[default]
    Sensor,
    /// Read-only on/off state
    BinarySensor,
    /// Writable on/off control
    Switch,
    /// Writable numeric control
    Number,
    /// Writable enumeration
    Select,
    /// Writable text register block
    Text,
}

/// Configuration for one entity.
///
/// JSON5 object keys are strings, so enumeration maps are written with
/// string keys and parsed into integers at descriptor-build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Unique key within the gateway
    pub key: String,

    /// Human-readable name (default: the key)
    #[serde(default)]
    pub name: Option<String>,

    /// First register or bit address
    pub register_address: u16,

    /// Number of consecutive registers/bits (default: 1)
    #[serde(default = "default_register_count")]
    pub register_count: u16,

    /// Address space to read from (default: holding_register)
    #[serde(default)]
    pub data_type: ModbusDataType,

    /// Control type (default: sensor)
    #[serde(default)]
    pub control_type: ControlType,

    /// Switch: register value meaning "on" (default: 1)
    #[serde(default)]
    pub on: Option<u16>,

    /// Switch: register value meaning "off" (default: 0)
    #[serde(default)]
    pub off: Option<u16>,

    /// Number: lowest accepted value
    #[serde(default)]
    pub min: Option<f64>,

    /// Number: highest accepted value
    #[serde(default)]
    pub max: Option<f64>,

    /// Select: raw value to option label
    #[serde(default)]
    pub options: Option<HashMap<String, String>>,

    /// Scaling factor applied to the raw value
    #[serde(default)]
    pub multiplier: Option<f64>,

    /// Offset added after scaling
    #[serde(default)]
    pub offset: Option<f64>,

    /// Right-shift before extracting a packed sub-field
    #[serde(default)]
    pub shift_bits: Option<u32>,

    /// Width of the packed sub-field, in bits
    #[serde(default)]
    pub bit_width: Option<u32>,

    /// Per-register scales for values split across summed registers
    #[serde(default)]
    pub sum_scale: Option<Vec<f64>>,

    /// Enumeration map from raw value to display label
    #[serde(default)]
    pub map: Option<HashMap<String, String>>,

    /// Decimal places the decoded number is rounded to
    #[serde(default)]
    pub precision: Option<u32>,

    /// Reinterpret the register bits as IEEE 754 floating point
    #[serde(default)]
    pub is_float: bool,

    /// Decode the register bytes as text
    #[serde(default)]
    pub is_string: bool,

    /// Ignore decreases against the last accepted value
    #[serde(default)]
    pub never_resets: bool,
}

fn default_register_count() -> u16 {
    1
}

impl EntityConfig {
    /// Build the core descriptor, validating control-specific fields.
    pub fn into_descriptor(self) -> Result<EntityDescriptor, ConfigError> {
        let control = match self.control_type {
            ControlType::Sensor => ControlKind::Sensor,
            ControlType::BinarySensor => ControlKind::BinarySensor,
            ControlType::Switch => ControlKind::Switch {
                on: self.on.unwrap_or(1),
                off: self.off.unwrap_or(0),
            },
            ControlType::Number => ControlKind::Number {
                min: self.min.ok_or_else(|| {
                    ConfigError::Validation(format!("Entity '{}': number needs 'min'", self.key))
                })?,
                max: self.max.ok_or_else(|| {
                    ConfigError::Validation(format!("Entity '{}': number needs 'max'", self.key))
                })?,
            },
            ControlType::Select => ControlKind::Select {
                options: parse_int_keys(
                    self.options.as_ref().ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "Entity '{}': select needs 'options'",
                            self.key
                        ))
                    })?,
                    &self.key,
                )?,
            },
            ControlType::Text => ControlKind::Text,
        };

        let map = match &self.map {
            Some(map) => Some(parse_int_keys(map, &self.key)?),
            None => None,
        };

        Ok(EntityDescriptor {
            name: self.name.clone().unwrap_or_else(|| self.key.clone()),
            key: self.key,
            register_address: self.register_address,
            register_count: self.register_count,
            data_type: self.data_type,
            conversion: Conversion {
                multiplier: self.multiplier,
                offset: self.offset,
                shift_bits: self.shift_bits,
                bit_width: self.bit_width,
                sum_scale: self.sum_scale,
                map,
                precision: self.precision,
                is_float: self.is_float,
                is_string: self.is_string,
                never_resets: self.never_resets,
            },
            control,
        })
    }
}

/// JSON5 map keys are strings; the raw register values they stand for
/// must parse as integers.
fn parse_int_keys(
    map: &HashMap<String, String>,
    entity_key: &str,
) -> Result<HashMap<i64, String>, ConfigError> {
    map.iter()
        .map(|(raw, label)| {
            raw.parse::<i64>()
                .map(|raw| (raw, label.clone()))
                .map_err(|_| {
                    ConfigError::Validation(format!(
                        "Entity '{}': map key '{}' is not an integer",
                        entity_key, raw
                    ))
                })
        })
        .collect()
}

impl ConnectConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConnectConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateways.is_empty() {
            return Err(ConfigError::Validation(
                "At least one gateway must be configured".to_string(),
            ));
        }

        for gateway in &self.gateways {
            if gateway.host.is_empty() {
                return Err(ConfigError::Validation(
                    "Gateway host cannot be empty".to_string(),
                ));
            }

            if gateway.port == 0 {
                return Err(ConfigError::Validation(format!(
                    "Gateway '{}': port must be 1-65535",
                    gateway.host
                )));
            }

            if gateway.refresh_interval_seconds == 0 {
                return Err(ConfigError::Validation(format!(
                    "Gateway '{}': refresh_interval_seconds must be at least 1",
                    gateway.host
                )));
            }

            if gateway.max_read_size == 0 {
                return Err(ConfigError::Validation(format!(
                    "Gateway '{}': max_read_size must be at least 1",
                    gateway.host
                )));
            }

            if gateway.entities.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Gateway '{}': must configure at least one entity",
                    gateway.host
                )));
            }

            let mut seen = std::collections::HashSet::new();
            for entity in &gateway.entities {
                if entity.key.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Gateway '{}': entity key cannot be empty",
                        gateway.host
                    )));
                }
                if !seen.insert(entity.key.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Gateway '{}': duplicate entity key '{}'",
                        gateway.host, entity.key
                    )));
                }
            }
        }

        Ok(())
    }
}

impl GatewayConfig {
    /// Build the slave-bound entity list the coordinator polls, including
    /// mirror sensors when `mirror_non_sensors` is set.
    pub fn slave_entities(&self) -> Result<Vec<SlaveEntity>, ConfigError> {
        let mut descriptors = Vec::with_capacity(self.entities.len());
        for entity in &self.entities {
            descriptors.push(entity.clone().into_descriptor()?);
        }

        if self.mirror_non_sensors {
            let mirrors: Vec<EntityDescriptor> =
                descriptors.iter().filter_map(mirror_sensor).collect();
            descriptors.extend(mirrors);
        }

        Ok(descriptors
            .into_iter()
            .map(|desc| SlaveEntity::new(self.slave_id, desc))
            .collect())
    }
}
