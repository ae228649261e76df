//! Entity descriptors: what to read and how to interpret it.
//!
//! A device profile supplies one [`EntityDescriptor`] per logical entity.
//! Descriptors are loaded once at setup and replaced wholesale when the
//! configuration changes; the planner and converter consume them read-only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Modbus address space an entity lives in.
///
/// Each data type maps to exactly one read function code on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusDataType {
    /// Read/write single-bit outputs (function code 0x01).
    Coil,
    /// Read-only single-bit inputs (function code 0x02).
    DiscreteInput,
    /// Read/write 16-bit registers (function code 0x03).
    #[default]
    HoldingRegister,
    /// Read-only 16-bit registers (function code 0x04).
    InputRegister,
}

impl ModbusDataType {
    /// Modbus read function code for this address space.
    pub fn function_code(&self) -> u8 {
        match self {
            ModbusDataType::Coil => 0x01,
            ModbusDataType::DiscreteInput => 0x02,
            ModbusDataType::HoldingRegister => 0x03,
            ModbusDataType::InputRegister => 0x04,
        }
    }

    /// Whether addresses index bits rather than 16-bit words.
    pub fn is_bits(&self) -> bool {
        matches!(self, ModbusDataType::Coil | ModbusDataType::DiscreteInput)
    }

    /// String name used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModbusDataType::Coil => "coil",
            ModbusDataType::DiscreteInput => "discrete_input",
            ModbusDataType::HoldingRegister => "holding_register",
            ModbusDataType::InputRegister => "input_register",
        }
    }
}

impl std::fmt::Display for ModbusDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Numeric conversion parameters for one entity.
///
/// Every field is optional; each absent field makes the matching decode
/// step a no-op.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    /// Scaling factor applied to the raw value.
    pub multiplier: Option<f64>,

    /// Offset added after scaling.
    pub offset: Option<f64>,

    /// Right-shift applied before extracting a packed sub-field.
    pub shift_bits: Option<u32>,

    /// Width of the packed sub-field, in bits.
    pub bit_width: Option<u32>,

    /// Per-register scales for values split across summed registers.
    pub sum_scale: Option<Vec<f64>>,

    /// Enumeration map from raw integer to display label.
    pub map: Option<HashMap<i64, String>>,

    /// Decimal places the decoded number is rounded to.
    pub precision: Option<u32>,

    /// Reinterpret the combined register bits as IEEE 754 floating point.
    #[serde(default)]
    pub is_float: bool,

    /// Decode the register bytes as text.
    #[serde(default)]
    pub is_string: bool,

    /// Treat any decrease against the last accepted value as a transient
    /// device reset and keep the previous value.
    #[serde(default)]
    pub never_resets: bool,
}

/// Control-specific behavior of an entity.
///
/// Each variant carries only the fields that control type needs; the
/// planner and converter match exhaustively instead of probing optional
/// attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    /// Read-only numeric or text reading.
    Sensor,
    /// Read-only on/off state.
    BinarySensor,
    /// Writable on/off control with its register codes.
    Switch { on: u16, off: u16 },
    /// Writable numeric control with its allowed range.
    Number { min: f64, max: f64 },
    /// Writable enumeration over a fixed option map.
    Select { options: HashMap<i64, String> },
    /// Writable text register block.
    Text,
}

impl ControlKind {
    /// String name used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Sensor => "sensor",
            ControlKind::BinarySensor => "binary_sensor",
            ControlKind::Switch { .. } => "switch",
            ControlKind::Number { .. } => "number",
            ControlKind::Select { .. } => "select",
            ControlKind::Text => "text",
        }
    }

    /// Whether this entity is a read-only sensor of either kind.
    pub fn is_sensor(&self) -> bool {
        matches!(self, ControlKind::Sensor | ControlKind::BinarySensor)
    }
}

/// Description of one logical entity backed by a register or coil range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Unique key within one gateway/slave.
    pub key: String,

    /// Human-readable name.
    pub name: String,

    /// First register or bit address.
    pub register_address: u16,

    /// Number of consecutive registers/bits backing this entity.
    pub register_count: u16,

    /// Address space to read from.
    pub data_type: ModbusDataType,

    /// Numeric conversion rules.
    #[serde(default)]
    pub conversion: Conversion,

    /// Control-specific variant.
    pub control: ControlKind,
}

/// One entity bound to the slave address it is reachable at.
///
/// This is the unit the read planner groups by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveEntity {
    /// Modbus slave/unit id (1-247).
    pub slave_id: u8,

    /// The entity's descriptor.
    pub desc: EntityDescriptor,
}

impl SlaveEntity {
    pub fn new(slave_id: u8, desc: EntityDescriptor) -> Self {
        Self { slave_id, desc }
    }
}

/// Derive a read-only mirror sensor from a writable entity's descriptor.
///
/// The mirror exposes the control's current register value as a sensor
/// reading. Select options and holding-register switch codes become the
/// mirror's enumeration map so the sensor shows the same labels the
/// control does. Returns `None` for entities that are already sensors.
pub fn mirror_sensor(desc: &EntityDescriptor) -> Option<EntityDescriptor> {
    if desc.control.is_sensor() {
        return None;
    }

    let map = match &desc.control {
        ControlKind::Select { options } => Some(options.clone()),
        ControlKind::Switch { on, off } if desc.data_type == ModbusDataType::HoldingRegister => {
            Some(HashMap::from([
                (i64::from(*on), "on".to_string()),
                (i64::from(*off), "off".to_string()),
            ]))
        }
        _ => desc.conversion.map.clone(),
    };

    Some(EntityDescriptor {
        key: format!("{}_mirror", desc.key),
        name: format!("{} (Mirror)", desc.name),
        register_address: desc.register_address,
        register_count: desc.register_count,
        data_type: desc.data_type,
        conversion: Conversion {
            map,
            ..desc.conversion.clone()
        },
        control: ControlKind::Sensor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch_descriptor() -> EntityDescriptor {
        EntityDescriptor {
            key: "heater".to_string(),
            name: "Heater".to_string(),
            register_address: 10,
            register_count: 1,
            data_type: ModbusDataType::HoldingRegister,
            conversion: Conversion::default(),
            control: ControlKind::Switch { on: 1, off: 0 },
        }
    }

    #[test]
    fn test_function_codes() {
        assert_eq!(ModbusDataType::Coil.function_code(), 0x01);
        assert_eq!(ModbusDataType::DiscreteInput.function_code(), 0x02);
        assert_eq!(ModbusDataType::HoldingRegister.function_code(), 0x03);
        assert_eq!(ModbusDataType::InputRegister.function_code(), 0x04);
    }

    #[test]
    fn test_data_type_parses_snake_case() {
        let dt: ModbusDataType = serde_json::from_str("\"holding_register\"").unwrap();
        assert_eq!(dt, ModbusDataType::HoldingRegister);
        let dt: ModbusDataType = serde_json::from_str("\"discrete_input\"").unwrap();
        assert!(dt.is_bits());
    }

    #[test]
    fn test_mirror_from_register_switch() {
        let mirror = mirror_sensor(&switch_descriptor()).unwrap();

        assert_eq!(mirror.key, "heater_mirror");
        assert_eq!(mirror.name, "Heater (Mirror)");
        assert_eq!(mirror.register_address, 10);
        assert_eq!(mirror.control, ControlKind::Sensor);

        let map = mirror.conversion.map.unwrap();
        assert_eq!(map.get(&1).map(String::as_str), Some("on"));
        assert_eq!(map.get(&0).map(String::as_str), Some("off"));
    }

    #[test]
    fn test_mirror_from_select_uses_options() {
        let desc = EntityDescriptor {
            key: "mode".to_string(),
            name: "Mode".to_string(),
            register_address: 20,
            register_count: 1,
            data_type: ModbusDataType::HoldingRegister,
            conversion: Conversion::default(),
            control: ControlKind::Select {
                options: HashMap::from([(0, "eco".to_string()), (1, "boost".to_string())]),
            },
        };

        let mirror = mirror_sensor(&desc).unwrap();
        let map = mirror.conversion.map.unwrap();
        assert_eq!(map.get(&1).map(String::as_str), Some("boost"));
    }

    #[test]
    fn test_mirror_skips_sensors() {
        let mut desc = switch_descriptor();
        desc.control = ControlKind::Sensor;
        assert!(mirror_sensor(&desc).is_none());

        desc.control = ControlKind::BinarySensor;
        assert!(mirror_sensor(&desc).is_none());
    }

    #[test]
    fn test_coil_switch_mirror_has_no_synthesized_map() {
        let mut desc = switch_descriptor();
        desc.data_type = ModbusDataType::Coil;

        let mirror = mirror_sensor(&desc).unwrap();
        assert!(mirror.conversion.map.is_none());
    }
}
