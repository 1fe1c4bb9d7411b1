//! Typed configuration values
//!
//! A config item is owned by a module, carries a type tag governing its
//! value bytes, and is either mutable or immutable. Payload encodings are
//! fixed: INT64 is 8-byte little-endian two's complement, BOOL is one byte
//! 0/1, DOUBLE is IEEE-754 little-endian, STRING is raw UTF-8.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

/// Coarse owner of a configuration item.
///
/// `All` is a query wildcard: `list(All)` returns every module, and no item
/// is ever stored under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigModule {
    All,
    Graph,
    Meta,
    Storage,
}

impl ConfigModule {
    pub fn as_u8(self) -> u8 {
        match self {
            ConfigModule::All => 0x00,
            ConfigModule::Graph => 0x01,
            ConfigModule::Meta => 0x02,
            ConfigModule::Storage => 0x03,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(ConfigModule::All),
            0x01 => Some(ConfigModule::Graph),
            0x02 => Some(ConfigModule::Meta),
            0x03 => Some(ConfigModule::Storage),
            _ => None,
        }
    }
}

/// Value type of a configuration item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigType {
    Int64,
    Bool,
    Double,
    String,
}

impl ConfigType {
    pub fn as_u8(self) -> u8 {
        match self {
            ConfigType::Int64 => 0x01,
            ConfigType::Bool => 0x02,
            ConfigType::Double => 0x03,
            ConfigType::String => 0x04,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(ConfigType::Int64),
            0x02 => Some(ConfigType::Bool),
            0x03 => Some(ConfigType::Double),
            0x04 => Some(ConfigType::String),
            _ => None,
        }
    }
}

/// Mutability of a configuration item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigMode {
    Mutable,
    Immutable,
}

impl ConfigMode {
    pub fn as_u8(self) -> u8 {
        match self {
            ConfigMode::Mutable => 0x00,
            ConfigMode::Immutable => 0x01,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(ConfigMode::Mutable),
            0x01 => Some(ConfigMode::Immutable),
            _ => None,
        }
    }
}

/// A decoded configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    Int64(i64),
    Bool(bool),
    Double(f64),
    String(String),
}

impl ConfigValue {
    pub fn value_type(&self) -> ConfigType {
        match self {
            ConfigValue::Int64(_) => ConfigType::Int64,
            ConfigValue::Bool(_) => ConfigType::Bool,
            ConfigValue::Double(_) => ConfigType::Double,
            ConfigValue::String(_) => ConfigType::String,
        }
    }

    /// Canonical payload encoding.
    pub fn encode(&self) -> Bytes {
        match self {
            ConfigValue::Int64(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            ConfigValue::Bool(v) => Bytes::copy_from_slice(&[u8::from(*v)]),
            ConfigValue::Double(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            ConfigValue::String(v) => Bytes::copy_from_slice(v.as_bytes()),
        }
    }

    /// Decode a payload under the given type tag.
    pub fn decode(ty: ConfigType, raw: &[u8]) -> Result<Self> {
        match ty {
            ConfigType::Int64 => {
                let arr: [u8; 8] = raw.try_into().map_err(|_| {
                    MetaError::InvalidArgument(format!("int64 value of {} bytes", raw.len()))
                })?;
                Ok(ConfigValue::Int64(i64::from_le_bytes(arr)))
            }
            ConfigType::Bool => match raw {
                [0] => Ok(ConfigValue::Bool(false)),
                [1] => Ok(ConfigValue::Bool(true)),
                _ => Err(MetaError::InvalidArgument(format!(
                    "bool value of {} bytes",
                    raw.len()
                ))),
            },
            ConfigType::Double => {
                let arr: [u8; 8] = raw.try_into().map_err(|_| {
                    MetaError::InvalidArgument(format!("double value of {} bytes", raw.len()))
                })?;
                Ok(ConfigValue::Double(f64::from_le_bytes(arr)))
            }
            ConfigType::String => {
                let s = std::str::from_utf8(raw)
                    .map_err(|e| MetaError::InvalidArgument(format!("string value: {e}")))?;
                Ok(ConfigValue::String(s.to_string()))
            }
        }
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int64(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Double(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}
