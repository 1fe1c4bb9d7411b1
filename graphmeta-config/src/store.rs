//! Config item store
//!
//! CRUD over the KV substrate for `(module, name)`-keyed items. Register
//! is an idempotent batch: present items are left untouched. Set validates
//! the stored type and refuses immutable items. Values are stored in their
//! canonical payload encoding under `type(1) | mode(1) | value_len(4) |
//! value`.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use graphmeta_core::error::{MetaError, Result};
use graphmeta_core::keys;
use graphmeta_core::value::{ConfigMode, ConfigModule, ConfigType, ConfigValue};
use tracing::{debug, info};

use graphmeta_kv::store::put;
use graphmeta_kv::KvStore;

/// One named, typed, per-module configuration item
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigItem {
    pub module: ConfigModule,
    pub name: String,
    pub mode: ConfigMode,
    pub value: ConfigValue,
}

impl ConfigItem {
    pub fn new(
        module: ConfigModule,
        name: impl Into<String>,
        mode: ConfigMode,
        value: ConfigValue,
    ) -> Self {
        Self {
            module,
            name: name.into(),
            mode,
            value,
        }
    }

    pub fn value_type(&self) -> ConfigType {
        self.value.value_type()
    }

    /// Stored record: `type(1) | mode(1) | value_len(4) | value`.
    pub fn encode_record(&self) -> Bytes {
        let payload = self.value.encode();
        let mut buf = BytesMut::with_capacity(6 + payload.len());
        buf.put_u8(self.value_type().as_u8());
        buf.put_u8(self.mode.as_u8());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        buf.freeze()
    }

    pub fn decode_record(module: ConfigModule, name: String, raw: &[u8]) -> Result<Self> {
        if raw.len() < 6 {
            return Err(MetaError::StoreFailure(format!(
                "config record of {} bytes",
                raw.len()
            )));
        }
        let ty = ConfigType::from_u8(raw[0])
            .ok_or_else(|| MetaError::StoreFailure(format!("config type 0x{:02x}", raw[0])))?;
        let mode = ConfigMode::from_u8(raw[1])
            .ok_or_else(|| MetaError::StoreFailure(format!("config mode 0x{:02x}", raw[1])))?;
        let len = u32::from_be_bytes(raw[2..6].try_into().unwrap()) as usize;
        if raw.len() != 6 + len {
            return Err(MetaError::StoreFailure(format!(
                "config value length {} disagrees with record of {} bytes",
                len,
                raw.len()
            )));
        }
        let value = ConfigValue::decode(ty, &raw[6..])?;
        Ok(Self {
            module,
            name,
            mode,
            value,
        })
    }
}

/// Config item store over the KV substrate
pub struct ConfigStore<S> {
    store: Arc<S>,
}

impl<S: KvStore> ConfigStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Insert every item whose `(module, name)` is absent; present items
    /// are left untouched. The whole batch applies in one write.
    pub async fn register(&self, items: &[ConfigItem]) -> Result<()> {
        let mut missing = Vec::new();
        for item in items {
            if item.module == ConfigModule::All {
                return Err(MetaError::InvalidArgument(format!(
                    "cannot register {} under the ALL wildcard",
                    item.name
                )));
            }
            let key = keys::config_key(item.module, &item.name);
            if self.store.get(&key).await?.is_none() {
                debug!(module = ?item.module, name = %item.name, "registering config item");
                missing.push((key, item.encode_record()));
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        info!(count = missing.len(), "registering config items");
        self.store.multi_put(missing).await
    }

    /// Overwrite a registered, mutable item's value.
    pub async fn set(&self, item: &ConfigItem) -> Result<()> {
        let key = keys::config_key(item.module, &item.name);
        let existing = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| MetaError::NotFound(format!("config item {}", item.name)))?;

        let stored = ConfigItem::decode_record(item.module, item.name.clone(), &existing)?;
        if stored.value_type() != item.value_type() {
            return Err(MetaError::InvalidArgument(format!(
                "config item {} holds {:?}, not {:?}",
                item.name,
                stored.value_type(),
                item.value_type()
            )));
        }
        if stored.mode == ConfigMode::Immutable {
            return Err(MetaError::InvalidArgument(format!(
                "config item {} is immutable",
                item.name
            )));
        }

        let next = ConfigItem {
            mode: stored.mode,
            ..item.clone()
        };
        put(&*self.store, key, next.encode_record()).await
    }

    /// Look one item up; absence is `Ok(None)`, not an error. Nothing is
    /// ever stored under the `All` wildcard, so lookups there are empty.
    pub async fn get(&self, module: ConfigModule, name: &str) -> Result<Option<ConfigItem>> {
        let raw = self.store.get(&keys::config_key(module, name)).await?;
        raw.map(|v| ConfigItem::decode_record(module, name.to_string(), &v))
            .transpose()
    }

    /// Every item of `module`; every item of every module for `All`.
    pub async fn list(&self, module: ConfigModule) -> Result<Vec<ConfigItem>> {
        let prefix = keys::config_prefix();
        let end = keys::prefix_end(&prefix);
        let pairs = self.store.scan(&prefix, &end).await?;

        let mut items = Vec::new();
        for (key, value) in pairs {
            let (item_module, name) = keys::parse_config_key(&key).ok_or_else(|| {
                MetaError::StoreFailure(format!("malformed config key of {} bytes", key.len()))
            })?;
            if module != ConfigModule::All && item_module != module {
                continue;
            }
            items.push(ConfigItem::decode_record(item_module, name, &value)?);
        }
        Ok(items)
    }
}
