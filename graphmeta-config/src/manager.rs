//! Node-side config manager
//!
//! A process declares the items that govern its runtime flags, each
//! declaration yielding a typed handle the application reads. `start()`
//! pushes the declarations (register is idempotent, so restarts are safe)
//! and then polls `list(module)` on an interval, rebinding a handle
//! whenever the remote value moved. Scalar handles are word-sized atomics
//! and string handles sit behind a lock, so readers never observe a torn
//! value. Application code treats the handles as read-only; the manager
//! owns the writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use graphmeta_core::error::{MetaError, Result};
use graphmeta_core::value::{ConfigMode, ConfigModule, ConfigValue};
use graphmeta_kv::KvStore;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{ConfigItem, ConfigStore};

/// Remote surface the manager polls
///
/// The in-process `ConfigStore` implements this directly; a deployment
/// with a remote metadata service implements it over its RPC client.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn register(&self, items: &[ConfigItem]) -> Result<()>;
    async fn set(&self, item: &ConfigItem) -> Result<()>;
    async fn get(&self, module: ConfigModule, name: &str) -> Result<Option<ConfigItem>>;
    async fn list(&self, module: ConfigModule) -> Result<Vec<ConfigItem>>;
}

#[async_trait]
impl<S: KvStore> ConfigSource for ConfigStore<S> {
    async fn register(&self, items: &[ConfigItem]) -> Result<()> {
        ConfigStore::register(self, items).await
    }

    async fn set(&self, item: &ConfigItem) -> Result<()> {
        ConfigStore::set(self, item).await
    }

    async fn get(&self, module: ConfigModule, name: &str) -> Result<Option<ConfigItem>> {
        ConfigStore::get(self, module, name).await
    }

    async fn list(&self, module: ConfigModule) -> Result<Vec<ConfigItem>> {
        ConfigStore::list(self, module).await
    }
}

/// Handle to a manager-owned i64 flag
#[derive(Clone)]
pub struct Int64Flag(Arc<AtomicI64>);

impl Int64Flag {
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a manager-owned bool flag
#[derive(Clone)]
pub struct BoolFlag(Arc<AtomicBool>);

impl BoolFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a manager-owned f64 flag; stored as raw bits so reads are a
/// single word load
#[derive(Clone)]
pub struct DoubleFlag(Arc<AtomicU64>);

impl DoubleFlag {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

/// Handle to a manager-owned string flag
#[derive(Clone)]
pub struct StringFlag(Arc<RwLock<String>>);

impl StringFlag {
    pub fn get(&self) -> String {
        self.0.read().clone()
    }
}

/// Typed setter for one declared flag
enum Binding {
    Int64(Arc<AtomicI64>),
    Bool(Arc<AtomicBool>),
    Double(Arc<AtomicU64>),
    String(Arc<RwLock<String>>),
}

impl Binding {
    fn apply(&self, name: &str, value: &ConfigValue) {
        match (self, value) {
            (Binding::Int64(slot), ConfigValue::Int64(v)) => slot.store(*v, Ordering::Release),
            (Binding::Bool(slot), ConfigValue::Bool(v)) => slot.store(*v, Ordering::Release),
            (Binding::Double(slot), ConfigValue::Double(v)) => {
                slot.store(v.to_bits(), Ordering::Release)
            }
            (Binding::String(slot), ConfigValue::String(v)) => *slot.write() = v.clone(),
            _ => warn!(name, "remote config value type disagrees with declaration"),
        }
    }
}

/// Per-process configuration manager
pub struct ConfigManager<C> {
    module: ConfigModule,
    source: Arc<C>,
    interval: Duration,
    declarations: Vec<ConfigItem>,
    bindings: HashMap<String, Binding>,
    /// Last value observed per item, for change detection
    observed: Mutex<HashMap<String, ConfigValue>>,
    registered: AtomicBool,
}

impl<C: ConfigSource + 'static> ConfigManager<C> {
    pub fn new(module: ConfigModule, source: Arc<C>, interval: Duration) -> Self {
        Self {
            module,
            source,
            interval,
            declarations: Vec::new(),
            bindings: HashMap::new(),
            observed: Mutex::new(HashMap::new()),
            registered: AtomicBool::new(false),
        }
    }

    pub fn declare_int64(&mut self, name: &str, default: i64, mode: ConfigMode) -> Int64Flag {
        let slot = Arc::new(AtomicI64::new(default));
        self.declare(name, mode, ConfigValue::Int64(default), Binding::Int64(slot.clone()));
        Int64Flag(slot)
    }

    pub fn declare_bool(&mut self, name: &str, default: bool, mode: ConfigMode) -> BoolFlag {
        let slot = Arc::new(AtomicBool::new(default));
        self.declare(name, mode, ConfigValue::Bool(default), Binding::Bool(slot.clone()));
        BoolFlag(slot)
    }

    pub fn declare_double(&mut self, name: &str, default: f64, mode: ConfigMode) -> DoubleFlag {
        let slot = Arc::new(AtomicU64::new(default.to_bits()));
        self.declare(
            name,
            mode,
            ConfigValue::Double(default),
            Binding::Double(slot.clone()),
        );
        DoubleFlag(slot)
    }

    pub fn declare_string(&mut self, name: &str, default: &str, mode: ConfigMode) -> StringFlag {
        let slot = Arc::new(RwLock::new(default.to_string()));
        self.declare(
            name,
            mode,
            ConfigValue::String(default.to_string()),
            Binding::String(slot.clone()),
        );
        StringFlag(slot)
    }

    fn declare(&mut self, name: &str, mode: ConfigMode, default: ConfigValue, binding: Binding) {
        self.declarations
            .push(ConfigItem::new(self.module, name, mode, default.clone()));
        self.bindings.insert(name.to_string(), binding);
        self.observed.lock().insert(name.to_string(), default);
    }

    /// Push a new value for one of this module's items.
    pub async fn set_config(&self, name: &str, value: ConfigValue) -> Result<()> {
        self.source
            .set(&ConfigItem::new(
                self.module,
                name,
                ConfigMode::Mutable,
                value,
            ))
            .await
    }

    /// Fetch one of this module's items; absent items are an error at this
    /// surface.
    pub async fn get_config(&self, name: &str) -> Result<ConfigItem> {
        self.source
            .get(self.module, name)
            .await?
            .ok_or_else(|| MetaError::NotFound(format!("config item {name}")))
    }

    /// One poll cycle: register declarations if not yet done, list the
    /// module, rebind changed flags.
    pub async fn refresh(&self) -> Result<()> {
        if !self.registered.load(Ordering::Acquire) {
            self.source.register(&self.declarations).await?;
            self.registered.store(true, Ordering::Release);
            info!(module = ?self.module, items = self.declarations.len(), "declarations registered");
        }

        let items = self.source.list(self.module).await?;
        for item in items {
            let Some(binding) = self.bindings.get(&item.name) else {
                continue;
            };
            let mut observed = self.observed.lock();
            if observed.get(&item.name) == Some(&item.value) {
                continue;
            }
            debug!(module = ?self.module, name = %item.name, "config value changed, rebinding");
            binding.apply(&item.name, &item.value);
            observed.insert(item.name.clone(), item.value);
        }
        Ok(())
    }

    /// Spawn the polling worker. A failed cycle is logged and retried on
    /// the next tick with the last bound values retained. Abort the
    /// returned handle to stop polling.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.refresh().await {
                    warn!(module = ?self.module, error = %e, "config refresh failed, will retry");
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphmeta_kv::MemoryKv;

    fn manager() -> (ConfigManager<ConfigStore<MemoryKv>>, Arc<ConfigStore<MemoryKv>>) {
        let store = Arc::new(ConfigStore::new(Arc::new(MemoryKv::new())));
        (
            ConfigManager::new(ConfigModule::Storage, store.clone(), Duration::from_secs(1)),
            store,
        )
    }

    #[tokio::test]
    async fn test_refresh_registers_declarations_once() {
        let (mut mgr, store) = manager();
        mgr.declare_int64("int64_key", 101, ConfigMode::Mutable);

        mgr.refresh().await.unwrap();
        mgr.refresh().await.unwrap();

        let items = store.list(ConfigModule::Storage).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value, ConfigValue::Int64(101));
    }

    #[tokio::test]
    async fn test_refresh_rebinds_changed_values() {
        let (mut mgr, _store) = manager();
        let int_flag = mgr.declare_int64("int64_key", 101, ConfigMode::Mutable);
        let bool_flag = mgr.declare_bool("bool_key", false, ConfigMode::Mutable);
        let double_flag = mgr.declare_double("double_key", 1.23, ConfigMode::Mutable);

        mgr.refresh().await.unwrap();
        assert_eq!(int_flag.get(), 101);

        mgr.set_config("int64_key", ConfigValue::Int64(102)).await.unwrap();
        mgr.set_config("bool_key", ConfigValue::Bool(true)).await.unwrap();
        mgr.set_config("double_key", ConfigValue::Double(3.14)).await.unwrap();
        // Not yet polled: the handles still show the old values.
        assert_eq!(int_flag.get(), 101);

        mgr.refresh().await.unwrap();
        assert_eq!(int_flag.get(), 102);
        assert!(bool_flag.get());
        assert_eq!(double_flag.get(), 3.14);
    }

    #[tokio::test]
    async fn test_immutable_flag_never_moves() {
        let (mut mgr, _store) = manager();
        let flag = mgr.declare_int64("int64_key_immutable", 100, ConfigMode::Immutable);

        mgr.refresh().await.unwrap();
        let err = mgr
            .set_config("int64_key_immutable", ConfigValue::Int64(103))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::InvalidArgument(_)));

        mgr.refresh().await.unwrap();
        assert_eq!(flag.get(), 100);
    }

    #[tokio::test]
    async fn test_get_config_maps_absent_to_not_found() {
        let (mgr, _store) = manager();
        let err = mgr.get_config("not_existed").await.unwrap_err();
        assert!(matches!(err, MetaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restart_keeps_remote_values() {
        let (mut first, store) = manager();
        first.declare_string("string_key", "something", ConfigMode::Mutable);
        first.refresh().await.unwrap();
        first
            .set_config("string_key", ConfigValue::from("abc"))
            .await
            .unwrap();

        // A second incarnation re-registers the same declarations; the
        // remote value survives and lands in the fresh handle.
        let mut second =
            ConfigManager::new(ConfigModule::Storage, store.clone(), Duration::from_secs(1));
        let flag = second.declare_string("string_key", "something", ConfigMode::Mutable);
        second.refresh().await.unwrap();
        assert_eq!(flag.get(), "abc");
    }
}
