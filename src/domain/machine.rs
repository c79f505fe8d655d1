//! Machine state
//!
//! One [`Machine`] per coffee machine. It owns the selected product and its
//! attribute overrides, the last statistics and alert snapshots, and the
//! connection manager that carries commands and reads. Observers are told
//! about changes through the [`EventBus`] and read state back through the
//! accessors.
//!
//! Reads build their result in locals and commit it with a single
//! assignment, so a read that fails or is dropped midway leaves the previous
//! snapshot in place.

use crate::domain::alerts::{self, ActiveAlerts, AlertPolicy};
use crate::domain::catalog::{AttributeKind, AttributeShape, MachineCatalog, Product};
use crate::domain::command::{self, Overrides};
use crate::domain::events::{ChangeKind, EventBus, Handler, Subscription};
use crate::domain::statistics::{self, Statistics};
use crate::error::ReadError;
use crate::infrastructure::bluetooth::connection::{ConnectionManager, LinkTiming};
use crate::infrastructure::bluetooth::encryption::EncryptionKey;
use crate::infrastructure::bluetooth::link::GattLink;
use crate::infrastructure::bluetooth::polling::{PollPolicy, PollingReader, ReadyCheck};
use crate::infrastructure::bluetooth::protocol::{
    MachineCharacteristic, StatisticsPage, COMMAND_LEN, STATS_NOT_READY, STATS_READY_OFFSET,
};
use crate::infrastructure::catalog_archive::ResolvedMachine;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Runtime knobs for one machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineOptions {
    pub timing: LinkTiming,
    pub poll: PollPolicy,
    pub alert_policy: AlertPolicy,
}

/// Host-facing view of one attribute of the current product
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeView {
    Number {
        min: u32,
        max: u32,
        step: u32,
        value: u32,
    },
    Select {
        options: Vec<String>,
        current: Option<String>,
    },
}

#[derive(Debug, Clone, Default)]
struct MachineState {
    connected: bool,
    last_seen: Option<SystemTime>,
    rssi: Option<i16>,
    product: Option<Product>,
    overrides: Overrides,
    statistics: Statistics,
    alerts: ActiveAlerts,
}

struct MachineInner {
    name: String,
    address: String,
    catalog: Arc<MachineCatalog>,
    connection: ConnectionManager,
    poll: PollPolicy,
    alert_policy: AlertPolicy,
    state: Mutex<MachineState>,
    events: EventBus,
}

impl MachineInner {
    fn state(&self) -> MutexGuard<'_, MachineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
        debug!("{} connectivity: {}", self.name, connected);
        self.events.notify(ChangeKind::Connectivity);
    }
}

#[derive(Clone)]
pub struct Machine {
    inner: Arc<MachineInner>,
}

impl Machine {
    pub fn new(
        name: impl Into<String>,
        resolved: ResolvedMachine,
        link: Arc<dyn GattLink>,
        options: MachineOptions,
    ) -> Self {
        let address = link.address();
        let connection = ConnectionManager::new(link, resolved.key, options.timing);

        let inner = Arc::new(MachineInner {
            name: name.into(),
            address,
            catalog: resolved.catalog,
            connection,
            poll: options.poll,
            alert_policy: options.alert_policy,
            state: Mutex::new(MachineState::default()),
            events: EventBus::new(),
        });

        let weak: Weak<MachineInner> = Arc::downgrade(&inner);
        inner
            .connection
            .set_connectivity_callback(Arc::new(move |connected| {
                if let Some(inner) = weak.upgrade() {
                    inner.set_connected(connected);
                }
            }));

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn model(&self) -> &str {
        &self.inner.catalog.model
    }

    pub fn key(&self) -> EncryptionKey {
        self.inner.connection.key()
    }

    pub fn catalog(&self) -> &MachineCatalog {
        &self.inner.catalog
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    // --- connection metadata ---

    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    pub fn last_seen(&self) -> Option<SystemTime> {
        self.inner.state().last_seen
    }

    pub fn rssi(&self) -> Option<i16> {
        self.inner.state().rssi
    }

    /// Record a fresh advertisement from the machine
    pub fn update_advertisement(&self, rssi: Option<i16>) {
        {
            let mut state = self.inner.state();
            state.last_seen = Some(SystemTime::now());
            state.rssi = rssi;
        }
        self.inner.events.notify(ChangeKind::Connectivity);
    }

    // --- product selection ---

    /// Names of the products the machine offers
    pub fn product_names(&self) -> Vec<String> {
        self.inner
            .catalog
            .active_products()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn current_product(&self) -> Option<Product> {
        self.inner.state().product.clone()
    }

    /// Select a product by name and reset all overrides.
    /// Returns `None` when the catalog has no such product.
    pub fn select_product(&self, name: &str) -> Option<Product> {
        let product = self.inner.catalog.product(name)?.clone();
        self.inner.connection.keep_alive();

        {
            let mut state = self.inner.state();
            state.product = Some(product.clone());
            state.overrides.clear();
        }
        debug!("{} selected {}", self.inner.name, product.name);
        self.inner.events.notify(ChangeKind::Product);
        Some(product)
    }

    /// Override a raw attribute value of the current product
    pub fn set_attribute_value(&self, kind: AttributeKind, value: u32) {
        self.inner.connection.keep_alive();
        self.inner.state().overrides.insert(kind, value);
    }

    /// Override an enumerated attribute by option name.
    /// Returns `false` when the current product has no such option.
    pub fn select_attribute_option(&self, kind: AttributeKind, option: &str) -> bool {
        let value = {
            let state = self.inner.state();
            state
                .product
                .as_ref()
                .and_then(|p| p.attribute(&kind))
                .and_then(|a| a.option_by_name(option))
                .map(|o| o.value)
        };

        match value {
            Some(value) => {
                self.set_attribute_value(kind, u32::from(value));
                true
            }
            None => {
                debug!("No option {} for {}", option, kind.key());
                false
            }
        }
    }

    /// View of `kind` on the current product, with overrides applied
    pub fn attribute(&self, kind: &AttributeKind) -> Option<AttributeView> {
        let state = self.inner.state();
        let attribute = state.product.as_ref()?.attribute(kind)?;
        let value = state
            .overrides
            .get(kind)
            .copied()
            .unwrap_or_else(|| attribute.default_value());

        Some(match &attribute.shape {
            AttributeShape::Numeric { min, max, step, .. } => AttributeView::Number {
                min: *min,
                max: *max,
                step: *step,
                value,
            },
            AttributeShape::Options { items, .. } => AttributeView::Select {
                options: items.iter().map(|i| i.name.clone()).collect(),
                current: u8::try_from(value)
                    .ok()
                    .and_then(|v| attribute.option_by_value(v))
                    .map(|o| o.name.clone()),
            },
        })
    }

    /// Every option name of `kind` across all products
    pub fn options_for(&self, kind: &AttributeKind) -> Vec<String> {
        self.inner.catalog.options_for(kind)
    }

    pub fn select_kinds(&self) -> Vec<AttributeKind> {
        self.inner.catalog.select_kinds()
    }

    pub fn number_kinds(&self) -> Vec<AttributeKind> {
        self.inner.catalog.number_kinds()
    }

    // --- commands ---

    /// The start command for the current product, if one is selected
    pub fn build_command(&self) -> Option<[u8; COMMAND_LEN]> {
        let state = self.inner.state();
        let product = state.product.as_ref()?;
        Some(command::build_command(
            product,
            &state.overrides,
            self.inner.connection.key(),
        ))
    }

    /// Hand the start command to the link. Returns `false` without a product.
    pub fn start_product(&self) -> bool {
        let Some(command) = self.build_command() else {
            warn!("{}: no product selected", self.inner.name);
            return false;
        };

        info!("{}: starting product", self.inner.name);
        self.inner
            .connection
            .send_once(command.to_vec(), MachineCharacteristic::StartProduct);
        true
    }

    // --- statistics ---

    pub fn statistics(&self) -> Statistics {
        self.inner.state().statistics.clone()
    }

    /// Refresh the statistics snapshot and return the current one.
    ///
    /// With `force_update` the link is brought up for the read; otherwise
    /// only a link that is already up or coming up is used. On any failure
    /// the previous snapshot is kept.
    pub async fn read_statistics(&self, force_update: bool) -> Statistics {
        debug!("Reading {} statistics", self.inner.name);

        match self.fetch_statistics(force_update).await {
            Ok(statistics) => {
                info!(
                    "{}: {} products made",
                    self.inner.name,
                    statistics.total_products.unwrap_or_default()
                );
                self.inner.state().statistics = statistics.clone();
                self.inner.events.notify(ChangeKind::Statistics);
                statistics
            }
            Err(ReadError::Implausible(e)) => {
                info!("{}: discarding statistics: {}", self.inner.name, e);
                self.statistics()
            }
            Err(e) => {
                debug!("{}: no statistics: {}", self.inner.name, e);
                self.statistics()
            }
        }
    }

    async fn fetch_statistics(&self, force_update: bool) -> Result<Statistics, ReadError> {
        let connection = &self.inner.connection;
        let wait = self.inner.poll.connect_wait;
        if force_update {
            connection.keep_alive();
        } else if !connection.is_running() {
            return Err(ReadError::NoLink(wait));
        }
        if !connection.wait_connected(wait).await {
            return Err(ReadError::NoLink(wait));
        }

        let catalog = &self.inner.catalog;
        let reader = PollingReader::new(connection.link(), connection.key(), self.inner.poll);

        let page = self
            .read_page(&reader, StatisticsPage::ProductCounters)
            .await?;
        let (total, product_counts) = statistics::decode_product_counters(catalog, &page)?;

        let maintenance_counters = if catalog.maintenance_counters.is_empty() {
            BTreeMap::new()
        } else {
            let page = self
                .read_page(&reader, StatisticsPage::MaintenanceCounters)
                .await?;
            statistics::decode_maintenance_counters(&catalog.maintenance_counters, &page, total)?
        };

        let maintenance_percents = if catalog.maintenance_percents.is_empty() {
            BTreeMap::new()
        } else {
            let page = self
                .read_page(&reader, StatisticsPage::MaintenancePercents)
                .await?;
            statistics::decode_maintenance_percents(&catalog.maintenance_percents, &page)?
        };

        Ok(Statistics {
            total_products: Some(total),
            product_counts,
            maintenance_counters,
            maintenance_percents,
        })
    }

    /// Request one statistics page, wait until it is ready and read it
    async fn read_page(
        &self,
        reader: &PollingReader<'_>,
        page: StatisticsPage,
    ) -> Result<Vec<u8>, ReadError> {
        if let Err(e) = reader
            .write_checked(MachineCharacteristic::StatisticsCommand, &page.request())
            .await
        {
            warn!("{}: {:?} request not written: {}", self.inner.name, page, e);
        }

        let ready = ReadyCheck {
            offset: STATS_READY_OFFSET,
            forbidden: STATS_NOT_READY,
        };
        reader
            .poll_until_ready(MachineCharacteristic::StatisticsCommand, Some(ready))
            .await?;
        reader
            .poll_until_ready(MachineCharacteristic::StatisticsData, None)
            .await
    }

    // --- alerts ---

    pub fn alerts(&self) -> ActiveAlerts {
        self.inner.state().alerts.clone()
    }

    /// Active alerts not ignored by the alert policy
    pub fn problem_alerts(&self) -> ActiveAlerts {
        self.inner.alert_policy.problems(&self.inner.state().alerts)
    }

    /// Refresh the alert snapshot and return the current one.
    /// On failure the previous snapshot is kept.
    pub async fn read_alerts(&self) -> ActiveAlerts {
        match self.fetch_alerts().await {
            Ok(active) => {
                for (bit, name) in &active {
                    debug!("Alert active. Alert bit: {} - {}", bit, name);
                }
                self.inner.state().alerts = active.clone();
                self.inner.events.notify(ChangeKind::Alerts);
                active
            }
            Err(e) => {
                debug!("{}: no machine status: {}", self.inner.name, e);
                self.alerts()
            }
        }
    }

    async fn fetch_alerts(&self) -> Result<ActiveAlerts, ReadError> {
        let connection = &self.inner.connection;
        let wait = self.inner.poll.connect_wait;
        connection.keep_alive();
        if !connection.wait_connected(wait).await {
            return Err(ReadError::NoLink(wait));
        }

        let reader = PollingReader::new(connection.link(), connection.key(), self.inner.poll);
        let data = reader
            .poll_until_ready(MachineCharacteristic::MachineStatus, None)
            .await?;
        // byte 0 is the key; without a byte after it there is no bit field
        if data.len() < 2 {
            return Err(ReadError::ShortFrame { len: data.len() });
        }
        Ok(alerts::decode_alerts(&data, &self.inner.catalog))
    }

    // --- observers ---

    fn subscribe(
        &self,
        kind: ChangeKind,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.subscribe(kind, Arc::new(handler))
    }

    pub fn on_connectivity_change(
        &self,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(ChangeKind::Connectivity, handler)
    }

    pub fn on_product_change(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe(ChangeKind::Product, handler)
    }

    pub fn on_statistics_change(
        &self,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(ChangeKind::Statistics, handler)
    }

    /// Also runs `handler` right away when alerts are already active
    pub fn on_alerts_change(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
        let handler: Handler = Arc::new(handler);
        let subscription = self
            .inner
            .events
            .subscribe(ChangeKind::Alerts, handler.clone());

        let has_alerts = !self.inner.state().alerts.is_empty();
        if has_alerts {
            handler();
        }
        subscription
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.inner.events.unsubscribe(subscription);
    }

    /// Close the link and stop the link task
    pub async fn shutdown(&self) {
        info!("Shutting down {}", self.inner.name);
        self.inner.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::{Attribute, AttributeOption};
    use crate::infrastructure::bluetooth::encryption;
    use crate::infrastructure::bluetooth::fake::FakeLink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const KEY: EncryptionKey = EncryptionKey(0x2A);

    fn catalog() -> MachineCatalog {
        let attributes = [
            Attribute {
                kind: AttributeKind::CoffeeStrength,
                argument: 3,
                shape: AttributeShape::Options {
                    default: 0x04,
                    items: vec![
                        AttributeOption { name: "mild".into(), value: 0x03 },
                        AttributeOption { name: "strong".into(), value: 0x04 },
                    ],
                },
            },
            Attribute {
                kind: AttributeKind::WaterAmount,
                argument: 4,
                shape: AttributeShape::Numeric { min: 25, max: 240, step: 5, default: 45 },
            },
        ];
        let product = |name: &str, code: u8, active: bool| Product {
            name: name.to_string(),
            code,
            active,
            attributes: attributes
                .iter()
                .cloned()
                .map(|a| (a.kind.clone(), a))
                .collect(),
        };

        MachineCatalog {
            model: "E8".into(),
            products: vec![
                product("Espresso", 0x02, true),
                product("Coffee", 0x03, true),
                product("Service", 0x1F, false),
            ],
            alerts: [(0, "insert tray".to_string()), (13, "coffee ready".to_string())]
                .into_iter()
                .collect(),
            maintenance_counters: vec!["cleaning".into(), "descaling".into()],
            maintenance_percents: vec!["cleaning".into()],
        }
    }

    fn machine(link: &Arc<FakeLink>) -> Machine {
        let resolved = ResolvedMachine {
            catalog: Arc::new(catalog()),
            key: KEY,
        };
        Machine::new("kitchen", resolved, link.clone(), MachineOptions::default())
    }

    fn counter(log: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let log = log.clone();
        move || {
            log.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wire(data: &[u8]) -> Vec<u8> {
        encryption::transform(data, KEY)
    }

    fn stats_link() -> Arc<FakeLink> {
        let link = Arc::new(FakeLink::new("AA:BB"));
        link.set_read(MachineCharacteristic::StatisticsCommand, wire(&[0x2A, 0x00, 0x00]));
        link
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_product_resets_overrides() {
        let link = Arc::new(FakeLink::new("AA:BB"));
        let machine = machine(&link);
        let changes = Arc::new(AtomicUsize::new(0));
        machine.on_product_change(counter(&changes));

        assert!(machine.select_product("Latte").is_none());
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        machine.select_product("Espresso").unwrap();
        assert!(machine.select_attribute_option(AttributeKind::CoffeeStrength, "mild"));
        assert!(!machine.select_attribute_option(AttributeKind::CoffeeStrength, "bold"));
        assert_eq!(
            machine.attribute(&AttributeKind::CoffeeStrength),
            Some(AttributeView::Select {
                options: vec!["mild".into(), "strong".into()],
                current: Some("mild".into()),
            })
        );

        machine.select_product("Coffee").unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert_eq!(
            machine.attribute(&AttributeKind::CoffeeStrength),
            Some(AttributeView::Select {
                options: vec!["mild".into(), "strong".into()],
                current: Some("strong".into()),
            })
        );
        assert!(machine.connection().deadline().is_some());
        machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_command_uses_overrides() {
        let link = Arc::new(FakeLink::new("AA:BB"));
        let machine = machine(&link);
        assert!(machine.build_command().is_none());

        machine.select_product("Espresso");
        machine.set_attribute_value(AttributeKind::WaterAmount, 100);

        let command = machine.build_command().unwrap();
        assert_eq!(command[1], 0x02);
        assert_eq!(command[3], 0x04);
        assert_eq!(command[4], 20);
        assert_eq!(command[17], 0x2A);
        assert_eq!(
            machine.attribute(&AttributeKind::WaterAmount),
            Some(AttributeView::Number { min: 25, max: 240, step: 5, value: 100 })
        );
        machine.shutdown().await;
    }

    #[test]
    fn test_views() {
        let link = Arc::new(FakeLink::new("AA:BB"));
        let machine = machine(&link);

        assert_eq!(machine.product_names(), vec!["Espresso", "Coffee"]);
        assert_eq!(machine.select_kinds(), vec![AttributeKind::CoffeeStrength]);
        assert_eq!(machine.number_kinds(), vec![AttributeKind::WaterAmount]);
        assert!(machine.attribute(&AttributeKind::WaterAmount).is_none());
        assert_eq!(machine.address(), "AA:BB");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_product_writes_command() {
        let link = Arc::new(FakeLink::new("AA:BB"));
        let machine = machine(&link);

        assert!(!machine.start_product());
        machine.select_product("Espresso");
        assert!(machine.start_product());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let writes = link.writes_to(MachineCharacteristic::StartProduct);
        assert_eq!(writes.len(), 1);
        let sent = wire(&writes[0].data);
        assert_eq!(sent.len(), COMMAND_LEN);
        assert_eq!(sent[0], 0x2A);
        assert_eq!(sent[1], 0x02);
        assert_eq!(sent[17], 0x2A);
        machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_statistics() {
        let link = stats_link();
        link.push_read(
            MachineCharacteristic::StatisticsData,
            wire(&[
                0x00, 0x00, 0x64, // total
                0x00, 0x00, 0x05, // code 1: not in the catalog
                0x00, 0xFF, 0xFF, // Espresso
                0x00, 0x00, 0x28, // Coffee
            ]),
        );
        link.push_read(
            MachineCharacteristic::StatisticsData,
            wire(&[0x00, 0x00, 0x0A, 0x00, 0xFF, 0xFF]),
        );
        link.push_read(MachineCharacteristic::StatisticsData, wire(&[30]));

        let machine = machine(&link);
        let changes = Arc::new(AtomicUsize::new(0));
        machine.on_statistics_change(counter(&changes));

        let statistics = machine.read_statistics(true).await;
        assert_eq!(statistics.total_products, Some(100));
        assert_eq!(statistics.product_counts.get("Espresso"), Some(&0));
        assert_eq!(statistics.product_counts.get("Coffee"), Some(&40));
        assert_eq!(statistics.maintenance_counters.get("cleaning"), Some(&10));
        assert_eq!(statistics.maintenance_counters.get("descaling"), Some(&0));
        assert_eq!(statistics.maintenance_percents.get("cleaning"), Some(&70));
        assert_eq!(machine.statistics(), statistics);
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        let requests: Vec<Vec<u8>> = link
            .writes_to(MachineCharacteristic::StatisticsCommand)
            .iter()
            .map(|w| wire(&w.data))
            .collect();
        assert_eq!(
            requests,
            vec![
                vec![0x2A, 0x00, 0x01, 0xFF, 0xFF],
                vec![0x2A, 0x00, 0x04, 0xFF, 0xFF],
                vec![0x2A, 0x00, 0x08, 0xFF, 0xFF],
            ]
        );
        machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_implausible_statistics_keep_snapshot() {
        let link = stats_link();
        link.push_read(
            MachineCharacteristic::StatisticsData,
            wire(&[0x00, 0x00, 0x64, 0x00, 0x00, 0x28]),
        );
        link.push_read(
            MachineCharacteristic::StatisticsData,
            wire(&[0x00, 0x00, 0x0A, 0x00, 0x00, 0x00]),
        );
        link.push_read(MachineCharacteristic::StatisticsData, wire(&[255]));

        let machine = machine(&link);
        let first = machine.read_statistics(true).await;
        assert_eq!(first.total_products, Some(100));
        assert_eq!(first.maintenance_percents.get("cleaning"), Some(&100));

        let changes = Arc::new(AtomicUsize::new(0));
        machine.on_statistics_change(counter(&changes));

        // percent byte between 100 and 255
        link.push_read(
            MachineCharacteristic::StatisticsData,
            wire(&[0x00, 0x00, 0x65, 0x00, 0x00, 0x29]),
        );
        link.push_read(
            MachineCharacteristic::StatisticsData,
            wire(&[0x00, 0x00, 0x0A, 0x00, 0x00, 0x00]),
        );
        link.push_read(MachineCharacteristic::StatisticsData, wire(&[150]));
        assert_eq!(machine.read_statistics(true).await, first);

        // total of zero
        link.push_read(MachineCharacteristic::StatisticsData, wire(&[0x00, 0x00, 0x00]));
        assert_eq!(machine.read_statistics(true).await, first);

        assert_eq!(machine.statistics(), first);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
        machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_without_link_are_not_forced() {
        let link = stats_link();
        let machine = machine(&link);

        let statistics = machine.read_statistics(false).await;
        assert_eq!(statistics, Statistics::default());
        assert_eq!(link.connect_count(), 0);
        assert!(!machine.connection().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_alerts() {
        let link = Arc::new(FakeLink::new("AA:BB"));
        link.push_read_error(MachineCharacteristic::MachineStatus);
        link.push_read(MachineCharacteristic::MachineStatus, wire(&[0x2A, 0x80, 0x04]));

        let machine = machine(&link);
        let early = Arc::new(AtomicUsize::new(0));
        machine.on_alerts_change(counter(&early));
        assert_eq!(early.load(Ordering::SeqCst), 0);

        let active = machine.read_alerts().await;
        assert_eq!(active.keys().copied().collect::<Vec<_>>(), vec![0, 13]);
        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(
            machine.problem_alerts().values().cloned().collect::<Vec<_>>(),
            vec!["insert tray".to_string()]
        );

        let late = Arc::new(AtomicUsize::new(0));
        machine.on_alerts_change(counter(&late));
        assert_eq!(late.load(Ordering::SeqCst), 1);
        machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_alert_read_keeps_snapshot() {
        let link = Arc::new(FakeLink::new("AA:BB"));
        link.push_read(MachineCharacteristic::MachineStatus, wire(&[0x2A, 0x80]));
        let machine = machine(&link);

        assert_eq!(machine.read_alerts().await.len(), 1);

        // queue drained and no sticky value: every poll fails
        let changes = Arc::new(AtomicUsize::new(0));
        let subscription = machine.on_alerts_change(counter(&changes));
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        assert_eq!(machine.read_alerts().await.len(), 1);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        machine.unsubscribe(subscription);
        machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_status_frame_keeps_snapshot() {
        let link = Arc::new(FakeLink::new("AA:BB"));
        link.push_read(MachineCharacteristic::MachineStatus, wire(&[0x2A, 0x80]));
        link.push_read(MachineCharacteristic::MachineStatus, Vec::new());
        link.push_read(MachineCharacteristic::MachineStatus, wire(&[0x2A]));
        let machine = machine(&link);

        let first = machine.read_alerts().await;
        assert_eq!(first.len(), 1);

        let changes = Arc::new(AtomicUsize::new(0));
        machine.on_alerts_change(counter(&changes));
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        assert_eq!(machine.read_alerts().await, first);
        assert_eq!(machine.read_alerts().await, first);
        assert_eq!(machine.alerts(), first);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_statistics_read_keeps_snapshot() {
        let link = stats_link();
        link.push_read(
            MachineCharacteristic::StatisticsData,
            wire(&[0x00, 0x00, 0x64, 0x00, 0x00, 0x28]),
        );
        link.push_read(
            MachineCharacteristic::StatisticsData,
            wire(&[0x00, 0x00, 0x0A, 0x00, 0x00, 0x00]),
        );
        link.push_read(MachineCharacteristic::StatisticsData, wire(&[70]));

        let machine = machine(&link);
        let first = machine.read_statistics(true).await;
        assert_eq!(first.total_products, Some(100));

        let changes = Arc::new(AtomicUsize::new(0));
        machine.on_statistics_change(counter(&changes));

        // the machine never reports the next page ready
        link.set_read(
            MachineCharacteristic::StatisticsCommand,
            wire(&[0x2A, STATS_NOT_READY, 0x00]),
        );
        let read = tokio::time::timeout(Duration::from_secs(3), machine.read_statistics(true));
        assert!(read.await.is_err());

        assert_eq!(machine.statistics(), first);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
        machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_notifications() {
        let link = Arc::new(FakeLink::new("AA:BB"));
        let machine = machine(&link);
        let changes = Arc::new(AtomicUsize::new(0));
        machine.on_connectivity_change(counter(&changes));

        machine.update_advertisement(Some(-60));
        assert_eq!(machine.rssi(), Some(-60));
        assert!(machine.last_seen().is_some());
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        machine.connection().keep_alive();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(machine.is_connected());
        assert_eq!(changes.load(Ordering::SeqCst), 2);

        machine.shutdown().await;
        assert!(!machine.is_connected());
        assert_eq!(changes.load(Ordering::SeqCst), 3);
    }
}
