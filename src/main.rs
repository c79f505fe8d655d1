use jura_ble::domain::settings::SettingsService;
use jura_ble::infrastructure::bluetooth::scanner;
use jura_ble::infrastructure::bluetooth::BtleplugLink;
use jura_ble::infrastructure::logging;
use jura_ble::{CatalogError, CatalogResolver, Machine, ZipCatalog};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = logging::init_logger(&settings.log_settings)?;
    info!("Starting Jura BLE (settings at {})", settings_service.path().display());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let update_interval = Duration::from_secs(settings.update_interval_secs.max(1));

    let adapter = scanner::get_adapter().await?;
    let resolver = CatalogResolver::new(ZipCatalog::open(&settings.catalog_path)?);

    // a machine without a selected profile advertises model 0; look again later
    let (found, resolved) = loop {
        let found = scanner::find_machine(
            &adapter,
            settings.device_address.as_deref(),
            Duration::from_secs(settings.scan_timeout_secs),
        )
        .await?;
        info!("Found {} at {}", found.name, found.address);

        match resolver.resolve(&found.advertisement) {
            Ok(resolved) => break (found, resolved),
            Err(CatalogError::EmptyModel) => {
                info!(
                    "{} has no machine profile selected yet, retrying in {:?}",
                    found.address, update_interval
                );
            }
            Err(e @ CatalogError::UnsupportedModel(_)) => {
                error!("{}: {}", found.address, e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        tokio::select! {
            _ = tokio::time::sleep(update_interval) => {}
            _ = &mut shutdown => {
                info!("Ctrl-C received");
                return Ok(());
            }
        }
    };

    if let Err(e) = settings_service.remember_device(&found.address) {
        warn!("Could not save device address: {}", e);
    }

    let link = Arc::new(BtleplugLink::new(found.peripheral.clone()));
    let machine = Machine::new(
        settings.machine_name.clone(),
        resolved,
        link,
        settings.machine_options(),
    );
    machine.update_advertisement(found.rssi);
    info!(
        "{} is a {} with {} products and {} known alerts",
        machine.name(),
        machine.model(),
        machine.product_names().len(),
        machine.catalog().alerts.len()
    );

    {
        let observed = machine.clone();
        machine.on_connectivity_change(move || {
            debug!(
                "Connected: {}, rssi: {:?}",
                observed.is_connected(),
                observed.rssi()
            )
        });
    }
    {
        let observed = machine.clone();
        machine.on_statistics_change(move || {
            let statistics = observed.statistics();
            match serde_json::to_string(&statistics) {
                Ok(json) => info!("Statistics: {}", json),
                Err(e) => warn!("Could not format statistics: {}", e),
            }
        });
    }
    {
        let observed = machine.clone();
        machine.on_alerts_change(move || {
            for (bit, name) in observed.problem_alerts() {
                warn!("Alert {}: {}", bit, name);
            }
        });
    }

    let mut refresh = tokio::time::interval(update_interval);
    loop {
        tokio::select! {
            _ = refresh.tick() => {
                match scanner::refresh_advertisement(&found.peripheral).await {
                    Ok(Some((_, rssi))) => machine.update_advertisement(rssi),
                    Ok(None) => {}
                    Err(e) => debug!("No advertisement: {}", e),
                }
                // the status read brings the link up; statistics reuse it
                machine.read_alerts().await;
                machine.read_statistics(false).await;
            }
            _ = &mut shutdown => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    machine.shutdown().await;
    Ok(())
}
