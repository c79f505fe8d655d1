use jura_ble::domain::catalog::AttributeKind;
use jura_ble::infrastructure::bluetooth::encryption;
use jura_ble::infrastructure::bluetooth::fake::FakeLink;
use jura_ble::infrastructure::bluetooth::protocol::MachineCharacteristic;
use jura_ble::{CatalogError, CatalogResolver, Machine, MachineOptions, ZipCatalog};
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const INDEX: &str = "5000;S8;EF1000\r\n500;ENA 8;EF536\r\n";

const ENA8: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<JOE>
  <PRODUCTS>
    <PRODUCT Name="Espresso" Code="01" Active="true"/>
    <PRODUCT Name="Cappuccino" Code="04">
      <COFFEE_STRENGTH Argument="F3" Default="02">
        <ITEM Name="mild" Value="01"/>
        <ITEM Name="normal" Value="02"/>
        <ITEM Name="strong" Value="03"/>
      </COFFEE_STRENGTH>
      <WATER_AMOUNT Argument="F4" Value="60" Min="25" Max="240" Step="5"/>
      <MILK_FOAM_AMOUNT Argument="F6" Value="14" Min="3" Max="120" Step="1"/>
    </PRODUCT>
  </PRODUCTS>
  <ALERTS>
    <ALERT Bit="1" Name="fill water"/>
  </ALERTS>
</JOE>"#;

fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, contents) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(contents.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn resolver() -> CatalogResolver {
    let bytes = archive(&[
        ("JOE_MACHINES.TXT", INDEX),
        ("documents/xml/EF1000/S8.xml", "<JOE/>"),
        ("documents/xml/EF536/ENA8.xml", ENA8),
    ]);
    CatalogResolver::new(ZipCatalog::new(Cursor::new(bytes)).unwrap())
}

#[test]
fn test_resolution_errors() {
    let resolver = resolver();

    assert!(matches!(
        resolver.resolve(&[0x12, 0, 0, 0, 0x00, 0x00]),
        Err(CatalogError::EmptyModel)
    ));
    assert!(matches!(
        resolver.resolve(&[0x12, 0, 0, 0, 0x32, 0x00]),
        Err(CatalogError::UnsupportedModel(50))
    ));
    assert!(matches!(
        resolver.resolve(&[0x12, 0, 0, 0, 0x88, 0x13]),
        Err(CatalogError::NoProducts)
    ));
}

#[test]
fn test_profile_selected_after_empty_model() {
    let resolver = resolver();

    assert!(matches!(
        resolver.resolve(&[0x12, 0, 0, 0, 0x00, 0x00]),
        Err(CatalogError::EmptyModel)
    ));
    assert_eq!(resolver.cached_models(), 0);

    // next scan, after a profile was picked on the machine
    let resolved = resolver.resolve(&[0x12, 0, 0, 0, 0xF4, 0x01]).unwrap();
    assert_eq!(resolved.catalog.model, "ENA 8");
    assert_eq!(resolver.cached_models(), 1);
}

#[test]
fn test_resolve_from_archive_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resources.zip");
    std::fs::write(
        &path,
        archive(&[
            ("JOE_MACHINES.TXT", INDEX),
            ("documents/xml/EF536/ENA8.xml", ENA8),
        ]),
    )
    .unwrap();

    let resolver = CatalogResolver::new(ZipCatalog::open(&path).unwrap());
    let resolved = resolver.resolve(&[0x12, 0, 0, 0, 0xF4, 0x01]).unwrap();
    assert_eq!(resolved.catalog.model, "ENA 8");
    assert_eq!(resolved.catalog.products.len(), 2);
    assert_eq!(resolved.catalog.alert_name(1), "fill water");
}

#[tokio::test(start_paused = true)]
async fn test_espresso_command() {
    let resolved = resolver()
        .resolve(&[0x12, 0x00, 0x00, 0x00, 0xF4, 0x01])
        .unwrap();
    let link = Arc::new(FakeLink::new("C8:1F:66:00:11:22"));
    let machine = Machine::new("kitchen", resolved, link.clone(), MachineOptions::default());

    machine.select_product("Espresso").unwrap();
    let command = machine.build_command().unwrap();

    let mut expected = [0u8; 18];
    expected[1] = 0x01;
    expected[17] = 0x12;
    assert_eq!(command, expected);

    assert!(machine.start_product());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let writes = link.writes_to(MachineCharacteristic::StartProduct);
    assert_eq!(writes.len(), 1);

    let mut on_wire = expected;
    on_wire[0] = 0x12;
    assert_eq!(
        writes[0].data,
        encryption::transform(&on_wire, machine.key())
    );
    machine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cappuccino_with_overrides() {
    let resolved = resolver()
        .resolve(&[0x2A, 0x00, 0x00, 0x00, 0xF4, 0x01])
        .unwrap();
    let link = Arc::new(FakeLink::new("C8:1F:66:00:11:22"));
    let machine = Machine::new("kitchen", resolved, link, MachineOptions::default());

    machine.select_product("Cappuccino").unwrap();
    let defaults = machine.build_command().unwrap();
    assert_eq!(defaults[1], 0x04);
    assert_eq!(defaults[3], 0x02);
    assert_eq!(defaults[4], 12);
    assert_eq!(defaults[6], 14);

    assert!(machine.select_attribute_option(AttributeKind::CoffeeStrength, "strong"));
    machine.set_attribute_value(AttributeKind::MilkFoamAmount, 20);
    let command = machine.build_command().unwrap();
    assert_eq!(command[3], 0x03);
    assert_eq!(command[6], 20);
    assert_eq!(command[4], defaults[4]);
    machine.shutdown().await;
}
