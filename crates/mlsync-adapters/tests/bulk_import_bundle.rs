use chrono::{TimeZone, Utc};
use mlsync_adapters::{bulk_bundle_to_records, load_bulk_import_bundle};
use mlsync_core::{ListingStatus, ListingType, Origin};

#[test]
fn sample_bulk_bundle_maps_to_bulk_import_records() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let bundle = load_bulk_import_bundle(root.join("fixtures/bulk/sample.json")).expect("bundle");
    assert_eq!(bundle.import_id, "sold-history-2025q4");

    let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
    let records = bulk_bundle_to_records(&bundle, now).expect("records");
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.origin == Origin::BulkImport));

    let modern = &records[0];
    assert_eq!(modern.id, "4410021");
    assert_eq!(modern.address, "222 West Ave");
    assert_eq!(modern.status, ListingStatus::Closed);
    assert_eq!(modern.price_per_sqft, Some(562.0));
    assert_eq!(modern.imported_at, bundle.imported_at.unwrap());

    let lease = &records[2];
    assert_eq!(lease.listing_type, ListingType::Lease);
    assert_eq!(lease.modified_at, bundle.imported_at.unwrap());
    assert!(lease.close_price.is_none());
}
