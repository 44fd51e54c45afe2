use mlsync_sync::{AddressMatcher, BuildingRegistry};

#[tokio::test]
async fn workspace_registry_loads_and_every_building_matches_itself() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let registry = BuildingRegistry::load(&root.join("buildings.yaml"))
        .await
        .expect("buildings.yaml");
    assert!(!registry.buildings.is_empty());

    let matcher = AddressMatcher::default();
    for building in &registry.buildings {
        let result = matcher.match_address(&building.address, Some(&building.name), &registry.buildings);
        assert_eq!(
            result.partition_key.as_deref(),
            Some(building.key.as_str()),
            "{} should match itself",
            building.address
        );
        assert_eq!(result.confidence, 1.0);
    }
}
