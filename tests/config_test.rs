//! Integration tests for configuration and zone file loading

use std::fs;
use std::io::Write;
use tempfile::{tempdir, NamedTempFile};
use zonewatch::domain::{load_zone_file, ReferencePoint, ZoneId};
use zonewatch::infra::{Config, HierarchyPolicy};
use zonewatch::services::GeometryIndex;

const ZONES_JSON: &str = r#"{
    "zones": [
        {
            "id": "HALL",
            "name": "Hall",
            "aisle_id": "H",
            "camera_id": "CAM_01",
            "polygon": [[0, 0], [1000, 0], [1000, 700], [0, 700]]
        },
        {
            "id": "ROI_A01",
            "name": "Aisle A-01",
            "aisle_id": "A-01",
            "camera_id": "CAM_01",
            "parent_id": "HALL",
            "points": [[100, 200], [400, 200], [400, 600], [100, 600]],
            "reference_point": "centroid",
            "is_active": false,
            "dwell_threshold_sec": 2.5
        }
    ]
}"#;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "dc-north"

[mqtt]
host = "broker.local"
port = 1884

[ingress]
topic = "cam01/frames"

[egress]
topic = "dc-north/zone-events"
queue_size = 200
high_water_pct = 50
diagnostics_file = "/var/log/zonewatch/undelivered.jsonl"

[zones]
file = "zones.json"
frame_width = 1920
frame_height = 1080
hierarchy_policy = "propagate"

[membership]
tolerance_ms = 1500
dwell_threshold_ms = 3000
track_lost_ms = 4000

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), Some("dc-north"));
    assert_eq!(config.mqtt_host(), "broker.local");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.ingress_topic(), "cam01/frames");
    assert_eq!(config.ingress_queue_size(), 256);
    assert_eq!(config.egress_topic(), "dc-north/zone-events");
    assert_eq!(config.egress_high_water(), 100);
    assert_eq!(config.diagnostics_file(), Some("/var/log/zonewatch/undelivered.jsonl"));
    assert_eq!(config.hierarchy_policy(), HierarchyPolicy::Propagate);
    assert_eq!(config.frame_bounds().width, 1920.0);
    assert_eq!(config.tolerance_ms(), 1500);
    assert_eq!(config.dwell_threshold_ms(), 3000);
    assert_eq!(config.track_lost_ms(), 4000);
    assert_eq!(config.prometheus_port(), 9091);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(
        temp_file,
        r#"
[mqtt]
host = "localhost"
port = 1883

[zones]
file = "zones.json"
"#
    )
    .unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.site_id(), None);
    assert_eq!(config.egress_topic(), "zonewatch/events");
    assert_eq!(config.hierarchy_policy(), HierarchyPolicy::Independent);
    assert_eq!(config.tolerance_ms(), 1000);
    assert_eq!(config.dwell_threshold_ms(), 0);
    // Track loss follows the tolerance window unless set
    assert_eq!(config.track_lost_ms(), 1000);
    assert_eq!(config.prometheus_port(), 0);
}

#[test]
fn test_missing_config_is_fatal() {
    let err = Config::from_file("/nonexistent/zonewatch.toml").unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/zonewatch.toml"));
}

#[test]
fn test_invalid_config_is_fatal() {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(
        temp_file,
        r#"
[mqtt]
host = "localhost"
port = 1883

[zones]
file = "zones.json"
hierarchy_policy = "sideways"
"#
    )
    .unwrap();
    assert!(Config::from_file(temp_file.path()).is_err());

    let mut temp_file = NamedTempFile::new().unwrap();
    write!(
        temp_file,
        r#"
[mqtt]
host = "localhost"
port = 1883

[egress]
queue_size = 0

[zones]
file = "zones.json"
"#
    )
    .unwrap();
    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("queue sizes"));
}

#[test]
fn test_load_zone_file_with_legacy_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("zones.json");
    fs::write(&path, ZONES_JSON).unwrap();

    let zones = load_zone_file(&path, Default::default()).unwrap();
    let geometry = GeometryIndex::new(zones).unwrap();
    assert_eq!(geometry.len(), 2);

    let aisle = geometry.get(&ZoneId::new("ROI_A01")).unwrap();
    assert_eq!(aisle.parent_id, Some(ZoneId::new("HALL")));
    assert_eq!(aisle.reference_point, ReferencePoint::Centroid);
    assert!(!aisle.active);
    assert_eq!(aisle.dwell_threshold_ms, Some(2500));
}

#[test]
fn test_bad_zone_file_is_fatal() {
    let dir = tempdir().unwrap();

    let missing = dir.path().join("missing.json");
    let err = load_zone_file(&missing, Default::default()).unwrap_err();
    assert!(format!("{err:#}").contains("missing.json"));

    let unknown_mode = dir.path().join("unknown_mode.json");
    fs::write(
        &unknown_mode,
        r#"{"zones": [{"id": "Z", "name": "Z", "aisle_id": "Z", "camera_id": "C",
            "polygon": [[0, 0], [10, 0], [10, 10]], "reference_point": "feet"}]}"#,
    )
    .unwrap();
    let err = load_zone_file(&unknown_mode, Default::default()).unwrap_err();
    assert!(format!("{err:#}").contains("feet"));

    let unknown_parent = dir.path().join("unknown_parent.json");
    fs::write(
        &unknown_parent,
        r#"{"zones": [{"id": "Z", "name": "Z", "aisle_id": "Z", "camera_id": "C",
            "polygon": [[0, 0], [10, 0], [10, 10]], "parent_id": "NOPE"}]}"#,
    )
    .unwrap();
    let zones = load_zone_file(&unknown_parent, Default::default()).unwrap();
    assert!(GeometryIndex::new(zones).is_err());
}
