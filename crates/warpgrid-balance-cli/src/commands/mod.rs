pub mod candidates;
pub mod score;

use std::path::Path;

use anyhow::Context;
use warpgrid_balance::{BalanceModel, BalanceModelBuilder, ClusterSnapshot, Settings};

/// Load the snapshot and settings files and build the balance model.
pub fn load_model(snapshot: &str, settings: Option<&str>) -> anyhow::Result<(BalanceModel, Settings)> {
    let settings = match settings {
        Some(path) => Settings::from_file(Path::new(path))
            .with_context(|| format!("loading settings from {path}"))?,
        None => Settings::default(),
    };
    let json = std::fs::read_to_string(snapshot)
        .with_context(|| format!("reading snapshot {snapshot}"))?;
    let snapshot = ClusterSnapshot::from_json(&json)
        .with_context(|| format!("parsing snapshot {snapshot}"))?;

    let model = BalanceModelBuilder::new(&settings).build(&snapshot)?;
    Ok((model, settings))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Write;

    pub const SNAPSHOT: &str = r#"{
        "nodes": [
            { "node_id": "a", "is_up": true, "fault_domain": "fd:/dc1", "upgrade_domain": "ud0", "capacities": { "Memory": 100 } },
            { "node_id": "b", "is_up": true, "fault_domain": "fd:/dc2", "upgrade_domain": "ud1", "capacities": { "Memory": 100 } },
            { "node_id": "c", "is_up": true, "fault_domain": "fd:/dc3", "upgrade_domain": "ud2", "capacities": { "Memory": 100 } }
        ],
        "services": [
            { "name": "cache", "metrics": [{ "name": "Memory", "weight": 1.0 }],
              "replicas": [
                { "node_index": 0, "loads": [0] },
                { "node_index": 1, "loads": [50] },
                { "node_index": 2, "loads": [50] }
              ] }
        ]
    }"#;

    pub const SETTINGS: &str = r#"
[placement_strategy]
Memory = "reservation"

[defragmentation_empty_node_targets]
Memory = 1.0
"#;

    pub fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }
}
