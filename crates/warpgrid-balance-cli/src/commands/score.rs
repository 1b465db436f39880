use serde_json::json;
use warpgrid_balance::{DynamicNodeLoadSet, Score};

use crate::Format;

pub fn score(snapshot: &str, settings: Option<&str>, cost: f64, format: Format) -> anyhow::Result<()> {
    let (model, settings) = super::load_model(snapshot, settings)?;
    let mut set = DynamicNodeLoadSet::new(&model, settings.nodes_with_reserved_load_overlap);
    let mut score = Score::new(&model, &settings);
    score.calculate(cost, &mut set);

    let report = report(&model, &score, &mut set);
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print!("{}", format_report(&report)),
    }
    Ok(())
}

fn report(
    model: &warpgrid_balance::BalanceModel,
    score: &Score,
    set: &mut DynamicNodeLoadSet,
) -> serde_json::Value {
    let global = model.global_domain();
    let metrics: Vec<_> = score
        .domains()
        .last()
        .map(|d| d.metrics.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|metric| {
            let mut empty_nodes = Vec::new();
            if set.tracks_metric(metric.total_index) {
                set.advance_version();
                set.prepare_beneficial_nodes(metric.total_index, metric.defrag_target(), metric.defrag_distribution);
                empty_nodes = (0..model.nodes.len())
                    .filter(|&n| set.is_beneficial_node(n, metric.total_index))
                    .map(|n| model.nodes[n].node_id.clone())
                    .collect();
            }
            json!({
                "name": metric.name,
                "std_dev": score.std_dev_for_metric(&metric.name),
                "balanced": metric.is_balanced,
                "cluster_load": metric.cluster_load,
                "cluster_capacity": metric.cluster_total_capacity,
                "empty_nodes": empty_nodes,
            })
        })
        .collect();

    json!({
        "nodes": model.nodes.len(),
        "down_nodes": model.down_nodes.len(),
        "local_domains": model.local_domains().len(),
        "global_metrics": global.metric_count(),
        "avg_std_dev": score.avg_std_dev(),
        "energy": score.energy(),
        "defrag_target_achieved": score.defrag_target_empty_nodes_achieved(),
        "metrics": metrics,
    })
}

fn format_report(report: &serde_json::Value) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "nodes: {} ({} down), local domains: {}, metrics: {}\n",
        report["nodes"], report["down_nodes"], report["local_domains"], report["global_metrics"]
    ));
    out.push_str(&format!("avg std dev: {:.6}\n", report["avg_std_dev"].as_f64().unwrap_or_default()));
    out.push_str(&format!("energy:      {:.6}\n", report["energy"].as_f64().unwrap_or_default()));
    if report["defrag_target_achieved"].as_bool() == Some(true) {
        out.push_str("defrag target: achieved\n");
    }
    for metric in report["metrics"].as_array().into_iter().flatten() {
        let status = if metric["balanced"].as_bool() == Some(true) { "balanced" } else { "imbalanced" };
        out.push_str(&format!(
            "  {:<24} {:>10.6}  {status}",
            metric["name"].as_str().unwrap_or_default(),
            metric["std_dev"].as_f64().unwrap_or_default(),
        ));
        let empty: Vec<&str> = metric["empty_nodes"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|n| n.as_str())
            .collect();
        if !empty.is_empty() {
            out.push_str(&format!("  keep empty: {}", empty.join(", ")));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures;

    #[test]
    fn reports_empty_nodes_for_reservation_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = fixtures::write(&dir, "cluster.json", fixtures::SNAPSHOT);
        let settings = fixtures::write(&dir, "balance.toml", fixtures::SETTINGS);

        let (model, settings) = crate::commands::load_model(&snapshot, Some(&settings)).unwrap();
        let mut set = DynamicNodeLoadSet::new(&model, false);
        let mut score = Score::new(&model, &settings);
        score.calculate(0.0, &mut set);
        let report = report(&model, &score, &mut set);

        assert_eq!(report["defrag_target_achieved"], true);
        assert_eq!(report["metrics"][0]["name"], "Memory");
        assert_eq!(report["metrics"][0]["empty_nodes"], json!(["a"]));

        let text = format_report(&report);
        assert!(text.contains("keep empty: a"));
        assert!(text.contains("defrag target: achieved"));
    }

    #[test]
    fn scoring_without_settings_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = fixtures::write(&dir, "cluster.json", fixtures::SNAPSHOT);
        assert!(score(&snapshot, None, 0.0, Format::Json).is_ok());
    }
}
