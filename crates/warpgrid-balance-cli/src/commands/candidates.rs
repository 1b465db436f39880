use anyhow::bail;
use warpgrid_balance::{BalanceModel, DynamicNodeLoadSet};

pub fn candidates(
    snapshot: &str,
    settings: Option<&str>,
    metric: &str,
    count: Option<usize>,
    overlapping: bool,
) -> anyhow::Result<()> {
    let (model, _) = super::load_model(snapshot, settings)?;
    for (node, fraction) in select(&model, metric, count, overlapping)? {
        println!("{:<24} {:>6.1}%", model.nodes[node].node_id, fraction * 100.0);
    }
    Ok(())
}

/// Nodes to empty for `metric`, emptiest first, with their load fraction.
fn select(
    model: &BalanceModel,
    metric: &str,
    count: Option<usize>,
    overlapping: bool,
) -> anyhow::Result<Vec<(usize, f64)>> {
    let Some(total_index) = model.global_total_index(metric) else {
        bail!("unknown metric {metric}");
    };
    let mut set = DynamicNodeLoadSet::new(model, overlapping);
    if !set.tracks_metric(total_index) {
        bail!("metric {metric} does not use reservation based defragmentation");
    }

    let definition = model.metric_by_total_index(total_index);
    let target = count.unwrap_or_else(|| definition.defrag_target());
    let mut selected = Vec::with_capacity(target);
    set.for_each_candidate_node(
        total_index,
        target,
        definition.defrag_distribution,
        |node, fraction| selected.push((node, fraction)),
        false,
    );
    if selected.len() < target {
        tracing::warn!(metric, requested = target, found = selected.len(), "not enough candidate nodes");
    }
    Ok(selected)
}
