//! Human-readable output.

use colored::Colorize;
use smtrace_core::{Model, StatusValue};
use smtrace_driver::Analysis;

fn status(status: StatusValue) -> String {
    let text = status.to_string();
    match status {
        StatusValue::Valid => text.green().to_string(),
        StatusValue::Invalid => text.red().bold().to_string(),
        StatusValue::Uncertain => text.yellow().to_string(),
        StatusValue::Pending => text.dimmed().to_string(),
    }
}

/// Renders the result of a run.
pub fn analysis(analysis: &Analysis) -> String {
    let stats = &analysis.stats;
    let mut output = format!(
        "{} {} (checksum: {})\n",
        "Model".bold(),
        analysis.model.cyan(),
        analysis.checksum
    );

    output.push_str(&format!(
        "  events: {} received, {} filtered, {} unmatched\n",
        stats.received, stats.filtered, stats.unmatched
    ));
    output.push_str(&format!(
        "  instances: {} spawned, {} closed, {} {}, {} {}\n",
        stats.spawned,
        stats.closed,
        analysis.valid_instances,
        "valid".green(),
        analysis.invalid_instances,
        "invalid".red()
    ));
    let overall = if analysis.invalid_instances > 0 {
        StatusValue::Invalid
    } else {
        StatusValue::Valid
    };
    output.push_str(&format!("  overall: {}\n", status(overall)));

    if !analysis.adaptive.is_empty() {
        output.push_str(&format!(
            "{} ({})\n",
            "Adaptive constraints".bold(),
            analysis.strategy
        ));
        for slot in &analysis.adaptive {
            let decision = match &slot.decision {
                Some(decision) => decision.cyan(),
                None => "undecided".yellow(),
            };
            output.push_str(&format!(
                "  {} => {} ({} samples)\n",
                slot.constraint, decision, slot.samples
            ));
        }
        if analysis.dropped_verdicts > 0 {
            output.push_str(&format!(
                "  {} undecided verdicts dropped\n",
                analysis.dropped_verdicts
            ));
        }
    }

    let invalid: Vec<_> = analysis.invalid_segments().collect();
    if invalid.is_empty() {
        output.push_str(&format!("{}\n", "No invalid segments".green()));
    } else {
        output.push_str(&format!(
            "{} ({})\n",
            "Invalid segments".bold(),
            invalid.len()
        ));
        for segment in invalid {
            output.push_str(&format!("  {}\n", segment));
        }
    }

    if !analysis.instances.is_empty() {
        output.push_str(&format!("{}\n", "Instances".bold()));
        for instance in &analysis.instances {
            output.push_str(&instance.to_string());
        }
    }

    if !analysis.timings.is_empty() {
        output.push_str(&format!("{}\n", "Timings".dimmed()));
        for m in &analysis.timings {
            let items = m.items.map(|n| format!(" ({} items)", n)).unwrap_or_default();
            output.push_str(&format!("  {:<10} {:?}{}\n", m.name, m.elapsed(), items));
        }
    }

    output
}

/// Renders the structure of a model.
pub fn model_summary(model: &Model) -> String {
    let mut output = format!(
        "{} {} (checksum: {})\n",
        "Valid model".green(),
        model.name().cyan(),
        model.checksum()
    );

    output.push_str("  nodes:\n");
    for node in model.nodes() {
        let vars: Vec<&str> = node.variables().iter().map(|v| v.name.as_str()).collect();
        let terminal = if node.is_terminal() { " (terminal)" } else { "" };
        if vars.is_empty() {
            output.push_str(&format!("    {}{}\n", node.name(), terminal));
        } else {
            output.push_str(&format!(
                "    {} [{}]{}\n",
                node.name(),
                vars.join(", "),
                terminal
            ));
        }
    }

    let mut events: Vec<&str> = model.reachable_events().iter().map(String::as_str).collect();
    events.sort_unstable();
    output.push_str(&format!("  reachable events: {}\n", events.join(", ")));

    let constraints: Vec<_> = model.constraints().collect();
    if !constraints.is_empty() {
        output.push_str("  constraints:\n");
        for c in constraints {
            let kind = if c.is_adaptive() { " (adaptive)" } else { "" };
            output.push_str(&format!("    {} {}{}\n", c.id(), c, kind));
        }
    }

    for (node, index) in model.shadowed_transitions() {
        let source = node.map_or("<initial>", |id| model.node(id).name());
        output.push_str(&format!(
            "  {}: transition #{} from {} can never be selected\n",
            "Warning".yellow(),
            index,
            source
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_summary_lists_structure() {
        colored::control::set_override(false);
        let model = Model::from_json(&json!({
            "name": "io",
            "nodes": [{"name": "busy", "variables": [{"name": "deadline/t"}]}, {"name": "done"}],
            "initial": [{"event": "enter", "to": "busy"}],
            "transitions": [
                {"from": "busy", "event": "exit", "to": "done", "guards": ["deadline/t < ?"]}
            ]
        }))
        .unwrap();

        let text = model_summary(&model);
        assert!(text.starts_with("Valid model io (checksum: "));
        assert!(text.contains("    busy [deadline/t]\n"));
        assert!(text.contains("    done (terminal)\n"));
        assert!(text.contains("  reachable events: enter, exit\n"));
        assert!(text.contains("(adaptive)\n"));
        assert!(!text.contains("Warning"));
    }
}
