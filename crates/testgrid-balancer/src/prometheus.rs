//! Prometheus text exposition of a balancer `MetricsSnapshot`.

use std::fmt::Write;

use crate::metrics::{MetricsSnapshot, NodeMetrics};

/// Render the snapshot as Prometheus gauges.
///
/// Node gauges carry a `node` label; strategy gauges carry a `strategy`
/// label. Declarations are emitted even when there is nothing to report.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    let node_gauges: [(&str, &str, fn(&NodeMetrics) -> f64); 6] = [
        ("testgrid_node_load", "Current load (0.0-1.0).", |m| m.stats.current_load),
        ("testgrid_node_weight", "Normalized selection weight.", |m| m.stats.weight),
        ("testgrid_node_health_score", "Health score (0.0-1.0).", |m| m.health_score),
        ("testgrid_node_active_connections", "Tasks bound to the node.", |m| {
            f64::from(m.stats.active_connections)
        }),
        ("testgrid_node_error_rate", "Failed share of selections in the last window.", |m| {
            m.error_rate
        }),
        ("testgrid_node_strategy_effectiveness", "Effectiveness of the active strategy.", |m| {
            m.strategy_effectiveness
        }),
    ];

    for (name, help, value) in node_gauges {
        declare(&mut out, name, help, "gauge");
        for (node_id, metrics) in &snapshot.nodes {
            let _ = writeln!(out, "{name}{{node=\"{node_id}\"}} {:.4}", value(metrics));
        }
    }

    declare(&mut out, "testgrid_strategy_success_rate", "1 - error rate over the last window.", "gauge");
    declare(&mut out, "testgrid_strategy_load_balance_score", "1 - stddev of node loads.", "gauge");
    declare(&mut out, "testgrid_strategy_selection_seconds", "Mean selection time in seconds.", "gauge");
    declare(&mut out, "testgrid_strategy_transitions_total", "Strategy changes since start.", "counter");
    if let Some(s) = &snapshot.strategy {
        let label = s.strategy.as_str();
        let _ = writeln!(out, "testgrid_strategy_success_rate{{strategy=\"{label}\"}} {:.4}", s.success_rate);
        let _ = writeln!(
            out,
            "testgrid_strategy_load_balance_score{{strategy=\"{label}\"}} {:.4}",
            s.load_balance_score
        );
        let _ = writeln!(
            out,
            "testgrid_strategy_selection_seconds{{strategy=\"{label}\"}} {:.6}",
            s.avg_selection_time
        );
        let _ = writeln!(
            out,
            "testgrid_strategy_transitions_total{{strategy=\"{label}\"}} {}",
            s.transition_count
        );
    }

    out
}

fn declare(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::metrics::{NodeStats, StrategyMetrics};
    use crate::strategy::Strategy;

    fn node(id: &str, load: f64) -> NodeMetrics {
        NodeMetrics {
            node_id: id.to_string(),
            timestamp: 1000,
            stats: NodeStats {
                current_load: load,
                cpu_usage: 0.2,
                memory_usage: 0.4,
                network_latency: 0.01,
                active_connections: 2,
                avg_response_time: Some(1.5),
                predicted_load: None,
                weight: 0.25,
            },
            strategy_effectiveness: 0.75,
            resource_utilization: 0.3,
            error_rate: 0.0,
            health_score: 1.0,
        }
    }

    #[test]
    fn empty_snapshot_still_declares() {
        let output = render_prometheus(&MetricsSnapshot {
            nodes: BTreeMap::new(),
            strategy: None,
        });
        assert!(output.contains("# TYPE testgrid_node_load gauge"));
        assert!(output.contains("# TYPE testgrid_strategy_transitions_total counter"));
        assert!(!output.contains("node=\""));
    }

    #[test]
    fn renders_nodes_and_strategy() {
        let snapshot = MetricsSnapshot {
            nodes: BTreeMap::from([
                ("w1".to_string(), node("w1", 0.5)),
                ("w2".to_string(), node("w2", 0.1)),
            ]),
            strategy: Some(StrategyMetrics {
                strategy: Strategy::LeastLoad,
                timestamp: 1000,
                avg_selection_time: 0.0005,
                selections: 4,
                success_rate: 0.75,
                load_balance_score: 0.9,
                resource_efficiency: 0.3,
                node_utilization: BTreeMap::new(),
                transition_count: 2,
                last_transition: Some(900),
            }),
        };
        let output = render_prometheus(&snapshot);

        assert!(output.contains("testgrid_node_load{node=\"w1\"} 0.5000"));
        assert!(output.contains("testgrid_node_load{node=\"w2\"} 0.1000"));
        assert!(output.contains("testgrid_node_active_connections{node=\"w1\"} 2.0000"));
        assert!(output.contains("testgrid_strategy_success_rate{strategy=\"least_load\"} 0.7500"));
        assert!(output.contains("testgrid_strategy_transitions_total{strategy=\"least_load\"} 2"));
    }
}
