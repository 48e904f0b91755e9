mod common;

use common::simple_profile;
use heaptrace_studio::timeplot::GroupBy;
use heaptrace_studio::trace::FrameId;
use pretty_assertions::assert_eq;

// main.py:1 is the first interned frame in the fixture's stack table.
const MAIN: FrameId = FrameId(0);

#[test]
fn test_flow_graph_attribution() {
    let fixture = simple_profile();
    let reader = fixture.open();

    let graph = reader.flow_graph_at(0.5).unwrap();
    assert_eq!(graph.total_usage, 1700.0);
    assert_eq!(graph.root_cumulative(), 1700.0);
    // Local usage partitions the total across innermost frames.
    assert_eq!(graph.node_local.values().sum::<f64>(), 1700.0);
    // main.py:1 is shared by the alloc and cache stacks but not io.
    assert_eq!(graph.node_cumulative[&MAIN], 1500.0);
    assert_eq!(graph.edge_usage[&(FrameId::ROOT, MAIN)], 1500.0);
}

#[test]
fn test_flow_graph_diff_between_times() {
    let fixture = simple_profile();
    let reader = fixture.open();

    let before = reader.flow_graph_at(0.5).unwrap();
    let after = reader.flow_graph_at(2.0).unwrap();
    let delta = after.compare(&before);

    // 1000 freed, 500 newly allocated under cache.
    assert_eq!(delta.total_usage, -500.0);
    assert_eq!(delta.node_cumulative[&MAIN], -500.0);
    // Identical inputs cancel exactly; entries remain, at zero.
    let zero = after.compare(&after);
    assert_eq!(zero.total_usage, 0.0);
    assert!(zero.node_cumulative.values().all(|&v| v == 0.0));
    assert!(zero.node_local.values().all(|&v| v == 0.0));
}

#[test]
fn test_flow_graph_filter_preserves_totals() {
    let fixture = simple_profile();
    let reader = fixture.open();

    let graph = reader.flow_graph_at(0.5).unwrap();
    // An aggressive node floor folds io.py (200 of 1700) into "other".
    let filtered = graph.filtered(0.2, 0.05);
    assert_eq!(filtered.total_usage, graph.total_usage);
    assert_eq!(
        filtered.node_local.values().sum::<f64>(),
        graph.node_local.values().sum::<f64>()
    );
    assert!(filtered.node_cumulative.contains_key(&FrameId::OTHER));
}

#[test]
fn test_flame_graph_folded_export() {
    let fixture = simple_profile();
    let reader = fixture.open();

    let flame = reader.flame_graph_at(0.5).unwrap();
    assert_eq!(flame.total_usage(), 1700.0);

    let folded = flame.folded(reader.stack_table());
    let lines: Vec<_> = folded.lines().collect();
    assert!(lines.contains(&"main.py:1;alloc.py:2 1000"));
    assert!(lines.contains(&"main.py:1;cache.py:3 500"));
    assert!(lines.contains(&"io.py:9 200"));
    assert_eq!(lines.len(), 3);

    // Exports of the same snapshot are byte-identical.
    assert_eq!(folded, reader.flame_graph_at(0.5).unwrap().folded(reader.stack_table()));
}

#[test]
fn test_time_plot_series_cover_totals() {
    let fixture = simple_profile();
    let reader = fixture.open();

    let plot = reader.time_plot(1.0, GroupBy::Frame, 10).unwrap();
    assert_eq!(plot.times, vec![0.0, 1.0, 2.0]);
    assert_eq!(plot.total, vec![1000.0, 700.0, 1200.0]);
    assert_eq!(plot.peak_total(), 1200.0);
    for i in 0..plot.times.len() {
        let column: f64 = plot.series.iter().map(|s| s[i]).sum();
        assert_eq!(column, plot.total[i], "sample {}", i);
    }
}

#[test]
fn test_time_plot_top_n_bucketing() {
    let fixture = simple_profile();
    let reader = fixture.open();

    let plot = reader.time_plot(1.0, GroupBy::Frame, 1).unwrap();
    // alloc.py:2 and cache.py:3 both peak at 1000; the tie breaks
    // lexicographically, and everything unnamed folds into other.
    assert_eq!(plot.labels, vec!["alloc.py:2", "other"]);
    assert_eq!(plot.series[0], vec![1000.0, 0.0, 0.0]);
    assert_eq!(plot.series[1], vec![0.0, 700.0, 1200.0]);
}

#[test]
fn test_time_plot_csv_export() {
    let fixture = simple_profile();
    let reader = fixture.open();

    let plot = reader.time_plot(1.0, GroupBy::File, 10).unwrap();
    let csv = plot.to_csv();
    let lines: Vec<_> = csv.lines().collect();
    assert_eq!(lines.len(), 1 + plot.times.len());
    assert!(lines[0].starts_with("time,total,"));
    // Grouping by file uses the innermost frame's file.
    assert!(lines[0].contains("alloc.py"));
    assert!(lines[0].contains("io.py"));
}
