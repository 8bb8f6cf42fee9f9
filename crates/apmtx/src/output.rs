use std::collections::HashMap;

use apmtx_agent::SegmentSnapshot;
use apmtx_core::config::AgentConfig;
use apmtx_core::ids::SegmentId;
use chrono::SecondsFormat;

use crate::simulate::SimulationReport;

pub fn print_config_human(cfg: &AgentConfig) {
    println!("app_name={}", cfg.app_name);
    println!(
        "force_synchronous_timing_http_client={}",
        cfg.force_synchronous_timing_http_client
    );
    println!(
        "distributed_tracing_enabled={}",
        cfg.distributed_tracing_enabled
    );
    println!(
        "cross_application_tracing_enabled={}",
        cfg.cross_application_tracing_enabled
    );
    println!(
        "trusted_account_key={}",
        cfg.trusted_account_key.as_deref().unwrap_or("-")
    );
    println!("attribute_value_max_bytes={}", cfg.attribute_value_max_bytes);
    println!(
        "error_stack_trace_max_frames={}",
        cfg.error_stack_trace_max_frames
    );
}

pub fn print_simulation_human(report: &SimulationReport) {
    let tx = &report.transaction;
    println!(
        "TRANSACTION {} guid={} duration={}ms segments={} unfinished={} async={}",
        tx.name,
        tx.guid,
        tx.duration().as_millis(),
        tx.segments.len(),
        tx.unfinished_segments(),
        tx.attached_to_async
    );
    println!(
        "trace={} start={}",
        tx.trace_id,
        tx.start.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    print_segment_tree(&tx.segments);

    let user = tx.metadata.user_attributes();
    println!("user_attributes={}", user.len());
    for (key, value) in user {
        println!("  {key}={value}");
    }

    for trace in &report.error_traces {
        println!(
            "ERROR {} class={} message=\"{}\" frames={}",
            trace.path,
            trace.exception_class_name,
            trace.message,
            trace.attributes.stack_trace.as_ref().map_or(0, Vec::len)
        );
    }
    println!(
        "-- {} error traces, {} suppressed instrumentation failures --",
        report.error_traces.len(),
        report.suppressed_exceptions
    );
}

fn print_segment_tree(segments: &[SegmentSnapshot]) {
    let mut children: HashMap<Option<SegmentId>, Vec<&SegmentSnapshot>> = HashMap::new();
    for segment in segments {
        children.entry(segment.parent_id).or_default().push(segment);
    }
    if let Some(roots) = children.get(&None) {
        for root in roots {
            print_node(root, &children, 0);
        }
    }
}

fn print_node(
    segment: &SegmentSnapshot,
    children: &HashMap<Option<SegmentId>, Vec<&SegmentSnapshot>>,
    depth: usize,
) {
    let indent = "  ".repeat(depth);
    let millis = |d: Option<std::time::Duration>| {
        d.map_or_else(|| "-".to_string(), |d| d.as_millis().to_string())
    };
    println!(
        "{}{} duration={}ms exclusive={}ms{}",
        indent,
        segment.name,
        millis(segment.duration),
        millis(segment.exclusive),
        if segment.detached { " detached" } else { "" }
    );

    if let Some(kids) = children.get(&Some(segment.id)) {
        for child in kids {
            print_node(child, children, depth + 1);
        }
    }
}
