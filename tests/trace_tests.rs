mod common;

use common::{scaled_profile, simple_profile, truncate_file};
use heaptrace_studio::trace::TraceReader;
use pretty_assertions::assert_eq;

#[test]
fn test_header_parsed_without_touching_payloads() {
    let fixture = simple_profile();
    let reader = TraceReader::open(fixture.trace_path()).unwrap();

    assert_eq!(reader.initial_time(), 1_700_000_000.0);
    assert_eq!(reader.final_time(), 2.0);
    assert_eq!(reader.sampling_rate(), 1.0);
    assert_eq!(reader.metadata().chunks.len(), 2);
    assert_eq!(reader.metadata().event_count(), 5);
}

#[test]
fn test_events_in_timestamp_order() {
    let fixture = simple_profile();
    let reader = TraceReader::open(fixture.trace_path()).unwrap();

    let events: Vec<_> = reader.events().map(|e| e.unwrap()).collect();
    let times: Vec<f64> = events.iter().map(|e| e.timestamp).collect();
    assert_eq!(times, vec![0.0, 0.25, 0.5, 1.0, 2.0]);
    assert_eq!(events[0].size, 1000);
    assert_eq!(events[3].size, -1000);
    assert_eq!(events[0].stack, fixture.alloc);
}

#[test]
fn test_events_after_skips_whole_chunks() {
    let fixture = simple_profile();
    let reader = TraceReader::open(fixture.trace_path()).unwrap();

    // Strictly-after semantics: the t=1.0 event itself is excluded.
    let times: Vec<f64> = reader
        .events_after(1.0)
        .map(|e| e.unwrap().timestamp)
        .collect();
    assert_eq!(times, vec![2.0]);
}

#[test]
fn test_warm_cache_matches_lazy_decode() {
    let fixture = simple_profile();
    let reader = TraceReader::open(fixture.trace_path()).unwrap();

    let lazy: Vec<_> = reader.events().map(|e| e.unwrap()).collect();
    reader.warm().unwrap();
    assert!(reader.is_warm());
    let warm: Vec<_> = reader.events().map(|e| e.unwrap()).collect();
    assert_eq!(lazy, warm);

    let after: Vec<f64> = reader
        .events_after(0.25)
        .map(|e| e.unwrap().timestamp)
        .collect();
    assert_eq!(after, vec![0.5, 1.0, 2.0]);
}

#[test]
fn test_full_scan_counts_events() {
    let fixture = simple_profile();
    let reader = TraceReader::open(fixture.trace_path()).unwrap();

    let scan = reader.scan().unwrap();
    assert_eq!(scan.event_count, 5);
    assert!(!scan.truncated);
    assert_eq!(scan.boundary_time, 2.0);
}

#[test]
fn test_truncated_trailing_record_is_a_clean_stop() {
    let fixture = simple_profile();
    // Cut into the last record of the trailing chunk, as if the
    // producer died mid-write.
    truncate_file(&fixture.trace_path(), 1);

    let reader = TraceReader::open(fixture.trace_path()).unwrap();
    let scan = reader.scan().unwrap();
    assert!(scan.truncated);
    assert_eq!(scan.event_count, 4);
    // The trailing chunk yielded nothing, so the boundary is its base.
    assert_eq!(scan.boundary_time, 1.5);

    // Iteration sees exactly the complete records, no error.
    let events: Vec<_> = reader.events().map(|e| e.unwrap()).collect();
    assert_eq!(events.len(), 4);
}

#[test]
fn test_per_chunk_sampling_parameters() {
    let (_dir, base) = scaled_profile();
    let reader =
        TraceReader::open(heaptrace_studio::utils::config::trace_path(&base)).unwrap();

    let events: Vec<_> = reader.events().map(|e| e.unwrap()).collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].estimated_bytes(), 100.0);
    // Chunk 1 was recorded at rate 0.5 / scale 2: effective scale 4.
    assert_eq!(events[1].estimated_bytes(), 400.0);
}

#[test]
fn test_chunks_decode_independently() {
    let fixture = simple_profile();
    let reader = TraceReader::open(fixture.trace_path()).unwrap();

    // Decode the second chunk without ever touching the first.
    let chunk = reader.decode_chunk(1).unwrap();
    assert!(!chunk.truncated);
    assert_eq!(chunk.events.len(), 1);
    assert_eq!(chunk.events[0].timestamp, 2.0);

    assert!(reader.decode_chunk(7).is_err());
}
