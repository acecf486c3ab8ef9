use refcycle::{FinalizerContext, FinalizerError, GcConfig, Heap, HeapError, ObjectSpec, Resolved, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn manual_heap() -> Heap {
    Heap::with_config(GcConfig::disabled()).unwrap()
}

fn counting(calls: &Arc<AtomicUsize>) -> impl FnOnce(&mut FinalizerContext<'_>) -> Result<(), FinalizerError> + Send {
    let calls = Arc::clone(calls);
    move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_two_node_cycle_collected_by_gen0() {
    let mut heap = manual_heap();
    let a = heap.allocate(ObjectSpec::labeled("A")).unwrap();
    let b = heap.allocate(ObjectSpec::labeled("B")).unwrap();
    heap.set_field(a, "other", b).unwrap();
    heap.set_field(b, "other", a).unwrap();
    heap.drop_root(a).unwrap();
    heap.drop_root(b).unwrap();

    // Counting alone cannot free a cycle
    assert!(heap.is_alive(a) && heap.is_alive(b));

    let report = heap.collect(0).unwrap();
    assert_eq!(report.reclaimed, vec![a, b]);
    assert!(report.uncollectable.is_empty());
    assert!(report.check().is_ok());
}

#[test]
fn test_chain_kept_alive_by_head() {
    let mut heap = manual_heap();
    let a = heap.allocate(ObjectSpec::labeled("A")).unwrap();
    let b = heap.allocate(ObjectSpec::labeled("B")).unwrap();
    let c = heap.allocate(ObjectSpec::labeled("C")).unwrap();
    heap.set_field(a, "next", b).unwrap();
    heap.set_field(b, "next", c).unwrap();

    assert!(heap.drop_root(b).unwrap().is_empty());
    assert!(heap.drop_root(c).unwrap().is_empty());
    assert_eq!(heap.refcount(c).unwrap(), 1);
    assert_eq!(heap.live_objects(), 3);

    let sweep = heap.drop_root(a).unwrap();
    assert_eq!(sweep.reclaimed.len(), 3);
    assert_eq!(heap.live_objects(), 0);
}

#[test]
fn test_weak_ref_gone_without_collect() {
    let mut heap = manual_heap();
    let x = heap.allocate(ObjectSpec::labeled("X")).unwrap();
    let weak = heap.create_weak(x).unwrap();
    assert_eq!(heap.resolve_weak(weak).unwrap().object(), Some(x));

    heap.drop_root(x).unwrap();
    assert_eq!(heap.resolve_weak(weak).unwrap(), Resolved::Gone);
    assert_eq!(heap.stats().total_collections(), 0);
}

#[test]
fn test_break_cycles_before_drop() {
    let mut heap = manual_heap();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut pairs = Vec::new();
    for i in 0..3 {
        let a = heap
            .allocate(ObjectSpec::labeled(format!("A{}", i)).finalizer(counting(&calls)))
            .unwrap();
        let b = heap
            .allocate(ObjectSpec::labeled(format!("B{}", i)).finalizer(counting(&calls)))
            .unwrap();
        heap.set_field(a, "other", b).unwrap();
        heap.set_field(b, "other", a).unwrap();
        pairs.push((a, b));
    }

    for (a, b) in pairs {
        heap.set_field(a, "other", Value::None).unwrap();
        heap.set_field(b, "other", Value::None).unwrap();
        heap.drop_root(a).unwrap();
        heap.drop_root(b).unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(heap.live_objects(), 0);
    assert_eq!(heap.collect(2).unwrap().collected(), 0);
}

#[test]
fn test_save_all_lists_garbage() {
    let mut heap = Heap::with_config(GcConfig::disabled().with_save_all(true)).unwrap();
    let a = heap.allocate(ObjectSpec::labeled("A")).unwrap();
    let b = heap.allocate(ObjectSpec::labeled("B").field("other", a)).unwrap();
    heap.set_field(a, "other", b).unwrap();
    heap.drop_root(a).unwrap();
    heap.drop_root(b).unwrap();

    let report = heap.collect(2).unwrap();
    assert_eq!(report.collected(), 2);
    assert_eq!(report.saved, vec![a, b]);
    assert_eq!(heap.garbage(), &[a, b]);
    assert_eq!(heap.stats().garbage, 2);

    let labels: Vec<_> = heap.garbage().iter().filter_map(|&id| heap.label(id)).collect();
    assert_eq!(labels, vec!["A", "B"]);
}

#[test]
fn test_structural_errors() {
    let mut heap = manual_heap();
    let a = heap.allocate(ObjectSpec::new()).unwrap();
    heap.drop_root(a).unwrap();

    assert_eq!(heap.set_field(a, "x", 1i64).unwrap_err(), HeapError::UseAfterFree(a));
    assert_eq!(heap.create_weak(a).unwrap_err(), HeapError::UnknownObject(a));
    assert_eq!(heap.collect(7).unwrap_err(), HeapError::InvalidGeneration(7));
    assert!(matches!(
        heap.configure(GcConfig::default().with_thresholds(1, 1, 0)),
        Err(HeapError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_config_file_drives_heap() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "gen0_threshold = 2\ngen1_threshold = 1\ngen2_threshold = 1").unwrap();

    let config = GcConfig::load(file.path()).unwrap();
    let mut heap = Heap::with_config(config).unwrap();

    let a = heap.allocate(ObjectSpec::labeled("A")).unwrap();
    let b = heap.allocate(ObjectSpec::labeled("B").field("other", a)).unwrap();
    heap.set_field(a, "other", b).unwrap();
    heap.drop_root(a).unwrap();
    heap.drop_root(b).unwrap();

    // Third allocation crosses the gen0 threshold
    heap.allocate(ObjectSpec::new()).unwrap();
    assert!(!heap.is_alive(a));
    assert_eq!(heap.stats().generations[0].collections, 1);
}

#[test]
fn test_report_serializes() {
    let mut heap = manual_heap();
    let a = heap.allocate(ObjectSpec::labeled("A")).unwrap();
    heap.set_field(a, "me", a).unwrap();
    heap.drop_root(a).unwrap();

    let report = heap.collect(0).unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["generation"], "Gen0");
    assert_eq!(json["trigger"], "Manual");
    assert_eq!(json["reclaimed"][0], a.raw());

    let stats = serde_json::to_value(heap.stats()).unwrap();
    assert_eq!(stats["generations"][0]["collected"], 1);
    assert_eq!(stats["enabled"], false);
}
