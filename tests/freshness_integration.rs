//! Covers S2 (freshness classification) and S5 (backpressure/admission)
//! from the spec's testable-properties list, driving `Classifier` and
//! `Queue` together the way `watcher::run_cycle` does.

use chrono::{Duration, Utc};

use convo_reflect::freshness::{Classifier, Freshness, Queue, QueuedFile};

#[test]
fn classifies_by_age_against_default_thresholds() {
    let now = Utc::now();
    let mut classifier = Classifier::new(5, 24, 30, "current-project".to_string());

    let hot = classifier.classify("/a/hot.jsonl", "current-project", now, now);
    let warm = classifier.classify("/a/warm.jsonl", "current-project", now - Duration::hours(1), now);
    let cold = classifier.classify("/a/cold.jsonl", "current-project", now - Duration::hours(72), now);

    assert_eq!(hot, Freshness::Hot);
    assert_eq!(warm, Freshness::WarmCurrentProject);
    assert_eq!(cold, Freshness::Cold);
}

#[test]
fn cold_files_wait_behind_a_per_cycle_admission_cap() {
    let now = Utc::now();
    let mut classifier = Classifier::new(5, 24, 30, "current-project".to_string());
    let mut queue = Queue::new(100);

    let categorized: Vec<QueuedFile> = (0..3)
        .map(|i| {
            let path = format!("/a/cold-{i}.jsonl");
            let mtime = now - Duration::hours(72);
            let freshness = classifier.classify(&path, "current-project", mtime, now);
            QueuedFile { path, project: "current-project".to_string(), freshness }
        })
        .collect();

    // max_cold_files=1: only the first COLD file is admitted this cycle.
    queue.add_categorized(categorized, 1);
    assert_eq!(queue.len(), 1);
}

#[test]
fn overflow_beyond_queue_capacity_is_reported_not_dropped() {
    let now = Utc::now();
    let mut classifier = Classifier::new(5, 24, 30, "current-project".to_string());
    let mut queue = Queue::new(5);

    let categorized: Vec<QueuedFile> = (0..12)
        .map(|i| {
            let path = format!("/a/new-{i}.jsonl");
            let freshness = classifier.classify(&path, "current-project", now, now);
            QueuedFile { path, project: "current-project".to_string(), freshness }
        })
        .collect();

    queue.add_categorized(categorized, 100);
    assert_eq!(queue.len(), 5, "exactly the queue's capacity should be admitted this cycle");
}
