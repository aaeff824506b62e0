mod helpers;

use helpers::{offline_embedder, test_db, TestWorkspace};
use mnemo::ledger::{forget_fact, update_fact, write_fact, UpdateRequest, WriteRequest};
use mnemo::scan::scan_memory;
use mnemo::sync::sync_source;

fn write_request(content: &str) -> WriteRequest<'_> {
    WriteRequest {
        content,
        category: None,
        source: None,
        evidence: None,
    }
}

#[test]
fn write_then_search_round_trip() {
    let ws = TestWorkspace::new();
    let mut conn = test_db();
    let embedder = offline_embedder();

    let outcome = write_fact(
        &mut conn,
        &embedder,
        ws.path(),
        &WriteRequest {
            content: "the staging cluster lives in eu-west-1",
            category: Some("infra"),
            source: Some("conversation"),
            evidence: None,
        },
        4096,
    )
    .unwrap();
    assert!(outcome.stored);

    // Index the ledger, then find the fact through search
    let entries = scan_memory(ws.path());
    sync_source(&mut conn, "memory", &entries, 512, false).unwrap();

    let results = mnemo::search::search(
        &mut conn,
        &embedder,
        "staging cluster region",
        &mnemo::search::SearchOptions::default(),
        4096,
    )
    .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].path, "memory/infra.md");
}

#[test]
fn semantic_duplicate_blocks_rewording() {
    let ws = TestWorkspace::new();
    let mut conn = test_db();
    let embedder = offline_embedder();

    write_fact(
        &mut conn,
        &embedder,
        ws.path(),
        &write_request("user prefers dark mode in the editor"),
        4096,
    )
    .unwrap();

    // Make the first fact searchable
    let entries = scan_memory(ws.path());
    sync_source(&mut conn, "memory", &entries, 512, false).unwrap();

    let outcome = write_fact(
        &mut conn,
        &embedder,
        ws.path(),
        &write_request("user likes dark mode in the editor"),
        4096,
    )
    .unwrap();
    assert!(!outcome.stored);
    assert_eq!(outcome.reason.as_deref(), Some("semantic_duplicate"));
    assert!(outcome.similar_entry.is_some());

    // The rejected write must not leave an evidence file behind
    assert!(!ws.path().join("memory/evidence").exists());
}

#[test]
fn distinct_facts_coexist() {
    let ws = TestWorkspace::new();
    let mut conn = test_db();
    let embedder = offline_embedder();

    write_fact(&mut conn, &embedder, ws.path(), &write_request("build uses cmake"), 4096)
        .unwrap();
    let entries = scan_memory(ws.path());
    sync_source(&mut conn, "memory", &entries, 512, false).unwrap();

    let outcome = write_fact(
        &mut conn,
        &embedder,
        ws.path(),
        &write_request("release notes are written by the on-call engineer"),
        4096,
    )
    .unwrap();
    assert!(outcome.stored);

    let body = std::fs::read_to_string(ws.path().join("memory/general.md")).unwrap();
    assert!(body.contains("build uses cmake"));
    assert!(body.contains("release notes"));
}

#[test]
fn forget_falls_back_to_index_search() {
    let ws = TestWorkspace::new();
    let mut conn = test_db();
    let embedder = offline_embedder();

    write_fact(
        &mut conn,
        &embedder,
        ws.path(),
        &write_request("the canary deploy waits ten minutes before promoting"),
        4096,
    )
    .unwrap();
    let entries = scan_memory(ws.path());
    sync_source(&mut conn, "memory", &entries, 512, false).unwrap();

    // No normalized containment ("promoting" vs "promotion"), so the primary
    // scan misses and the search fallback locates the entry by overlap.
    let outcome = forget_fact(
        &mut conn,
        &embedder,
        ws.path(),
        "canary deploy promotion wait",
        None,
        4096,
    )
    .unwrap();
    assert!(outcome.removed);
    assert!(outcome
        .removed_content
        .unwrap()
        .contains("canary deploy waits"));
}

#[test]
fn update_swaps_evidence() {
    let ws = TestWorkspace::new();
    let mut conn = test_db();
    let embedder = offline_embedder();

    let written = write_fact(
        &mut conn,
        &embedder,
        ws.path(),
        &WriteRequest {
            content: "primary database is postgres 14",
            category: Some("infra"),
            source: None,
            evidence: Some("pg_version output"),
        },
        4096,
    )
    .unwrap();
    let old_evidence = written.evidence_path.unwrap();
    assert!(ws.path().join(&old_evidence).exists());

    let outcome = update_fact(
        &mut conn,
        &embedder,
        ws.path(),
        &UpdateRequest {
            old_content: "primary database is postgres 14",
            new_content: "primary database is postgres 16",
            category: Some("infra"),
            source: None,
            evidence: Some("upgraded during the march window"),
        },
        4096,
    )
    .unwrap();
    assert!(outcome.updated);

    let new_evidence = outcome.evidence_path.unwrap();
    assert_ne!(new_evidence, old_evidence);
    assert!(!ws.path().join(&old_evidence).exists());
    assert!(ws.path().join(&new_evidence).exists());

    let body = std::fs::read_to_string(ws.path().join("memory/infra.md")).unwrap();
    assert!(body.contains("postgres 16"));
    assert!(!body.contains("postgres 14"));
}
