mod helpers;

use helpers::{entry, offline_embedder, test_db, test_vector, TestWorkspace};
use mnemo::embedding::vector_to_bytes;
use mnemo::scan::scan_memory;
use mnemo::search::{search, SearchOptions};
use mnemo::sync::sync_source;
use rusqlite::params;

#[test]
fn lexical_search_over_synced_workspace() {
    let ws = TestWorkspace::new();
    ws.write(
        "memory/infra.md",
        "# Infra\n- the retry policy is exponential backoff\n- deploys happen on tuesdays",
    );
    ws.write("memory/style.md", "# Style\n- prefer builder structs");

    let mut conn = test_db();
    let entries = scan_memory(ws.path());
    sync_source(&mut conn, "memory", &entries, 512, false).unwrap();

    let results = search(
        &mut conn,
        &offline_embedder(),
        "retry policy",
        &SearchOptions::default(),
        4096,
    )
    .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].path, "memory/infra.md");
    assert_eq!(results[0].source, "memory");
    assert!(results[0].start_line >= 1);
    assert!(results[0].end_line >= results[0].start_line);
    assert!(results[0].snippet.contains("retry policy"));
}

#[test]
fn substring_fallback_when_tokens_do_not_match() {
    let mut conn = test_db();
    sync_source(&mut conn, "memory", &[entry("memory/x.md", "say hello")], 512, false)
        .unwrap();

    // "hell" is not a full token, so FTS misses and the LIKE scan hits
    let results = search(
        &mut conn,
        &offline_embedder(),
        "hell",
        &SearchOptions::default(),
        4096,
    )
    .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].start_line, 1);
    assert_eq!(results[0].end_line, 1);
}

#[test]
fn like_wildcards_in_query_are_literal() {
    let mut conn = test_db();
    sync_source(
        &mut conn,
        "memory",
        &[
            entry("memory/a.md", "value is 100%"),
            entry("memory/b.md", "value is 100x"),
        ],
        512,
        false,
    )
    .unwrap();

    // "0" is not a token of either file, so FTS misses and the LIKE scan
    // runs with the % escaped
    let results = search(
        &mut conn,
        &offline_embedder(),
        "0%",
        &SearchOptions::default(),
        4096,
    )
    .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "memory/a.md");
}

#[test]
fn time_filters_restrict_by_file_mtime() {
    let mut conn = test_db();
    let mut old = entry("memory/old.md", "shared keyword alpha");
    old.mtime_ms = 1_000_000_000_000; // 2001
    let mut new = entry("memory/new.md", "shared keyword beta");
    new.mtime_ms = 1_700_000_000_000; // 2023
    sync_source(&mut conn, "memory", &[old, new], 512, false).unwrap();

    let options = SearchOptions {
        after: Some("2020-01-01".into()),
        ..Default::default()
    };
    let results = search(&mut conn, &offline_embedder(), "keyword", &options, 4096).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "memory/new.md");

    let options = SearchOptions {
        before: Some("2010-01-01".into()),
        ..Default::default()
    };
    let results = search(&mut conn, &offline_embedder(), "keyword", &options, 4096).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "memory/old.md");
}

#[test]
fn max_results_caps_output() {
    let mut conn = test_db();
    let entries: Vec<_> = (0..10)
        .map(|i| entry(&format!("memory/f{i}.md"), &format!("common term note {i}")))
        .collect();
    sync_source(&mut conn, "memory", &entries, 512, false).unwrap();

    let options = SearchOptions {
        max_results: Some(3),
        ..Default::default()
    };
    let results = search(&mut conn, &offline_embedder(), "common term", &options, 4096).unwrap();
    assert_eq!(results.len(), 3);

    // Scores are non-increasing
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn repeated_access_bumps_counts_per_returned_chunk() {
    let mut conn = test_db();
    sync_source(
        &mut conn,
        "memory",
        &[entry("memory/a.md", "boosted entry"), entry("memory/b.md", "quiet entry")],
        512,
        false,
    )
    .unwrap();

    for _ in 0..2 {
        search(
            &mut conn,
            &offline_embedder(),
            "boosted",
            &SearchOptions::default(),
            4096,
        )
        .unwrap();
    }

    let boosted: i64 = conn
        .query_row(
            "SELECT access_count FROM chunks WHERE path = 'memory/a.md'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    let quiet: i64 = conn
        .query_row(
            "SELECT access_count FROM chunks WHERE path = 'memory/b.md'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(boosted, 2);
    assert_eq!(quiet, 0);
}

#[test]
fn vector_rows_join_back_to_chunks() {
    // The ranked vector path needs the embedding model for the query, but
    // the storage side is model-free: verify the KNN query shape works
    // against manually attached vectors.
    let mut conn = test_db();
    sync_source(
        &mut conn,
        "memory",
        &[entry("memory/a.md", "first note"), entry("memory/b.md", "second note")],
        512,
        false,
    )
    .unwrap();

    let ids: Vec<String> = conn
        .prepare("SELECT id FROM chunks ORDER BY path")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    for (i, id) in ids.iter().enumerate() {
        let vector = test_vector(i * 100);
        conn.execute(
            "INSERT INTO chunks_vec (id, embedding) VALUES (?1, ?2)",
            params![id, vector_to_bytes(&vector)],
        )
        .unwrap();
    }

    let probe = test_vector(0);
    let (nearest_id, distance): (String, f64) = conn
        .query_row(
            "SELECT id, distance FROM chunks_vec \
             WHERE embedding MATCH ?1 ORDER BY distance LIMIT 1",
            params![vector_to_bytes(&probe)],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    let path: String = conn
        .query_row(
            "SELECT path FROM chunks WHERE id = ?1",
            params![nearest_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(path, "memory/a.md");
    assert!(distance < 1e-4); // identical vector, cosine distance ~0
}
