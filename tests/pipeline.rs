//! Cross-component scenarios: journal → index rebuilds → fused retrieval,
//! and the cloud redaction/allowlist guarantee that no raw secret ever
//! reaches a log line.

use hypermemory::{config::Config, embedding::EmbeddingClient, Workspace};

fn fresh_workspace() -> (tempfile::TempDir, Workspace) {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    (dir, ws)
}

#[test]
fn journal_append_feeds_fts_bm25_and_entity_after_rebuild() {
    let (_t, ws) = fresh_workspace();

    hypermemory::journal::append(
        &ws,
        hypermemory::journal::AppendRequest {
            message: "deployed auth.service on node-a1 listening on :8443".into(),
            role: "agent".into(),
            channel: "cli".into(),
            ts_ms: Some(1_700_000_000_000),
            ..Default::default()
        },
    )
    .unwrap();

    std::fs::write(
        ws.memory_md(),
        "## Services\n- auth.service runs on :8443\n",
    )
    .unwrap();

    hypermemory::fts::build_index(&ws, false).unwrap();
    hypermemory::entity::rebuild(&ws, false).unwrap();

    let fts_hits = hypermemory::fts::fts_search(&ws, ":8443", 10).unwrap();
    assert!(!fts_hits.is_empty(), "expected MEMORY.md bullet to be indexed");

    let bm25_hits = hypermemory::bm25::search(&ws, ":8443", 10);
    assert!(bm25_hits.iter().any(|h| h.path == "MEMORY.md"));

    let entity_hits = hypermemory::entity::search(&ws, "auth.service", 10).unwrap();
    assert!(entity_hits.iter().any(|h| h.entity == "auth.service" && h.value == ":8443"));
}

#[test]
fn retrieval_fuses_fts_and_bm25_for_a_curated_bullet() {
    let (_t, ws) = fresh_workspace();
    std::fs::write(
        ws.memory_md(),
        "## Incidents\n- payments-gateway.service crashed on node-c3 with ECONNRESET\n",
    )
    .unwrap();
    hypermemory::fts::build_index(&ws, false).unwrap();

    let config = Config::test_default(ws.root());
    let result = hypermemory::retrieval::retrieve(&ws, &config, None, None, "ECONNRESET", 10).unwrap();

    assert!(!result.hits.is_empty());
    let top = &result.hits[0];
    assert!(top.why.contains(&"fts".to_string()) || top.why.contains(&"bm25".to_string()));
}

#[test]
fn cloud_prepare_payload_never_logs_raw_secret_text() {
    let (_t, ws) = fresh_workspace();
    ws.ensure_staging_dir().unwrap();
    std::fs::write(
        ws.pending_md(),
        "- [M5] rotate the database password=SuperSecretValue123456\n- [M4] note the new node-a2 host is online\n",
    )
    .unwrap();

    let client = EmbeddingClient::new("http://127.0.0.1:1").unwrap();
    let payload = hypermemory::cloud::prepare_payload(&ws, "default", "local", 3, true, &client).unwrap();

    // The secret bullet must be rejected by the allowlist; the plain one commits.
    assert_eq!(payload.rejected.len(), 1);
    assert_eq!(payload.skipped, 1);
    assert_eq!(payload.count, 1);
    assert_eq!(payload.items.len(), 1);
    assert!(!payload.rejected[0].reasons.is_empty());

    let audit = std::fs::read_to_string(ws.cloud_redaction_jsonl()).unwrap();
    assert!(!audit.contains("SuperSecretValue123456"));
    assert!(!audit.contains("password=SuperSecretValue123456"));
}

#[test]
fn rebuild_projections_round_trips_events_into_daily_markdown() {
    let (_t, ws) = fresh_workspace();
    for i in 0..3 {
        hypermemory::journal::append(
            &ws,
            hypermemory::journal::AppendRequest {
                message: format!("event {i}"),
                ts_ms: Some(1_700_000_000_000 + i * 1_000),
                ..Default::default()
            },
        )
        .unwrap();
    }

    let stats = hypermemory::journal::rebuild_projections(&ws, 200).unwrap();
    assert_eq!(stats.events, 3);
    assert_eq!(stats.tail, 3);
}
