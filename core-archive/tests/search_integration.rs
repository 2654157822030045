//! Integration tests for archive search
//!
//! These tests run user queries end to end against an in-memory store:
//! - Free text, phrase and column-scoped terms
//! - Exclusions, including exclusion-only queries
//! - Label, date and attachment filters
//! - Ordering, paging and source scoping
//! - Query errors surfaced as `InvalidQuery`

use core_archive::{
    ArchiveError, IndexFields, MessageRecord, MetadataStore, SearchOptions, SortOrder,
};

struct Fixture {
    source: &'static str,
    id: &'static str,
    subject: &'static str,
    sender: &'static str,
    date: &'static str,
    body: &'static str,
    attachments: &'static [&'static str],
    labels: &'static [&'static str],
}

const FIXTURES: &[Fixture] = &[
    Fixture {
        source: "gmail:alice@example.com",
        id: "m1",
        subject: "Quarterly report",
        sender: "Carol <carol@example.com>",
        date: "2024-01-15T09:00:00+00:00",
        body: "Please find the quarterly report attached.",
        attachments: &["report.pdf"],
        labels: &["INBOX", "Work"],
    },
    Fixture {
        source: "gmail:alice@example.com",
        id: "m2",
        subject: "Report draft",
        sender: "Dave <dave@example.com>",
        date: "2024-02-20T12:30:00+00:00",
        body: "An early draft of the report, not final.",
        attachments: &[],
        labels: &["Work"],
    },
    Fixture {
        source: "gmail:alice@example.com",
        id: "m3",
        subject: "Weekend plans",
        sender: "Carol <carol@example.com>",
        date: "2024-03-02T18:00:00+00:00",
        body: "Hiking on Saturday?",
        attachments: &[],
        labels: &["INBOX"],
    },
    Fixture {
        source: "imap:bob@example.org",
        id: "42",
        subject: "Invoice 2024-03",
        sender: "Billing <billing@example.org>",
        date: "2024-03-10T08:00:00+00:00",
        body: "Your invoice for March is ready.",
        attachments: &["invoice.pdf"],
        labels: &["INBOX"],
    },
];

async fn seeded_store() -> MetadataStore {
    let store = MetadataStore::in_memory().await.unwrap();
    let mut batch = store.begin_batch().await.unwrap();

    for fixture in FIXTURES {
        let hash = format!("hash-{}", fixture.id);
        let record = MessageRecord::new(
            fixture.source,
            fixture.id,
            format!("{}/{}.eml", fixture.source, fixture.id),
            1_700_000_000,
            hash.clone(),
        );
        batch.upsert_message(&record).await.unwrap();

        let labels: Vec<String> = fixture.labels.iter().map(|l| l.to_string()).collect();
        batch
            .set_labels(fixture.source, fixture.id, &labels)
            .await
            .unwrap();

        let fields = IndexFields {
            subject: fixture.subject.to_string(),
            sender: fixture.sender.to_string(),
            recipients: "alice@example.com".to_string(),
            date: Some(fixture.date.to_string()),
            body: fixture.body.to_string(),
            attachments: fixture.attachments.iter().map(|a| a.to_string()).collect(),
        };
        batch
            .upsert_index_entry(fixture.source, fixture.id, &fields, &hash)
            .await
            .unwrap();
    }

    batch.commit().await.unwrap();
    store
}

async fn ids(store: &MetadataStore, query: &str) -> Vec<String> {
    ids_with(store, query, SearchOptions::default().with_sort(SortOrder::DateAsc)).await
}

async fn ids_with(store: &MetadataStore, query: &str, options: SearchOptions) -> Vec<String> {
    store
        .search(query, &options)
        .await
        .unwrap()
        .into_iter()
        .map(|hit| hit.message_id)
        .collect()
}

#[tokio::test]
async fn test_free_text_search() {
    let store = seeded_store().await;

    assert_eq!(ids(&store, "report").await, vec!["m1", "m2"]);
    assert_eq!(ids(&store, "hiking").await, vec!["m3"]);
    assert!(ids(&store, "nonexistentword").await.is_empty());
}

#[tokio::test]
async fn test_phrase_and_column_terms() {
    let store = seeded_store().await;

    assert_eq!(ids(&store, "\"quarterly report\"").await, vec!["m1"]);
    assert_eq!(ids(&store, "from:carol").await, vec!["m1", "m3"]);
    assert_eq!(ids(&store, "subject:invoice").await, vec!["42"]);
}

#[tokio::test]
async fn test_or_and_exclusion() {
    let store = seeded_store().await;

    assert_eq!(ids(&store, "hiking OR invoice").await, vec!["m3", "42"]);
    assert_eq!(ids(&store, "report -draft").await, vec!["m1"]);
    assert_eq!(ids(&store, "-report").await, vec!["m3", "42"]);
}

#[tokio::test]
async fn test_sql_filters() {
    let store = seeded_store().await;

    assert_eq!(ids(&store, "label:work").await, vec!["m1", "m2"]);
    assert_eq!(ids(&store, "-label:work").await, vec!["m3", "42"]);
    assert_eq!(ids(&store, "before:2024-02-01").await, vec!["m1"]);
    assert_eq!(ids(&store, "after:20240301").await, vec!["m3", "42"]);
    assert_eq!(ids(&store, "has:attachment").await, vec!["m1", "42"]);
    assert_eq!(ids(&store, "report has:attachment").await, vec!["m1"]);
    assert_eq!(ids(&store, "label:inbox after:2024-03-05").await, vec!["42"]);
}

#[tokio::test]
async fn test_snippets_mark_matches() {
    let store = seeded_store().await;

    let hits = store
        .search("hiking", &SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    let snippet = hits[0].snippet.as_deref().unwrap();
    assert!(snippet.contains("[Hiking]"), "unexpected snippet: {}", snippet);
    assert!(hits[0].rank.is_some());
    assert_eq!(hits[0].relative_path, "gmail:alice@example.com/m3.eml");
}

#[tokio::test]
async fn test_filter_only_search_has_no_snippet() {
    let store = seeded_store().await;

    let hits = store
        .search("label:work", &SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.snippet.is_none() && h.rank.is_none()));
    // Newest first when there is nothing to rank.
    assert_eq!(hits[0].message_id, "m2");
}

#[tokio::test]
async fn test_paging_sorting_and_source_scope() {
    let store = seeded_store().await;

    let newest_first = SearchOptions::default().with_sort(SortOrder::DateDesc);
    assert_eq!(ids_with(&store, "", newest_first.clone()).await, vec!["42", "m3", "m2", "m1"]);
    assert_eq!(
        ids_with(&store, "", newest_first.clone().with_limit(2).with_offset(1)).await,
        vec!["m3", "m2"]
    );
    assert_eq!(
        ids_with(&store, "inbox OR invoice OR report", newest_first.with_source("imap:bob@example.org")).await,
        vec!["42"]
    );
}

#[tokio::test]
async fn test_invalid_queries() {
    let store = seeded_store().await;

    for query in ["\"unclosed phrase", "(report", "before:2024-13-45", "has:unicorn"] {
        let result = store.search(query, &SearchOptions::default()).await;
        assert!(
            matches!(result, Err(ArchiveError::InvalidQuery(_))),
            "expected InvalidQuery for {:?}, got {:?}",
            query,
            result.map(|hits| hits.len())
        );
    }

    let result = store
        .search("report", &SearchOptions::default().with_limit(0))
        .await;
    assert!(matches!(result, Err(ArchiveError::InvalidInput { .. })));
}
