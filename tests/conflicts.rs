mod common;

use common::*;
use ftpdeck::events::ConflictPrompt;
use ftpdeck::logging::init_test_logging;
use ftpdeck::{
    BackendFactory, ConflictAction, ConflictPolicy, ConflictResponse, ItemStatus, LocalBackend,
    MemoryStore, SessionStatus, SiteConfig, TransferApp, TransferBackend, TransferEvent,
};
use std::sync::Arc;
use tokio::sync::broadcast;

async fn next_conflict(rx: &mut broadcast::Receiver<TransferEvent>) -> ConflictPrompt {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(TransferEvent::ConflictRequested(prompt)) => return prompt,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("no conflict prompt")
}

fn conflict_count(events: &[TransferEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TransferEvent::ConflictRequested(_)))
        .count()
}

#[tokio::test]
async fn skip_for_all_answers_later_conflicts() {
    init_test_logging();
    let dir = setup_temp_dir();
    let sources: Vec<_> = ["a.txt", "b.txt", "c.txt"]
        .iter()
        .map(|name| write_file(dir.path(), name, 10))
        .collect();

    let remote = MockRemote::new();
    remote.add_file("/www/a.txt", 5);
    remote.add_file("/www/b.txt", 5);
    let scheduler = remote.scheduler(fast_settings());
    let mut events = scheduler.subscribe();

    let ticket = scheduler
        .start(upload(sources, "/www", Some(ConflictPolicy::Prompt)))
        .unwrap();
    let prompt = next_conflict(&mut events).await;
    assert_eq!(prompt.session_id, ticket.session_id);
    assert_eq!(prompt.target_path, "/www/a.txt");
    assert!(!prompt.is_directory);
    assert!(scheduler.has_pending_conflict(&ticket.session_id));

    scheduler
        .submit_conflict_decision(
            &ticket.session_id,
            Some(ConflictResponse {
                action: ConflictAction::Skip,
                apply_to_all: true,
            }),
        )
        .unwrap();

    let report = ticket.wait().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.items_with_status(ItemStatus::Skipped), 2);
    assert_eq!(report.items_with_status(ItemStatus::Completed), 1);
    assert_eq!(report.completed_count, 3);
    assert_eq!(remote.file_size("/www/a.txt"), Some(5));
    assert_eq!(remote.file_size("/www/c.txt"), Some(10));
    assert_eq!(conflict_count(&drain_events(&mut events)), 0);
}

#[tokio::test]
async fn dismissing_the_prompt_cancels_the_session() {
    init_test_logging();
    let dir = setup_temp_dir();
    let a = write_file(dir.path(), "a.txt", 10);
    let b = write_file(dir.path(), "b.txt", 10);

    let remote = MockRemote::new();
    remote.add_file("/www/a.txt", 5);
    let scheduler = remote.scheduler(fast_settings());
    let mut events = scheduler.subscribe();

    let ticket = scheduler.start(upload(vec![a, b], "/www", None)).unwrap();
    next_conflict(&mut events).await;
    scheduler.submit_conflict_decision(&ticket.session_id, None).unwrap();
    let session_id = ticket.session_id.clone();

    let report = ticket.wait().await.unwrap();
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_eq!(report.items_with_status(ItemStatus::Pending), 2);
    assert!(report.failures.is_empty());
    assert!(remote.transfers().is_empty());
    assert!(scheduler
        .submit_conflict_decision(&session_id, None)
        .is_err());
}

#[tokio::test]
async fn fixed_overwrite_policy_never_prompts() {
    init_test_logging();
    let dir = setup_temp_dir();
    let a = write_file(dir.path(), "a.txt", 10);

    let remote = MockRemote::new();
    remote.add_file("/www/a.txt", 5);
    let scheduler = remote.scheduler(fast_settings());
    let mut events = scheduler.subscribe();

    let report = scheduler
        .start(upload(vec![a], "/www", Some(ConflictPolicy::Overwrite)))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(remote.file_size("/www/a.txt"), Some(10));
    assert_eq!(conflict_count(&drain_events(&mut events)), 0);
}

#[tokio::test]
async fn folder_overwrite_is_asked_once() {
    init_test_logging();
    let dir = setup_temp_dir();
    write_file(dir.path(), "site/index.html", 10);
    write_file(dir.path(), "site/css/app.css", 10);

    let remote = MockRemote::new();
    remote.add_file("/www/site/index.html", 3);
    remote.add_file("/www/site/css/app.css", 3);
    remote.add_file("/www/site/old.html", 3);
    let scheduler = remote.scheduler(fast_settings());
    let mut events = scheduler.subscribe();

    let ticket = scheduler
        .start(upload(vec![dir.path().join("site")], "/www", None))
        .unwrap();
    let prompt = next_conflict(&mut events).await;
    assert_eq!(prompt.target_path, "/www/site");
    assert!(prompt.is_directory);
    scheduler
        .submit_conflict_decision(
            &ticket.session_id,
            Some(ConflictResponse {
                action: ConflictAction::Overwrite,
                apply_to_all: false,
            }),
        )
        .unwrap();

    let report = ticket.wait().await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(conflict_count(&drain_events(&mut events)), 0);
    assert_eq!(remote.file_size("/www/site/index.html"), Some(10));
    assert_eq!(remote.file_size("/www/site/css/app.css"), Some(10));
    // Merge, not replace.
    assert!(remote.has_file("/www/site/old.html"));
}

#[tokio::test]
async fn folder_rename_moves_the_whole_tree() {
    init_test_logging();
    let dir = setup_temp_dir();
    write_file(dir.path(), "site/index.html", 10);

    let remote = MockRemote::new();
    remote.add_dir("/www/site");
    let scheduler = remote.scheduler(fast_settings());

    let report = scheduler
        .start(upload(vec![dir.path().join("site")], "/www", Some(ConflictPolicy::Rename)))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert!(remote.has_file("/www/site (1)/index.html"));
    assert!(!remote.has_file("/www/site/index.html"));
}

#[tokio::test]
async fn repeated_download_is_renamed() {
    init_test_logging();
    let served = setup_temp_dir();
    let dest = setup_temp_dir();
    write_file(served.path(), "a.txt", 42);

    let factory: Arc<dyn BackendFactory> = Arc::new(|site: &SiteConfig| {
        Box::new(LocalBackend::from_site(site)) as Box<dyn TransferBackend>
    });
    let site = SiteConfig {
        name: "local".into(),
        root: Some(served.path().display().to_string()),
        verify_integrity: true,
        ..SiteConfig::default()
    };
    let app = TransferApp::initialize(Arc::new(MemoryStore::new()), factory, site).unwrap();

    for _ in 0..2 {
        let report = app
            .start(download(
                vec![remote_file("/a.txt", 42)],
                dest.path(),
                Some(ConflictPolicy::Rename),
            ))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
    }

    assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap().len(), 42);
    assert_eq!(std::fs::read(dest.path().join("a (1).txt")).unwrap().len(), 42);
    assert_eq!(app.history().len(), 2);
    app.shutdown().await;
}
