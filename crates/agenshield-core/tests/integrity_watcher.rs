mod support;

use std::fs;

use agenshield_core::lifecycle::{InstallRequest, UploadRequest};
use agenshield_core::types::{IntegrityPolicy, InstallStatus, ViolationAction};

use support::{drain_event_names, harness, hello_files, Harness};

async fn install_hello(h: &Harness) -> (String, String) {
    let (skill, version) = h
        .upload
        .upload(UploadRequest::new("Hello", "hello", "1.0.0", hello_files()))
        .unwrap();
    h.repo.approve_version(&version.id).unwrap();
    let installation = h
        .install
        .install(InstallRequest::local(skill.id.clone()))
        .await
        .unwrap();
    (skill.id, installation.id)
}

#[tokio::test]
async fn tamper_is_reinstalled_with_ordered_events() {
    let h = harness();
    let (_, _) = install_hello(&h).await;

    fs::write(h.deploy_root.join("hello/SKILL.md"), "# HACKED\n").unwrap();

    let watcher = h.watcher(IntegrityPolicy::default(), false);
    let mut rx = h.bus.subscribe();

    let violations = watcher.poll().await.unwrap();
    assert_eq!(violations, 1);

    let names = drain_event_names(&mut rx);
    let expected = [
        "watcher:poll-started",
        "watcher:integrity-violation",
        "deploy:started",
        "deploy:completed",
        "watcher:reinstalled",
        "watcher:poll-completed",
    ];
    let mut cursor = 0;
    for name in &names {
        if cursor < expected.len() && name == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(
        cursor,
        expected.len(),
        "expected subsequence {expected:?} in {names:?}"
    );

    // Restored byte-exact.
    assert_eq!(
        fs::read(h.deploy_root.join("hello/SKILL.md")).unwrap(),
        b"# Hello\n"
    );

    // A second poll is clean.
    let violations = watcher.poll().await.unwrap();
    assert_eq!(violations, 0);
}

#[tokio::test]
async fn deleted_file_is_restored() {
    let h = harness();
    install_hello(&h).await;

    fs::remove_file(h.deploy_root.join("hello/run.sh")).unwrap();

    let watcher = h.watcher(IntegrityPolicy::default(), false);
    assert_eq!(watcher.poll().await.unwrap(), 1);
    assert_eq!(
        fs::read(h.deploy_root.join("hello/run.sh")).unwrap(),
        b"#!/bin/sh\necho hi\n"
    );
}

#[tokio::test]
async fn unexpected_file_is_removed_on_reinstall() {
    let h = harness();
    install_hello(&h).await;

    fs::write(h.deploy_root.join("hello/payload.sh"), "echo pwned").unwrap();

    let watcher = h.watcher(IntegrityPolicy::default(), false);
    assert_eq!(watcher.poll().await.unwrap(), 1);
    assert!(!h.deploy_root.join("hello/payload.sh").exists());
    assert_eq!(watcher.poll().await.unwrap(), 0);
}

#[tokio::test]
async fn restores_from_backup_when_source_folder_is_gone() {
    let h = harness();

    // Upload with an on-disk source folder, then delete it.
    let source_dir = h.tmp.path().join("source/hello");
    fs::create_dir_all(&source_dir).unwrap();
    fs::write(source_dir.join("SKILL.md"), "# Hello\n").unwrap();
    fs::write(source_dir.join("run.sh"), "#!/bin/sh\necho hi\n").unwrap();

    let mut request = UploadRequest::new("Hello", "hello", "1.0.0", hello_files());
    request.folder_path = Some(source_dir.display().to_string());
    let (skill, version) = h.upload.upload(request).unwrap();
    h.repo.approve_version(&version.id).unwrap();
    h.install
        .install(InstallRequest::local(skill.id))
        .await
        .unwrap();

    fs::remove_dir_all(&source_dir).unwrap();
    fs::write(h.deploy_root.join("hello/SKILL.md"), "# HACKED\n").unwrap();

    let watcher = h.watcher(IntegrityPolicy::default(), false);
    assert_eq!(watcher.poll().await.unwrap(), 1);
    assert_eq!(
        fs::read(h.deploy_root.join("hello/SKILL.md")).unwrap(),
        b"# Hello\n"
    );
}

#[tokio::test]
async fn tampered_backup_aborts_reinstall_with_action_error() {
    let h = harness();
    let (_, installation_id) = install_hello(&h).await;

    let version_id = h
        .repo
        .get_installation_by_id(&installation_id)
        .unwrap()
        .unwrap()
        .skill_version_id;

    // Corrupt both the deployment and its backup.
    fs::write(h.deploy_root.join("hello/SKILL.md"), "# HACKED\n").unwrap();
    fs::write(
        h.backup.root().join(&version_id).join("SKILL.md"),
        "# BACKDOORED\n",
    )
    .unwrap();

    let watcher = h.watcher(IntegrityPolicy::default(), false);
    let mut rx = h.bus.subscribe();
    watcher.poll().await.unwrap();

    let names = drain_event_names(&mut rx);
    assert!(names.iter().any(|n| n == "watcher:action-error"));
    assert!(!names.iter().any(|n| n == "watcher:reinstalled"));
    // The tampered deployment is left for the operator.
    assert_eq!(
        fs::read(h.deploy_root.join("hello/SKILL.md")).unwrap(),
        b"# HACKED\n"
    );
}

#[tokio::test]
async fn suppressed_slug_produces_no_watcher_events() {
    let h = harness();
    install_hello(&h).await;

    fs::write(h.deploy_root.join("hello/SKILL.md"), "# HACKED\n").unwrap();

    let watcher = h.watcher(IntegrityPolicy::default(), false);
    let mut rx = h.bus.subscribe();

    h.suppressor.suppress("hello");
    for _ in 0..5 {
        watcher.handle_fs_change("hello").await.unwrap();
    }
    let names = drain_event_names(&mut rx);
    assert!(
        names.iter().all(|n| !n.starts_with("watcher:")),
        "suppressed slug must emit no watcher events, got {names:?}"
    );
}

#[tokio::test]
async fn fs_change_on_intact_installation_is_a_no_op() {
    let h = harness();
    install_hello(&h).await;

    // Suppression from the install has to drain first.
    tokio::time::sleep(support::DEBOUNCE * 3).await;

    let watcher = h.watcher(IntegrityPolicy::default(), false);
    let mut rx = h.bus.subscribe();
    watcher.handle_fs_change("hello").await.unwrap();

    let names = drain_event_names(&mut rx);
    assert_eq!(names, vec!["watcher:fs-change"]);
}

#[tokio::test]
async fn disabled_installation_is_not_checked() {
    let h = harness();
    let (_, installation_id) = install_hello(&h).await;
    h.repo
        .update_installation_status(&installation_id, InstallStatus::Disabled)
        .unwrap();

    // Let the install-time suppression drain before polling.
    tokio::time::sleep(support::DEBOUNCE * 3).await;
    fs::write(h.deploy_root.join("hello/SKILL.md"), "# HACKED\n").unwrap();

    let watcher = h.watcher(
        IntegrityPolicy {
            on_modified: ViolationAction::Reinstall,
            on_deleted: ViolationAction::Reinstall,
        },
        false,
    );
    // No active installation: the directory counts as a drop instead.
    let mut rx = h.bus.subscribe();
    watcher.poll().await.unwrap();
    let names = drain_event_names(&mut rx);
    assert!(!names.iter().any(|n| n == "watcher:integrity-violation"));
    assert!(names.iter().any(|n| n == "watcher:skill-detected"));
}
