mod support;

use std::fs;

use agenshield_core::fs::sha256_hex;
use agenshield_core::lifecycle::{InstallRequest, UploadRequest};
use agenshield_core::types::{ApprovalState, InstallStatus, SkillSource};

use support::{drain_event_names, harness, hello_files};

#[tokio::test]
async fn upload_approve_install_deploys_verbatim() {
    let h = harness();

    let (skill, version) = h
        .upload
        .upload(UploadRequest::new("Hello", "hello", "1.0.0", hello_files()))
        .unwrap();
    assert_eq!(skill.source, SkillSource::Manual);
    assert_eq!(version.approval, ApprovalState::Unknown);

    h.repo.approve_version(&version.id).unwrap();
    let version = h.repo.get_version_by_id(&version.id).unwrap().unwrap();
    assert_eq!(version.approval, ApprovalState::Approved);
    assert!(version.approved_at.is_some());

    let installation = h
        .install
        .install(InstallRequest::local(skill.id.clone()))
        .await
        .unwrap();
    assert_eq!(installation.status, InstallStatus::Active);

    let deployed = h.deploy_root.join("hello");
    assert_eq!(fs::read(deployed.join("SKILL.md")).unwrap(), b"# Hello\n");
    assert_eq!(
        fs::read(deployed.join("run.sh")).unwrap(),
        b"#!/bin/sh\necho hi\n"
    );
}

#[tokio::test]
async fn content_hash_is_sha256_over_sorted_file_hashes() {
    let h = harness();
    let (_, version) = h
        .upload
        .upload(UploadRequest::new("Hello", "hello", "1.0.0", hello_files()))
        .unwrap();

    // Byte-wise path order puts "SKILL.md" before "run.sh" ('S' < 'r').
    let skill_md_hash = sha256_hex(b"# Hello\n");
    let run_sh_hash = sha256_hex(b"#!/bin/sh\necho hi\n");
    let expected = sha256_hex(format!("{skill_md_hash}{run_sh_hash}").as_bytes());
    assert_eq!(version.content_hash, expected);
}

#[tokio::test]
async fn content_hash_is_permutation_invariant_across_uploads() {
    let h = harness();
    let mut reversed = hello_files();
    reversed.reverse();

    let (_, a) = h
        .upload
        .upload(UploadRequest::new("Hello", "hello-a", "1.0.0", hello_files()))
        .unwrap();
    let (_, b) = h
        .upload
        .upload(UploadRequest::new("Hello", "hello-b", "1.0.0", reversed))
        .unwrap();
    assert_eq!(a.content_hash, b.content_hash);
}

#[tokio::test]
async fn upload_writes_a_verifiable_backup() {
    let h = harness();
    let (_, version) = h
        .upload
        .upload(UploadRequest::new("Hello", "hello", "1.0.0", hello_files()))
        .unwrap();

    assert!(h.backup.has_backup(&version.id));
    let manifest = h.repo.get_files(&version.id).unwrap();
    let loaded = h.backup.load_files(&version.id, &manifest).unwrap();
    assert_eq!(loaded["SKILL.md"], b"# Hello\n");
    assert_eq!(loaded["run.sh"], b"#!/bin/sh\necho hi\n");
}

#[tokio::test]
async fn slug_conflict_survives_as_second_version() {
    let h = harness();
    h.upload
        .upload(UploadRequest::new("Hello", "hello", "1.0.0", hello_files()))
        .unwrap();

    // Same slug, new version: upsert, not conflict.
    let (skill, v2) = h
        .upload
        .upload(UploadRequest::new(
            "Hello",
            "hello",
            "1.1.0",
            vec![agenshield_core::types::FileEntry::new(
                "SKILL.md",
                b"# Hello v2\n".to_vec(),
            )],
        ))
        .unwrap();
    assert_eq!(h.repo.get_versions(&skill.id).unwrap().len(), 2);

    // Same slug, same version: conflict.
    let err = h
        .upload
        .upload(UploadRequest::new("Hello", "hello", "1.1.0", hello_files()))
        .unwrap_err();
    assert!(matches!(
        err,
        agenshield_core::error::ShieldError::VersionConflict { .. }
    ));

    let latest = h.repo.get_latest_version(&skill.id).unwrap().unwrap();
    assert_eq!(latest.id, v2.id);
}

#[tokio::test]
async fn install_events_are_ordered_and_deploy_precedes_completion() {
    let h = harness();
    let mut rx = h.bus.subscribe();

    let (skill, version) = h
        .upload
        .upload(UploadRequest::new("Hello", "hello", "1.0.0", hello_files()))
        .unwrap();
    h.repo.approve_version(&version.id).unwrap();
    h.install
        .install(InstallRequest::local(skill.id.clone()))
        .await
        .unwrap();

    let names = drain_event_names(&mut rx);

    let started = names.iter().position(|n| n == "install:started").unwrap();
    let deploy_completed = names.iter().position(|n| n == "deploy:completed").unwrap();
    let completed = names.iter().position(|n| n == "install:completed").unwrap();
    assert!(started < deploy_completed);
    assert!(deploy_completed < completed, "deploy must complete before install does");
    assert!(!names.iter().any(|n| n.starts_with("watcher:")));
}

#[tokio::test]
async fn archive_upload_matches_direct_upload() {
    use std::io::Write;

    let h = harness();

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("SKILL.md", options).unwrap();
        writer.write_all(b"# Hello\n").unwrap();
        writer.start_file("run.sh", options).unwrap();
        writer.write_all(b"#!/bin/sh\necho hi\n").unwrap();
        writer.finish().unwrap();
    }

    let (_, from_zip) = h
        .upload
        .upload_archive("Hello", "hello-zip", "1.0.0", cursor.get_ref())
        .unwrap();
    let (_, direct) = h
        .upload
        .upload(UploadRequest::new("Hello", "hello", "1.0.0", hello_files()))
        .unwrap();
    assert_eq!(from_zip.content_hash, direct.content_hash);
}

#[tokio::test]
async fn uninstall_removes_deployment_and_row() {
    let h = harness();
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

    h.uninstall.uninstall(&installation.id).await.unwrap();
    assert!(!h.deploy_root.join("hello").exists());
    assert!(h
        .repo
        .get_installation_by_id(&installation.id)
        .unwrap()
        .is_none());
}
