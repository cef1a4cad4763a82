//! Bridge from internal lifecycle events to the outward-facing event set.
//!
//! The control plane consumes a reduced `skills:*` vocabulary over SSE.
//! Bridging preserves identity: `slug` is always the resolved skill slug,
//! while `name` keeps the historical meaning per event (slug for
//! `install_started`, installation id for `installed`/`deployed`, version
//! id for analysis events).

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{
    AnalyzeEvent, DeployEvent, EventBus, InstallEvent, LifecycleEvent, UninstallEvent,
    WatcherEvent,
};

/// One event on the external stream: `event` is the SSE event name,
/// `payload` the JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Translate an internal event into its public form, if it is part of the
/// documented external set.
pub fn to_public(event: &LifecycleEvent) -> Option<PublicEvent> {
    let (name, payload) = match event {
        LifecycleEvent::Install(InstallEvent::Started { slug, .. }) => (
            "skills:install_started",
            json!({ "name": slug, "slug": slug }),
        ),
        LifecycleEvent::Install(InstallEvent::Completed {
            slug,
            installation_id,
            ..
        }) => (
            "skills:installed",
            json!({ "name": installation_id, "slug": slug, "installationId": installation_id }),
        ),
        LifecycleEvent::Install(InstallEvent::Error { slug, error, .. }) => (
            "skills:install_failed",
            json!({ "name": slug, "slug": slug, "error": error }),
        ),
        LifecycleEvent::Analyze(AnalyzeEvent::Completed {
            version_id,
            analysis,
            ..
        }) => (
            "skills:analyzed",
            json!({ "name": version_id, "analysis": analysis }),
        ),
        LifecycleEvent::Analyze(AnalyzeEvent::Error {
            version_id, error, ..
        }) => (
            "skills:analysis_failed",
            json!({ "name": version_id, "error": error }),
        ),
        LifecycleEvent::Uninstall(UninstallEvent::Completed {
            installation_id,
            slug,
            ..
        }) => (
            "skills:uninstalled",
            json!({ "name": installation_id, "slug": slug, "installationId": installation_id }),
        ),
        LifecycleEvent::Deploy(DeployEvent::Completed {
            installation_id,
            adapter_id,
            slug,
            ..
        }) => (
            "skills:deployed",
            json!({ "name": installation_id, "slug": slug, "adapterId": adapter_id }),
        ),
        LifecycleEvent::Deploy(DeployEvent::Error {
            installation_id,
            slug,
            error,
            ..
        }) => (
            "skills:deploy_failed",
            json!({ "name": installation_id, "slug": slug, "error": error }),
        ),
        LifecycleEvent::Watcher(WatcherEvent::IntegrityViolation {
            installation_id,
            slug,
            action,
            modified_files,
            missing_files,
            unexpected_files,
            ..
        }) => (
            "skills:integrity_violation",
            json!({
                "name": installation_id,
                "slug": slug,
                "action": action,
                "modifiedFiles": modified_files,
                "missingFiles": missing_files,
                "unexpectedFiles": unexpected_files,
            }),
        ),
        LifecycleEvent::Watcher(WatcherEvent::Reinstalled {
            installation_id,
            slug,
        }) => (
            "skills:integrity_restored",
            json!({ "name": installation_id, "slug": slug }),
        ),
        LifecycleEvent::Watcher(WatcherEvent::SkillDetected { slug, reason, .. }) => (
            "skills:quarantined",
            json!({ "name": slug, "slug": slug, "reason": reason }),
        ),
        _ => return None,
    };

    Some(PublicEvent {
        event: name.to_string(),
        payload,
    })
}

/// Forward internal events to an external broadcast channel until the bus
/// closes. Order is preserved; lagged gaps are skipped, never reordered.
pub fn spawn_bridge(
    bus: &EventBus,
    external: broadcast::Sender<PublicEvent>,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(public) = to_public(&event) {
                        let _ = external.send(public);
                    }
                }
                Err(super::EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_completed_keeps_installation_id_as_name() {
        let event = LifecycleEvent::Install(InstallEvent::Completed {
            operation_id: "op".into(),
            slug: "hello".into(),
            installation_id: "inst-9".into(),
        });
        let public = to_public(&event).unwrap();
        assert_eq!(public.event, "skills:installed");
        assert_eq!(public.payload["name"], "inst-9");
        assert_eq!(public.payload["slug"], "hello");
    }

    #[test]
    fn violation_carries_file_sets_and_slug() {
        let event = LifecycleEvent::Watcher(WatcherEvent::IntegrityViolation {
            installation_id: "inst-1".into(),
            slug: "hello".into(),
            adapter_id: "workspace".into(),
            modified_files: vec!["SKILL.md".into()],
            missing_files: vec![],
            unexpected_files: vec![],
            action: crate::types::ViolationAction::Reinstall,
        });
        let public = to_public(&event).unwrap();
        assert_eq!(public.event, "skills:integrity_violation");
        assert_eq!(public.payload["slug"], "hello");
        assert_eq!(public.payload["modifiedFiles"][0], "SKILL.md");
        assert_eq!(public.payload["action"], "reinstall");
    }

    #[test]
    fn internal_only_events_do_not_bridge() {
        let event = LifecycleEvent::Watcher(WatcherEvent::PollStarted);
        assert!(to_public(&event).is_none());
    }
}
