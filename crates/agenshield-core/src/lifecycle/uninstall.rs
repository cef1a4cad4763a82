//! Uninstall orchestration: best-effort undeploy, then drop the row.

use std::sync::Arc;

use tracing::{info, warn};

use crate::deploy::DeployService;
use crate::error::Result;
use crate::events::{EventBus, LifecycleEvent, UninstallEvent};
use crate::repo::Repository;
use crate::watcher::Suppressor;

pub struct UninstallService {
    repo: Arc<Repository>,
    deploy: Arc<DeployService>,
    suppressor: Suppressor,
    bus: EventBus,
}

impl UninstallService {
    pub fn new(
        repo: Arc<Repository>,
        deploy: Arc<DeployService>,
        suppressor: Suppressor,
        bus: EventBus,
    ) -> Self {
        Self {
            repo,
            deploy,
            suppressor,
            bus,
        }
    }

    pub async fn uninstall(&self, installation_id: &str) -> Result<()> {
        let operation_id = uuid::Uuid::new_v4().to_string();
        let (skill, version, installation) = self.repo.resolve_installation(installation_id)?;

        self.bus
            .publish(LifecycleEvent::Uninstall(UninstallEvent::Started {
                operation_id: operation_id.clone(),
                installation_id: installation_id.to_string(),
                slug: skill.slug.clone(),
            }));

        self.suppressor.suppress(&skill.slug);
        // Undeploy is best-effort: a missing or already-removed target must
        // not keep the row alive.
        if let Err(err) = self.deploy.undeploy(&installation, &version, &skill) {
            warn!(
                installation = %installation_id,
                error = %err,
                "undeploy failed, removing installation anyway"
            );
        }

        let removed = self.repo.uninstall(installation_id);
        self.suppressor.unsuppress(&skill.slug);

        match removed {
            Ok(()) => {
                self.bus
                    .publish(LifecycleEvent::Uninstall(UninstallEvent::Completed {
                        operation_id,
                        installation_id: installation_id.to_string(),
                        slug: skill.slug.clone(),
                    }));
                info!(slug = %skill.slug, installation = %installation_id, "skill uninstalled");
                Ok(())
            }
            Err(err) => {
                self.bus
                    .publish(LifecycleEvent::Uninstall(UninstallEvent::Error {
                        operation_id,
                        installation_id: installation_id.to_string(),
                        slug: skill.slug.clone(),
                        error: err.to_string(),
                    }));
                Err(err)
            }
        }
    }
}
