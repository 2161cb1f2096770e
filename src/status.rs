//! Whether apps are fetched, installed and running.

use std::collections::HashSet;

use composeapp_oci::{ContentStore, Digest};
use tracing::debug;

use crate::app::App;
use crate::blob::{check_blob, BlobState};
use crate::docker::{ContainerSummary, ImageHost, ImageSummary};
use crate::Result;

pub use crate::app::project::LABEL_CONFIG_HASH;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppStatus {
    pub app: String,
    pub uri: String,
    /// Blobs whose check is not [`BlobState::Ok`].
    pub missing_blobs: Vec<(Digest, BlobState)>,
    /// Service images the daemon does not list.
    pub missing_images: Vec<String>,
    /// Services without a matching running container.
    pub not_running: Vec<String>,
}

impl AppStatus {
    pub fn fetched(&self) -> bool {
        self.missing_blobs.is_empty()
    }

    pub fn installed(&self) -> bool {
        self.fetched() && self.missing_images.is_empty()
    }

    pub fn running(&self) -> bool {
        self.installed() && self.not_running.is_empty()
    }
}

/// Statuses of a set of apps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub apps: Vec<AppStatus>,
}

impl StatusReport {
    pub fn are_fetched(&self) -> bool {
        self.apps.iter().all(AppStatus::fetched)
    }

    pub fn are_installed(&self) -> bool {
        self.apps.iter().all(AppStatus::installed)
    }

    pub fn are_running(&self) -> bool {
        self.apps.iter().all(AppStatus::running)
    }
}

pub struct StatusChecker<'a> {
    store: &'a ContentStore,
    host: &'a dyn ImageHost,
}

impl<'a> StatusChecker<'a> {
    pub fn new(store: &'a ContentStore, host: &'a dyn ImageHost) -> Self {
        Self { store, host }
    }

    /// Status of every app. The daemon is asked once per call.
    pub async fn check(&self, apps: &[App]) -> Result<StatusReport> {
        let images = self.host.list_images().await?;
        let containers = self.host.list_containers().await?;
        let mut checked: HashSet<Digest> = HashSet::new();
        let mut out = Vec::with_capacity(apps.len());
        for app in apps {
            out.push(self.check_one(app, &images, &containers, &mut checked).await?);
        }
        Ok(StatusReport { apps: out })
    }

    async fn check_one(
        &self,
        app: &App,
        images: &[ImageSummary],
        containers: &[ContainerSummary],
        checked: &mut HashSet<Digest>,
    ) -> Result<AppStatus> {
        let mut status = AppStatus {
            app: app.name().to_string(),
            uri: app.app_ref.spec.clone(),
            ..AppStatus::default()
        };

        for node in app.tree.nodes()? {
            let digest = &node.descriptor.digest;
            if checked.contains(digest) {
                continue;
            }
            match check_blob(self.store, &node.descriptor).await? {
                BlobState::Ok => {
                    checked.insert(digest.clone());
                }
                state => status.missing_blobs.push((digest.clone(), state)),
            }
        }

        for service in &app.project.services {
            let aliases = service.image.aliases();
            let present = images
                .iter()
                .any(|img| aliases.iter().any(|a| img.has_name(a)));
            if !present {
                status.missing_images.push(service.image.spec.clone());
            }

            let running = containers.iter().any(|c| {
                aliases.iter().any(|a| *a == c.image)
                    && c.labels.get(LABEL_CONFIG_HASH).map(String::as_str)
                        == Some(service.config_hash.as_str())
                    && c.state == "running"
            });
            if !running {
                status.not_running.push(service.name.clone());
            }
        }

        debug!(
            app = %status.app,
            fetched = status.fetched(),
            installed = status.installed(),
            running = status.running(),
            "checked app status"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_nest() {
        let mut s = AppStatus::default();
        assert!(s.running());
        s.not_running.push("web".into());
        assert!(s.installed());
        assert!(!s.running());
        s.missing_blobs.push((Digest::of(b"x"), BlobState::Missing));
        assert!(!s.fetched());
        assert!(!s.installed());

        let report = StatusReport { apps: vec![s] };
        assert!(!report.are_fetched());
        assert!(StatusReport::default().are_running());
    }
}
