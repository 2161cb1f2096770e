//! Drives updates through the state machine.
//!
//! Every operation opens the update store (taking its lock), checks the
//! transition table, persists the running state, does its work and
//! persists the outcome. A cancelled operation leaves the record in its
//! running state so it can be resumed; any other error marks it failed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use composeapp_oci::{
    BlobProvider, ContentStore, Digest, OciError, PlatformMatcher, PruneStats, RegistryClient,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::UpdateStore;
use super::{transition, Op, State, Update};
use crate::app::layout::{list_apps, materialize, remove_app};
use crate::app::{load_app, App, AppRef};
use crate::blob::{check_blob, BlobInfo, BlobState};
use crate::compose::{ComposeRunner, DockerCompose};
use crate::config::Config;
use crate::docker::{DockerEngine, ImageHost};
use crate::fetch::Fetcher;
use crate::install::{InstallProgress, Installer};
use crate::status::{StatusChecker, StatusReport};
use crate::usage::{statfs, usage_info};
use crate::{Error, Result};

/// Everything an update talks to.
pub struct Env {
    pub config: Config,
    pub store: ContentStore,
    /// Where missing blobs come from.
    pub remote: Arc<dyn BlobProvider>,
    pub host: Arc<dyn ImageHost>,
    pub compose: Arc<dyn ComposeRunner>,
    pub matcher: PlatformMatcher,
}

impl Env {
    /// Registry, daemon and compose clients built from `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let mut remote = RegistryClient::new(config.registry_config())?;
        for (registry, creds) in &config.registry_auth {
            debug!(%registry, "using registry credentials");
            remote = remote.with_credentials(registry.clone(), creds.clone());
        }
        let host = DockerEngine::new(&config.docker_host)?;
        let compose = DockerCompose::new(config.docker_host.clone());
        Ok(Self {
            matcher: config.platform_matcher()?,
            store: ContentStore::new(config.store_root.clone()),
            remote: Arc::new(remote),
            host: Arc::new(host),
            compose: Arc::new(compose),
            config,
        })
    }

    pub fn with_remote(mut self, remote: Arc<dyn BlobProvider>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_host(mut self, host: Arc<dyn ImageHost>) -> Self {
        self.host = host;
        self
    }

    pub fn with_compose(mut self, compose: Arc<dyn ComposeRunner>) -> Self {
        self.compose = compose;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitOptions {
    /// Skip ahead to fetched, installed or started when nothing is missing.
    pub check_status: bool,
    /// Accept an update with no apps.
    pub allow_empty_app_list: bool,
}

pub struct Runner {
    env: Env,
}

impl Runner {
    pub fn new(env: Env) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    async fn lock(&self) -> Result<UpdateStore> {
        UpdateStore::open(&self.env.config.db_path(), self.env.config.lock_timeout()).await
    }

    /// Record a new update of the device to `uris`. Fails when another
    /// update is in progress.
    pub async fn create(
        &self,
        client_ref: &str,
        uris: Vec<String>,
        allow_empty_app_list: bool,
    ) -> Result<Update> {
        validate_uris(&uris, allow_empty_app_list)?;
        let db = self.lock().await?;
        match db.last_with_states(&State::IN_PROGRESS) {
            Ok(current) => {
                warn!(id = %current.id, state = %current.state, "refusing new update");
                return Err(Error::StateConflict("update already in progress".to_string()));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let update = Update::new(client_ref, uris);
        db.create(&update)?;
        info!(id = %update.id, client_ref, apps = update.uris.len(), "created update");
        Ok(update)
    }

    /// The update in progress.
    pub async fn current(&self) -> Result<Update> {
        self.lock().await?.last_with_states(&State::IN_PROGRESS)
    }

    pub async fn last_completed(&self) -> Result<Update> {
        self.lock().await?.last_with_states(&[State::Completed])
    }

    /// Every update ever recorded, oldest first.
    pub async fn history(&self) -> Result<Vec<Update>> {
        self.lock().await?.list()
    }

    /// Take the latest record into the running state of `op`.
    fn begin(&self, db: &UpdateStore, op: Op) -> Result<(Update, State)> {
        let mut update = db
            .last()?
            .ok_or_else(|| Error::NotFound("no update has been created".to_string()))?;
        let (running, done) = transition(op, update.state).ok_or_else(|| {
            Error::StateConflict(format!(
                "cannot {op} update {} in state {}",
                update.id, update.state
            ))
        })?;
        info!(id = %update.id, %op, from = %update.state, to = %running, "update transition");
        update.state = running;
        update.touch();
        db.write(&update)?;
        Ok((update, done))
    }

    /// Persist the outcome of `op`.
    fn finish(&self, db: &UpdateStore, op: Op, mut update: Update, result: Result<State>) -> Result<Update> {
        match result {
            Ok(state) => {
                update.state = state;
                update.touch();
                db.write(&update)?;
                info!(id = %update.id, %op, state = %state, "update operation finished");
                Ok(update)
            }
            Err(e) if e.is_cancelled() => {
                update.touch();
                if let Err(we) = db.write(&update) {
                    error!(id = %update.id, error = %we, "failed to persist cancelled update");
                }
                warn!(id = %update.id, %op, state = %update.state, "update operation cancelled");
                Err(e)
            }
            Err(e) => {
                update.state = State::Failed;
                update.touch();
                if let Err(we) = db.write(&update) {
                    error!(id = %update.id, error = %we, "failed to persist failed update");
                }
                error!(id = %update.id, %op, error = %e, "update operation failed");
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Init
    // -----------------------------------------------------------------------

    /// Load every app tree and record which blobs the store lacks.
    pub async fn init(&self, opts: InitOptions, cancel: &CancellationToken) -> Result<Update> {
        let db = self.lock().await?;
        if let Some(last) = db.last()? {
            validate_uris(&last.uris, opts.allow_empty_app_list)?;
        }
        let (mut update, done) = self.begin(&db, Op::Init)?;
        let result = self.do_init(&db, &mut update, done, opts, cancel).await;
        self.finish(&db, Op::Init, update, result)
    }

    async fn do_init(
        &self,
        db: &UpdateStore,
        update: &mut Update,
        done: State,
        opts: InitOptions,
        cancel: &CancellationToken,
    ) -> Result<State> {
        update.blobs.clear();
        update.total_blobs_bytes = 0;
        update.fetched_bytes = 0;
        update.fetched_blobs = 0;
        update.progress = 0;
        db.write(update)?;

        let apps = self.load_apps(&update.uris, cancel).await?;
        let store = &self.env.store;
        tokio::fs::create_dir_all(store.root()).await?;
        let block_size = statfs(store.root())?.block_size;

        let mut present: HashSet<Digest> = HashSet::new();
        for app in &apps {
            for node in app.tree.nodes()? {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let digest = &node.descriptor.digest;
                if present.contains(digest) || update.blobs.contains_key(digest) {
                    continue;
                }
                match check_blob(store, &node.descriptor).await? {
                    BlobState::Ok => {
                        present.insert(digest.clone());
                    }
                    state => {
                        debug!(app = %app.name(), %digest, ?state, blob_type = %node.blob_type, "blob needs fetching");
                        let info = BlobInfo::new(node, state, block_size, app.layers_meta.as_ref());
                        update.blobs.insert(digest.clone(), info);
                    }
                }
            }
        }
        update.total_blobs_bytes = update.blobs.values().map(|b| b.descriptor.size).sum();
        update.progress = 100;
        info!(
            id = %update.id,
            missing = update.blobs.len(),
            bytes = update.total_blobs_bytes,
            "initialized update"
        );

        if opts.check_status && update.blobs.is_empty() {
            for app in &apps {
                materialize(store, app).await?;
            }
            let report = StatusChecker::new(store, self.env.host.as_ref())
                .check(&apps)
                .await?;
            let state = if report.are_running() {
                State::Started
            } else if report.are_installed() {
                State::Installed
            } else {
                State::Fetched
            };
            info!(id = %update.id, %state, "apps already on device");
            return Ok(state);
        }
        Ok(done)
    }

    /// Load app trees from the store, falling back to the registry for
    /// apps the store cannot resolve.
    async fn load_apps(&self, uris: &[String], cancel: &CancellationToken) -> Result<Vec<App>> {
        let mut apps = Vec::with_capacity(uris.len());
        for uri in uris {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let app = match load_app(&self.env.store, &self.env.matcher, uri).await {
                Ok(app) => app,
                Err(e) => {
                    debug!(uri = %uri, error = %e, "loading app tree from registry");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        r = load_app(self.env.remote.as_ref(), &self.env.matcher, uri) => r?,
                    }
                }
            };
            apps.push(app);
        }
        Ok(apps)
    }

    /// Load app trees from the store only.
    async fn load_local_apps(&self, uris: &[String]) -> Result<Vec<App>> {
        let mut apps = Vec::with_capacity(uris.len());
        for uri in uris {
            apps.push(load_app(&self.env.store, &self.env.matcher, uri).await?);
        }
        Ok(apps)
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Download the blobs Init found missing. `on_progress` sees the record
    /// after each persisted progress sample.
    pub async fn fetch<F>(&self, cancel: &CancellationToken, mut on_progress: F) -> Result<Update>
    where
        F: FnMut(&Update),
    {
        let db = self.lock().await?;
        let (mut update, done) = self.begin(&db, Op::Fetch)?;
        let result = self
            .do_fetch(&db, &mut update, done, cancel, &mut on_progress)
            .await;
        self.finish(&db, Op::Fetch, update, result)
    }

    async fn do_fetch(
        &self,
        db: &UpdateStore,
        update: &mut Update,
        done: State,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(&Update),
    ) -> Result<State> {
        update.progress = 0;
        let store = &self.env.store;
        let config = &self.env.config;

        let missing: BTreeMap<Digest, BlobInfo> = update
            .blobs
            .iter()
            .filter(|(_, b)| b.state != BlobState::Ok)
            .map(|(d, b)| (d.clone(), b.clone()))
            .collect();
        let fetched: Vec<&BlobInfo> = update
            .blobs
            .values()
            .filter(|b| b.state == BlobState::Ok)
            .collect();
        let base_bytes: u64 = fetched.iter().map(|b| b.descriptor.size).sum();
        let base_count = fetched.len();

        tokio::fs::create_dir_all(store.root()).await?;
        let required: u64 = missing
            .values()
            .map(|b| b.store_size.saturating_add(b.runtime_size))
            .sum();
        let usage = usage_info(store.root(), required, config.usage_watermark)?;
        info!(
            required = usage.required,
            available = usage.available,
            watermark = usage.watermark,
            "checked storage usage"
        );
        usage.check()?;

        let total = update.total_blobs_bytes;
        let mut persist_error = None;
        let fetcher = Fetcher::new(store, self.env.remote.as_ref())
            .poll_interval(config.poll_interval())
            .force(true);
        let result = fetcher
            .fetch(&missing, cancel, |p| {
                for (digest, bp) in &p.blobs {
                    if let Some(b) = update.blobs.get_mut(digest) {
                        b.bytes_fetched = bp.bytes_fetched;
                        b.fetch_start = bp.fetch_start;
                        b.read_speed_cur = bp.read_speed_cur;
                        b.read_speed_avg = bp.read_speed_avg;
                        if bp.state == BlobState::Ok {
                            b.state = BlobState::Ok;
                        }
                    }
                }
                update.fetched_bytes = base_bytes + p.current_bytes;
                update.fetched_blobs = base_count + p.fetched_count;
                let percent = if total == 0 {
                    100
                } else {
                    (u128::from(update.fetched_bytes) * 100 / u128::from(total)).min(100) as u8
                };
                update.progress = update.progress.max(percent);
                if update.progress == 100 {
                    update.state = State::Fetched;
                }
                update.touch();
                if let Err(e) = db.write(update) {
                    persist_error.get_or_insert(e);
                }
                on_progress(&*update);
            })
            .await;
        if let Some(e) = persist_error {
            return Err(e);
        }
        result?;

        update.progress = 100;
        for app in self.load_local_apps(&update.uris).await? {
            materialize(store, &app).await?;
        }
        Ok(done)
    }

    // -----------------------------------------------------------------------
    // Install
    // -----------------------------------------------------------------------

    /// Extract bundles and load images into the daemon.
    pub async fn install<F>(&self, cancel: &CancellationToken, mut on_progress: F) -> Result<Update>
    where
        F: FnMut(InstallProgress) + Send,
    {
        let db = self.lock().await?;
        let (mut update, done) = self.begin(&db, Op::Install)?;
        let result = self
            .do_install(&db, &mut update, done, cancel, &mut on_progress)
            .await;
        self.finish(&db, Op::Install, update, result)
    }

    async fn do_install(
        &self,
        db: &UpdateStore,
        update: &mut Update,
        done: State,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(InstallProgress) + Send),
    ) -> Result<State> {
        update.progress = 0;
        let apps = self.load_local_apps(&update.uris).await?;
        let installer = Installer::new(
            &self.env.store,
            self.env.host.as_ref(),
            self.env.config.compose_root.clone(),
        )
        .patched_daemon(self.env.config.patched_daemon)
        .platform(&self.env.matcher);

        let count = apps.len();
        for (i, app) in apps.iter().enumerate() {
            let loaded = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = installer.install(app, &mut *on_progress) => r?,
            };
            update.loaded_images.extend(loaded);
            update.progress = ((i + 1) * 100 / count) as u8;
            update.touch();
            db.write(update)?;
        }
        update.progress = 100;
        Ok(done)
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// `docker compose up` every app.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<Update> {
        let db = self.lock().await?;
        let (mut update, done) = self.begin(&db, Op::Start)?;
        let result = self.do_start(&db, &mut update, done, cancel).await;
        self.finish(&db, Op::Start, update, result)
    }

    async fn do_start(
        &self,
        db: &UpdateStore,
        update: &mut Update,
        done: State,
        cancel: &CancellationToken,
    ) -> Result<State> {
        update.progress = 0;
        let refs = update
            .uris
            .iter()
            .map(|u| AppRef::parse_pinned(u))
            .collect::<Result<Vec<_>>>()?;
        let step = (100 / refs.len().max(1)) as u8;
        for app in &refs {
            let dir = self.env.config.app_compose_dir(&app.name);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = self.env.compose.up(&dir, &app.name) => r?,
            }
            update.progress = update.progress.saturating_add(step).min(100);
            update.touch();
            db.write(update)?;
        }
        update.progress = 100;
        Ok(done)
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Undo an unfinished update: unload its images and delete the blobs it
    /// fetched.
    pub async fn cancel(&self, cancel: &CancellationToken) -> Result<Update> {
        let db = self.lock().await?;
        let (mut update, done) = self.begin(&db, Op::Cancel)?;
        let result = self.do_cancel(&db, &mut update, done, cancel).await;
        self.finish(&db, Op::Cancel, update, result)
    }

    async fn do_cancel(
        &self,
        db: &UpdateStore,
        update: &mut Update,
        done: State,
        cancel: &CancellationToken,
    ) -> Result<State> {
        update.progress = 0;
        let total = (update.loaded_images.len() + update.blobs.len()).max(1);
        let mut steps = 0usize;

        for image in update.loaded_images.clone() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.env.host.remove_image(&image).await {
                Ok(()) => info!(%image, "removed loaded image"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(%image, error = %e, "failed to remove loaded image"),
            }
            steps += 1;
            update.progress = (steps * 100 / total) as u8;
        }

        self.remove_touched_layouts(update).await?;

        let mut failed = Vec::new();
        for (digest, blob) in &update.blobs {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(reference) = blob.descriptor.reference() {
                if let Err(e) = self.env.store.abort(reference).await {
                    warn!(%digest, error = %e, "failed to discard partial blob");
                }
            }
            match self.env.store.delete(digest).await {
                Ok(()) | Err(OciError::NotFound(_)) => {}
                Err(e) => failed.push(format!("{digest} ({e})")),
            }
            steps += 1;
        }
        update.progress = (steps * 100 / total).min(100) as u8;
        if !failed.is_empty() {
            return Err(Error::Internal(format!(
                "failed to remove blobs: {}",
                failed.join(", ")
            )));
        }
        update.progress = 100;
        db.write(update)?;
        Ok(done)
    }

    /// Remove the layout of every app of `update` that refers to a blob the
    /// update fetched. Such a layout would dangle once the blobs are gone.
    async fn remove_touched_layouts(&self, update: &Update) -> Result<()> {
        let store = &self.env.store;
        for uri in &update.uris {
            let app_ref = AppRef::parse_pinned(uri)?;
            let touched = update.blobs.contains_key(&app_ref.digest)
                || match load_app(store, &self.env.matcher, uri).await {
                    Ok(app) => app
                        .tree
                        .nodes()?
                        .iter()
                        .any(|n| update.blobs.contains_key(&n.descriptor.digest)),
                    Err(e) => {
                        debug!(app = %app_ref, error = %e, "app tree not in store");
                        true
                    }
                };
            if !touched {
                continue;
            }
            match remove_app(store, &app_ref).await {
                Ok(()) => info!(app = %app_ref, "removed layout of cancelled app"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Complete
    // -----------------------------------------------------------------------

    /// Verify the update's apps are whole; with `prune`, remove every other
    /// app and the blobs nothing references.
    pub async fn complete(&self, prune: bool, cancel: &CancellationToken) -> Result<Update> {
        let db = self.lock().await?;
        let (mut update, done) = self.begin(&db, Op::Complete)?;
        let result = self.do_complete(&mut update, done, prune, cancel).await;
        self.finish(&db, Op::Complete, update, result)
    }

    async fn do_complete(
        &self,
        update: &mut Update,
        done: State,
        prune: bool,
        cancel: &CancellationToken,
    ) -> Result<State> {
        update.progress = 0;
        let apps = self.load_local_apps(&update.uris).await?;
        for app in &apps {
            for node in app.tree.nodes()? {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let digest = &node.descriptor.digest;
                match check_blob(&self.env.store, &node.descriptor).await? {
                    BlobState::Ok => {}
                    BlobState::Missing => {
                        return Err(Error::NotFound(format!(
                            "{} {digest} of app {} is missing from the store",
                            node.blob_type,
                            app.name()
                        )))
                    }
                    state => {
                        return Err(Error::Integrity(format!(
                            "{} {digest} of app {} is invalid: {state:?}",
                            node.blob_type,
                            app.name()
                        )))
                    }
                }
            }
        }
        if prune {
            self.prune_apps(&apps).await?;
        }
        update.progress = 100;
        Ok(done)
    }

    /// Remove every stored app not in `keep`, then every blob no remaining
    /// app references.
    async fn prune_apps(&self, keep: &[App]) -> Result<()> {
        let store = &self.env.store;
        let kept: HashSet<(&str, &Digest)> = keep
            .iter()
            .map(|a| (a.name(), &a.app_ref.digest))
            .collect();
        let kept_names: HashSet<&str> = keep.iter().map(|a| a.name()).collect();
        let kept_tags: HashSet<String> = keep
            .iter()
            .flat_map(|a| a.project.services.iter())
            .map(|s| s.image.tag_ref())
            .collect();

        let stale: Vec<AppRef> = list_apps(store)
            .await?
            .into_iter()
            .filter(|r| !kept.contains(&(r.name.as_str(), &r.digest)))
            .collect();
        if stale.is_empty() {
            debug!("no stale apps to prune");
        }

        let mut stale_apps = Vec::new();
        for app_ref in &stale {
            match load_app(store, &self.env.matcher, &app_ref.spec).await {
                Ok(app) => stale_apps.push(app),
                Err(e) => warn!(app = %app_ref, error = %e, "stale app tree is incomplete"),
            }
        }
        let report = StatusChecker::new(store, self.env.host.as_ref())
            .check(&stale_apps)
            .await?;
        let running: Vec<&str> = stale_apps
            .iter()
            .zip(&report.apps)
            .filter(|(app, status)| {
                !app.project.services.is_empty() && status.not_running.is_empty()
            })
            .map(|(app, _)| app.app_ref.spec.as_str())
            .collect();
        if !running.is_empty() {
            return Err(Error::StateConflict(format!(
                "cannot remove running apps: {}",
                running.join(", ")
            )));
        }

        for app in &stale_apps {
            if !kept_names.contains(app.name()) {
                let dir = self.env.config.app_compose_dir(app.name());
                if dir.is_dir() {
                    self.env.compose.down(&dir, app.name()).await?;
                }
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => info!(app = %app.name(), "removed compose project"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            for service in &app.project.services {
                let tag = service.image.tag_ref();
                if kept_tags.contains(&tag) {
                    continue;
                }
                match self.env.host.remove_image(&tag).await {
                    Ok(()) => info!(image = %tag, "removed stale image"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(image = %tag, error = %e, "failed to remove stale image"),
                }
            }
        }
        for app_ref in &stale {
            match remove_app(store, app_ref).await {
                Ok(()) => info!(app = %app_ref, "pruned app"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut referenced = self.layout_digests().await?;
        for app in keep {
            for node in app.tree.nodes()? {
                referenced.insert(node.descriptor.digest.clone());
            }
        }
        store.prune(&referenced).await?;
        Ok(())
    }

    /// Delete every blob no stored app layout references. Refused while an
    /// update is in progress, since its fetched blobs have no layout yet.
    pub async fn prune_store(&self) -> Result<PruneStats> {
        let db = self.lock().await?;
        match db.last_with_states(&State::IN_PROGRESS) {
            Ok(current) => {
                return Err(Error::StateConflict(format!(
                    "update {} is {}; finish or cancel it first",
                    current.id, current.state
                )))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let referenced = self.layout_digests().await?;
        Ok(self.env.store.prune(&referenced).await?)
    }

    /// Every digest in the tree of an app with a store layout.
    async fn layout_digests(&self) -> Result<HashSet<Digest>> {
        let store = &self.env.store;
        let mut out = HashSet::new();
        for app_ref in list_apps(store).await? {
            let app = match load_app(store, &self.env.matcher, &app_ref.spec).await {
                Ok(app) => app,
                Err(e) if e.is_not_found() => {
                    warn!(app = %app_ref, error = %e, "skipping layout with missing blobs");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for node in app.tree.nodes()? {
                out.insert(node.descriptor.digest.clone());
            }
        }
        Ok(out)
    }

    /// Status of the apps at `uris`.
    pub async fn status(&self, uris: &[String]) -> Result<StatusReport> {
        let apps = self.load_apps(uris, &CancellationToken::new()).await?;
        StatusChecker::new(&self.env.store, self.env.host.as_ref())
            .check(&apps)
            .await
    }
}

fn validate_uris(uris: &[String], allow_empty: bool) -> Result<()> {
    if uris.is_empty() && !allow_empty {
        return Err(Error::InvalidInput("no apps to update".to_string()));
    }
    for uri in uris {
        AppRef::parse_pinned(uri)?;
    }
    Ok(())
}
