//! Access exception store.
//!
//! Keeps the user's directory grants as two independent ordered lists, one
//! per [`AccessMode`], each persisted through the [`SettingsStore`] under its
//! own key. Every mutation holds the list's lock and runs inside one
//! [`SettingsStore::update_list`] cycle: the persisted list is re-read,
//! merged into memory, edited and written back. Other owners of the same
//! settings (a CLI next to a running session) therefore never lose or
//! overwrite each other's grants.
//!
//! Grants are activated once per session with [`AccessExceptionStore::activate`]
//! and released on [`AccessExceptionStore::deactivate_all`] or drop.

mod candidate;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capability::key::DeviceKey;
use crate::capability::{AccessMode, CapabilityError, CapabilityProvider, SignedBookmarks};
use crate::settings::{SettingsError, SettingsStore};

pub use candidate::Candidate;

#[derive(Debug, Error)]
pub enum ExceptionError {
    #[error("no {mode} exception at index {index} (list has {len})")]
    IndexOutOfRange {
        mode: AccessMode,
        index: usize,
        len: usize,
    },

    #[error("{mode} list was given a provider for {provider} tokens")]
    ProviderMode {
        mode: AccessMode,
        provider: AccessMode,
    },

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// One persisted grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub mode: AccessMode,
    pub opaque: Vec<u8>,
    /// Last successfully resolved location, if any.
    pub resolved_path: Option<PathBuf>,
    /// A resolution found the data this token was loaded or minted with
    /// stale. `opaque` already holds the refreshed replacement.
    pub stale: bool,
}

impl AccessToken {
    fn unresolved(mode: AccessMode, opaque: Vec<u8>) -> Self {
        Self {
            mode,
            opaque,
            resolved_path: None,
            stale: false,
        }
    }
}

/// Ordered tokens sharing one mode. Insertion order is display order.
#[derive(Debug, Clone)]
pub struct ExceptionList {
    mode: AccessMode,
    tokens: Vec<AccessToken>,
}

impl ExceptionList {
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn tokens(&self) -> &[AccessToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn opaque_values(&self) -> Vec<Vec<u8>> {
        self.tokens.iter().map(|t| t.opaque.clone()).collect()
    }

    fn contains_path(&self, path: &Path) -> bool {
        self.tokens
            .iter()
            .any(|t| t.resolved_path.as_deref() == Some(path))
    }
}

struct Lane {
    provider: Box<dyn CapabilityProvider>,
    list: Mutex<ExceptionList>,
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, ExceptionList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `token` in place (activating it when `activate` is set) and
    /// swap in refreshed data if it was stale. Returns whether `opaque`
    /// changed, i.e. whether the list must be re-persisted.
    fn refresh(&self, token: &mut AccessToken, activate: bool) -> Result<bool, CapabilityError> {
        let resolved = if activate {
            self.provider.start_access(&token.opaque)
        } else {
            self.provider.resolve(&token.opaque)
        };
        let resolution = match resolved {
            Ok(resolution) => resolution,
            Err(e) => {
                token.resolved_path = None;
                return Err(e);
            }
        };

        token.stale |= resolution.stale;
        token.resolved_path = Some(resolution.path);
        match resolution.refreshed {
            Some(fresh) => {
                debug!(mode = %token.mode, path = ?token.resolved_path, "Replaced stale grant");
                token.opaque = fresh;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Make `list` mirror `stored`, keeping what is already known about
    /// tokens present in both. Tokens not yet resolved are resolved here.
    /// Returns whether a stale token was refreshed.
    fn merge(&self, list: &mut ExceptionList, stored: &[Vec<u8>]) -> bool {
        let mut previous = std::mem::take(&mut list.tokens);
        let mut refreshed = false;

        for opaque in stored {
            let mut token = match previous.iter().position(|t| &t.opaque == opaque) {
                Some(i) => previous.swap_remove(i),
                None => AccessToken::unresolved(list.mode, opaque.clone()),
            };
            if token.resolved_path.is_none() {
                match self.refresh(&mut token, false) {
                    Ok(changed) => refreshed |= changed,
                    Err(e) => debug!(mode = %list.mode, error = %e, "Grant does not resolve"),
                }
            }
            list.tokens.push(token);
        }

        // Removed through another owner of the settings.
        for gone in previous {
            if let Some(path) = &gone.resolved_path
                && !list.contains_path(path)
            {
                let _ = self.provider.stop_access(&gone.opaque);
                debug!(mode = %list.mode, path = %path.display(), "Grant removed elsewhere");
            }
        }
        refreshed
    }
}

pub struct AccessExceptionStore {
    settings: Arc<dyn SettingsStore>,
    read_write: Lane,
    read_only: Lane,
}

impl AccessExceptionStore {
    /// Load both lists from `settings`. Nothing is activated yet.
    pub fn open(
        settings: Arc<dyn SettingsStore>,
        read_write: Box<dyn CapabilityProvider>,
        read_only: Box<dyn CapabilityProvider>,
    ) -> Result<Self, ExceptionError> {
        let read_write = Self::load_lane(settings.as_ref(), AccessMode::ReadWrite, read_write)?;
        let read_only = Self::load_lane(settings.as_ref(), AccessMode::ReadOnly, read_only)?;
        Ok(Self {
            settings,
            read_write,
            read_only,
        })
    }

    /// Open with [`SignedBookmarks`] providers sealed under `key`.
    pub fn with_device_key(
        settings: Arc<dyn SettingsStore>,
        key: DeviceKey,
    ) -> Result<Self, ExceptionError> {
        Self::open(
            settings,
            Box::new(SignedBookmarks::new(key, AccessMode::ReadWrite)),
            Box::new(SignedBookmarks::new(key, AccessMode::ReadOnly)),
        )
    }

    fn load_lane(
        settings: &dyn SettingsStore,
        mode: AccessMode,
        provider: Box<dyn CapabilityProvider>,
    ) -> Result<Lane, ExceptionError> {
        if provider.mode() != mode {
            return Err(ExceptionError::ProviderMode {
                mode,
                provider: provider.mode(),
            });
        }
        let tokens = settings
            .get_list(mode.settings_key())?
            .into_iter()
            .map(|opaque| AccessToken::unresolved(mode, opaque))
            .collect();
        Ok(Lane {
            provider,
            list: Mutex::new(ExceptionList { mode, tokens }),
        })
    }

    fn lane(&self, mode: AccessMode) -> &Lane {
        match mode {
            AccessMode::ReadWrite => &self.read_write,
            AccessMode::ReadOnly => &self.read_only,
        }
    }

    /// One read-merge-edit-persist cycle on `list`.
    ///
    /// `edit` returns its value and whether it changed the list. The list
    /// is written back when `edit` changed it or when merging refreshed a
    /// stale token, even if `edit` itself failed.
    fn update<T>(
        &self,
        lane: &Lane,
        list: &mut ExceptionList,
        edit: impl FnOnce(&Lane, &mut ExceptionList) -> Result<(T, bool), ExceptionError>,
    ) -> Result<T, ExceptionError> {
        let mut edit = Some(edit);
        let mut outcome = None;

        self.settings
            .update_list(list.mode.settings_key(), &mut |stored| {
                let refreshed = lane.merge(&mut *list, stored);
                let Some(edit) = edit.take() else {
                    return false;
                };
                let result = edit(lane, &mut *list);
                let changed = refreshed || matches!(result, Ok((_, true)));
                if refreshed {
                    info!(mode = %list.mode, "Re-persisting exception list after refreshing stale grants");
                }
                if changed {
                    *stored = list.opaque_values();
                }
                outcome = Some(result.map(|(value, _)| value));
                changed
            })?;

        match outcome {
            Some(result) => result,
            None => unreachable!("settings store skipped the list edit"),
        }
    }

    /// Resolve and activate every persisted grant in both lists.
    ///
    /// Stale tokens are swapped for refreshed data and the owning list is
    /// re-persisted. Tokens that no longer resolve stay in the list so the
    /// user can remove them. Returns the number of active grants.
    pub fn activate(&self) -> Result<usize, ExceptionError> {
        let mut active = 0;
        for mode in AccessMode::ALL {
            let lane = self.lane(mode);
            let mut list = lane.lock();
            active += self.update(lane, &mut list, |lane, list| {
                let mut active = 0;
                let mut refreshed = false;
                for token in list.tokens.iter_mut() {
                    match lane.refresh(token, true) {
                        Ok(changed) => {
                            refreshed |= changed;
                            active += 1;
                        }
                        Err(e) => warn!(%mode, error = %e, "Could not activate access exception"),
                    }
                }
                Ok((active, refreshed))
            })?;
        }
        debug!(active, "Access exceptions activated");
        Ok(active)
    }

    /// Grant `path` under `mode`. Returns `false` when a grant already
    /// resolves to the same location.
    pub fn add_exception(&self, mode: AccessMode, path: &Path) -> Result<bool, ExceptionError> {
        let lane = self.lane(mode);
        let mut list = lane.lock();

        let opaque = lane.provider.mint(path)?;
        let resolution = lane.provider.resolve(&opaque)?;
        let mut started = false;

        let result = self.update(lane, &mut list, |lane, list| {
            if list.contains_path(&resolution.path) {
                debug!(%mode, path = %resolution.path.display(), "Exception already present");
                return Ok((false, false));
            }
            lane.provider.start_access(&opaque)?;
            started = true;
            list.tokens.push(AccessToken {
                mode,
                opaque: opaque.clone(),
                resolved_path: Some(resolution.path.clone()),
                stale: false,
            });
            Ok((true, true))
        });

        if result.is_err() && started {
            list.tokens.retain(|t| t.opaque != opaque);
            let _ = lane.provider.stop_access(&opaque);
        }
        let added = result?;
        if added {
            info!(%mode, path = %resolution.path.display(), "Access exception added");
        }
        Ok(added)
    }

    /// Drop the grant at `index` of the current persisted list and revoke
    /// its token once the shortened list is on disk.
    pub fn remove_exception(
        &self,
        mode: AccessMode,
        index: usize,
    ) -> Result<AccessToken, ExceptionError> {
        let lane = self.lane(mode);
        let mut list = lane.lock();

        let token = self.update(lane, &mut list, |_, list| {
            let len = list.len();
            if index >= len {
                return Err(ExceptionError::IndexOutOfRange { mode, index, len });
            }
            Ok((list.tokens.remove(index), true))
        })?;

        if let Err(e) = lane.provider.revoke(&token.opaque) {
            warn!(%mode, index, error = %e, "Removed exception could not be revoked");
        }
        info!(%mode, index, path = ?token.resolved_path, "Access exception removed");
        Ok(token)
    }

    /// Add every local candidate; non-local ones are skipped silently.
    ///
    /// Returns `true` only when every attempted add returned `true`. Grants
    /// added before a failing candidate are kept.
    pub fn batch_add<I>(&self, mode: AccessMode, candidates: I) -> bool
    where
        I: IntoIterator<Item = Candidate>,
    {
        let mut all = true;
        for candidate in candidates {
            let Some(path) = candidate.to_local_path() else {
                debug!(%mode, ?candidate, "Skipping non-local candidate");
                continue;
            };
            match self.add_exception(mode, &path) {
                Ok(true) => {}
                Ok(false) => all = false,
                Err(e) => {
                    warn!(%mode, path = %path.display(), error = %e, "Failed to add exception");
                    all = false;
                }
            }
        }
        all
    }

    /// Resolve every grant in `mode` and return the paths in list order.
    ///
    /// Refreshes stale tokens like [`activate`](Self::activate). Grants that
    /// cannot be resolved are left out of the result.
    pub fn list_paths(&self, mode: AccessMode) -> Result<Vec<PathBuf>, ExceptionError> {
        let lane = self.lane(mode);
        let mut list = lane.lock();
        self.update(lane, &mut list, |lane, list| {
            let mut refreshed = false;
            let mut paths = Vec::with_capacity(list.len());
            for token in list.tokens.iter_mut() {
                match lane.refresh(token, false) {
                    Ok(changed) => {
                        refreshed |= changed;
                        paths.extend(token.resolved_path.clone());
                    }
                    Err(e) => warn!(%mode, error = %e, "Skipping unresolvable exception"),
                }
            }
            Ok((paths, refreshed))
        })
    }

    /// Snapshot of one list as last seen by this store.
    pub fn list(&self, mode: AccessMode) -> ExceptionList {
        self.lane(mode).lock().clone()
    }

    pub fn is_active(&self, mode: AccessMode, path: &Path) -> bool {
        self.lane(mode).provider.is_accessing(path)
    }

    /// Release every activated grant. Lists and settings are untouched.
    pub fn deactivate_all(&self) {
        for mode in AccessMode::ALL {
            let lane = self.lane(mode);
            let list = lane.lock();
            for token in list.tokens.iter().filter(|t| t.resolved_path.is_some()) {
                if let Err(e) = lane.provider.stop_access(&token.opaque) {
                    debug!(%mode, error = %e, "Deactivation failed");
                }
            }
        }
    }
}

impl Drop for AccessExceptionStore {
    fn drop(&mut self) {
        self.deactivate_all();
    }
}
