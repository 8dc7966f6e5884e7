//! Client reset: what a session does when the server no longer accepts
//! its history.

use super::{now_millis, MarkPurpose, SessionDriver};
use crate::config::ClientResyncMode;
use crate::error::SyncResult;
use crate::error_info::{SyncErrorInfo, ORIGINAL_FILE_PATH_KEY, RECOVERY_FILE_PATH_KEY};
use crate::manager::FileAction;
use crate::session::SessionState;
use realmdb_core::{CommitOrigin, Realm, ThreadSafeReference};
use realmdb_sync_protocol::instructions::InstructionApplier;
use realmdb_sync_protocol::{Changeset, ServerRequestsAction};
use std::path::{Path, PathBuf};

const TARGET: &str = "realm.sync.client.reset";

/// An automatic reset waiting for the fresh copy of the server's data.
pub(super) struct ResetInProgress {
    before: Realm,
    recovered: Vec<Changeset>,
    did_recover: bool,
}

/// Where a manual reset backs up the realm at `realm_path`.
pub(crate) fn recovery_path(realm_path: &Path, directory: Option<&Path>) -> PathBuf {
    let directory = directory.map_or_else(
        || {
            realm_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("recovered-realms")
        },
        Path::to_path_buf,
    );
    let stem = realm_path
        .file_stem()
        .map_or_else(|| "realm".into(), |s| s.to_string_lossy().into_owned());
    directory.join(format!("recovered-{stem}-{}.realm", now_millis()))
}

impl SessionDriver {
    pub(super) fn client_reset(&mut self, info: SyncErrorInfo) {
        let mode = self.shared.config.client_resync_mode;
        let action = info.server_requests_action;
        let recover = match (mode, action) {
            (ClientResyncMode::Manual, _)
            | (_, ServerRequestsAction::MigrateToFlx | ServerRequestsAction::RevertToPbs)
            | (ClientResyncMode::Recover, ServerRequestsAction::ClientResetNoRecovery) => {
                self.manual_reset(info);
                return;
            }
            (ClientResyncMode::DiscardLocal, _)
            | (ClientResyncMode::RecoverOrDiscard, ServerRequestsAction::ClientResetNoRecovery) => false,
            (ClientResyncMode::Recover | ClientResyncMode::RecoverOrDiscard, _) => true,
        };
        tracing::warn!(
            target: TARGET,
            path = %self.shared.path.display(),
            ?mode,
            recover,
            reason = %info.message,
            "resetting realm"
        );
        if let Err(err) = self.begin_automatic_reset(recover) {
            tracing::error!(target: TARGET, error = %err, "automatic reset failed; falling back to manual");
            self.manual_reset(info);
        }
    }

    /// Leaves the reset to the application: the session stops and the
    /// realm is backed up and deleted once every handle is closed.
    fn manual_reset(&mut self, mut info: SyncErrorInfo) {
        self.close_realm();
        let backup = recovery_path(&self.shared.path, self.shared.config.recovery_directory.as_deref());
        info.user_info.insert(
            ORIGINAL_FILE_PATH_KEY.to_owned(),
            self.shared.path.display().to_string(),
        );
        info.user_info
            .insert(RECOVERY_FILE_PATH_KEY.to_owned(), backup.display().to_string());
        self.shared.file_actions.insert(
            self.shared.path.clone(),
            FileAction::BackUpThenDeleteRealm {
                recovery_path: backup,
            },
        );
        tracing::info!(target: TARGET, path = %self.shared.path.display(), "waiting for the application to reset the realm");
        self.deactivate_with_error(info);
    }

    fn begin_automatic_reset(&mut self, recover: bool) -> SyncResult<()> {
        let before = {
            let realm = self
                .realm
                .as_ref()
                .ok_or_else(|| crate::error::SyncError::wrong_state("realm is closed"))?;
            realm.refresh()?;
            realm.freeze()?
        };
        if let Some(callback) = self.shared.config.notify_before_client_reset.clone() {
            callback(&before);
        }

        let pending = self.history.reset();
        let recovered = if recover { pending } else { Vec::new() };
        self.history.save()?;
        self.shared.set_file_ident(None);
        if let Some(store) = self.store() {
            store.revert_in_flight();
        }
        tracing::debug!(target: TARGET, recovered = recovered.len(), "local history discarded");

        self.reset = Some(ResetInProgress {
            before,
            recovered,
            did_recover: recover,
        });
        self.disconnect();
        self.add_mark(MarkPurpose::ClientReset);
        if self.shared.state() == SessionState::Active {
            self.connect();
        }
        Ok(())
    }

    /// Runs once the server's copy is downloaded: reapplies recovered
    /// changes and tells the application.
    pub(super) fn finish_client_reset(&mut self) {
        let Some(reset) = self.reset.take() else {
            return;
        };
        if let Err(err) = self.recover(&reset.recovered) {
            tracing::error!(target: TARGET, error = %err, "cannot reapply local changes");
            self.on_internal_error(&err);
            return;
        }
        tracing::info!(
            target: TARGET,
            path = %self.shared.path.display(),
            recovered = reset.recovered.len(),
            "client reset complete"
        );
        self.upload();
        let Some(callback) = self.shared.config.notify_after_client_reset.clone() else {
            return;
        };
        let Some(realm) = &self.realm else {
            return;
        };
        match ThreadSafeReference::from_realm(realm) {
            Ok(after) => callback(&reset.before, after, reset.did_recover),
            Err(err) => tracing::warn!(target: TARGET, error = %err, "cannot hand over the reset realm"),
        }
    }

    fn recover(&mut self, changesets: &[Changeset]) -> SyncResult<()> {
        if changesets.is_empty() {
            return Ok(());
        }
        let Some(realm) = &self.realm else {
            return Ok(());
        };
        for changeset in changesets {
            realm.write_as(CommitOrigin::Sync, |realm| {
                InstructionApplier::new(realm)?.apply_all(&changeset.operations)
            })?;
        }
        for changeset in changesets {
            self.history
                .record_local(changeset.operations.clone(), changeset.origin_timestamp)?;
        }
        self.history.save()?;
        self.report_upload_progress();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backups_default_next_to_the_realm() {
        let path = recovery_path(Path::new("/data/app/tasks.realm"), None);
        assert_eq!(path.parent(), Some(Path::new("/data/app/recovered-realms")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("recovered-tasks-"));
        assert!(name.ends_with(".realm"));

        let path = recovery_path(Path::new("/data/app/tasks.realm"), Some(Path::new("/backups")));
        assert_eq!(path.parent(), Some(Path::new("/backups")));
    }
}
