//! File-backed implementation of [`StateStore`].
//!
//! Layout: `<root>/<app>/<app>.<runId>.<attemptId>.<millis>.json`, one file
//! per attempt. Writes go through a temp file in the same directory plus a
//! rename, so readers never observe a half-written record. A mutex
//! serialises writers within the process; cross-process exclusion is the
//! caller's responsibility (one driver per application name).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use lakerun_types::state::RunState;

use crate::error::{self, StateError};
use crate::store::{RetentionPolicy, StateFileRef, StateStore};

/// File-backed state storage rooted at a configurable directory.
pub struct FileStateStore {
    root: PathBuf,
    retention: RetentionPolicy,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first save.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retention: RetentionPolicy::default(),
            write_lock: Mutex::new(()),
        }
    }

    /// Replace the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn app_dir(&self, app_name: &str) -> PathBuf {
        self.root.join(app_name)
    }

    fn file_name(state: &RunState, millis: i64) -> String {
        format!(
            "{}.{}.{}.{}.json",
            state.app_name, state.run_id, state.attempt_id, millis
        )
    }

    /// Parse `<app>.<runId>.<attemptId>.<millis>.json`; the app name may
    /// itself contain dots, so the numeric fields are taken from the end.
    fn parse_file_name(path: &Path) -> Option<StateFileRef> {
        let stem = path.file_name()?.to_str()?.strip_suffix(".json")?;
        let mut parts: Vec<&str> = stem.split('.').collect();
        if parts.len() < 4 {
            return None;
        }
        let timestamp_millis: i64 = parts.pop()?.parse().ok()?;
        let attempt_id: u32 = parts.pop()?.parse().ok()?;
        let run_id: u32 = parts.pop()?.parse().ok()?;
        Some(StateFileRef {
            path: path.to_path_buf(),
            app_name: parts.join("."),
            run_id,
            attempt_id,
            timestamp_millis,
        })
    }

    fn apply_retention(&self, app_name: &str) -> error::Result<()> {
        let policy = &self.retention;
        if policy.max_files.is_none() && policy.max_age.is_none() {
            return Ok(());
        }
        // Newest first; index 0 is the current file and is always kept.
        let refs = self.list(app_name)?;
        let now_millis = Utc::now().timestamp_millis();
        for (index, file_ref) in refs.iter().enumerate() {
            if index == 0 {
                continue;
            }
            let over_count = policy.max_files.is_some_and(|max| index >= max);
            let over_age = policy.max_age.is_some_and(|max| {
                now_millis - file_ref.timestamp_millis > max.num_milliseconds()
            });
            if over_count || over_age {
                tracing::debug!(
                    app = app_name,
                    file = %file_ref.path.display(),
                    "Deleting state file per retention policy"
                );
                fs::remove_file(&file_ref.path)?;
            }
        }
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn save(&self, state: &RunState) -> error::Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let dir = self.app_dir(&state.app_name);
        fs::create_dir_all(&dir)?;

        let millis = Utc::now().timestamp_millis();
        let final_path = dir.join(Self::file_name(state, millis));
        let tmp_path = dir.join(format!(".{}.tmp", Self::file_name(state, millis)));

        let json = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &final_path)?;

        // An older file for the same attempt is superseded by this one.
        for file_ref in self.list(&state.app_name)? {
            if file_ref.run_id == state.run_id
                && file_ref.attempt_id == state.attempt_id
                && file_ref.path != final_path
            {
                fs::remove_file(&file_ref.path)?;
            }
        }

        self.apply_retention(&state.app_name)?;
        tracing::debug!(
            app = state.app_name,
            run_id = state.run_id,
            attempt_id = state.attempt_id,
            path = %final_path.display(),
            "Saved run state"
        );
        Ok(())
    }

    fn get_latest(&self, app_name: &str) -> error::Result<Option<StateFileRef>> {
        Ok(self.list(app_name)?.into_iter().next())
    }

    fn recover(&self, path: &Path) -> error::Result<RunState> {
        if !path.exists() {
            return Err(StateError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn list(&self, app_name: &str) -> error::Result<Vec<StateFileRef>> {
        let dir = self.app_dir(app_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut refs: Vec<StateFileRef> = fs::read_dir(&dir)?
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| Self::parse_file_name(&entry.path()))
            .filter(|r| r.app_name == app_name)
            .collect();
        refs.sort_by(|a, b| {
            (b.run_id, b.attempt_id, b.timestamp_millis).cmp(&(
                a.run_id,
                a.attempt_id,
                a.timestamp_millis,
            ))
        });
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lakerun_types::state::{ActionRunState, ExecutionId};
    use lakerun_types::ActionId;

    fn run_state(app: &str, run_id: u32, attempt_id: u32) -> RunState {
        let mut state = RunState::new(
            app,
            ExecutionId { run_id, attempt_id },
            Utc::now(),
            [ActionId::new("a")],
        );
        state.actions.get_mut(&ActionId::new("a")).unwrap().state = ActionRunState::Succeeded;
        state
    }

    #[test]
    fn save_and_recover_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let state = run_state("app", 1, 1);
        store.save(&state).unwrap();

        let latest = store.get_latest("app").unwrap().expect("state file");
        assert_eq!(latest.run_id, 1);
        assert_eq!(latest.attempt_id, 1);

        let recovered = store.recover(&latest.path).unwrap();
        assert_eq!(recovered, state);
    }

    #[test]
    fn get_latest_empty_for_unknown_app() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.get_latest("nope").unwrap().is_none());
    }

    #[test]
    fn list_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&run_state("app", 1, 1)).unwrap();
        store.save(&run_state("app", 1, 2)).unwrap();
        store.save(&run_state("app", 2, 1)).unwrap();

        let refs = store.list("app").unwrap();
        let ids: Vec<(u32, u32)> = refs.iter().map(|r| (r.run_id, r.attempt_id)).collect();
        assert_eq!(ids, vec![(2, 1), (1, 2), (1, 1)]);
    }

    #[test]
    fn saving_same_attempt_twice_keeps_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&run_state("app", 1, 1)).unwrap();
        store.save(&run_state("app", 1, 1)).unwrap();
        assert_eq!(store.list("app").unwrap().len(), 1);
    }

    #[test]
    fn retention_by_count_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).with_retention(RetentionPolicy {
            max_files: Some(2),
            max_age: None,
        });
        for run in 1..=4 {
            store.save(&run_state("app", run, 1)).unwrap();
        }
        let refs = store.list("app").unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].run_id, 4);
        assert_eq!(refs[1].run_id, 3);
    }

    #[test]
    fn retention_by_age_never_deletes_current() {
        let dir = tempfile::tempdir().unwrap();
        // Everything is "too old" immediately, but the newest must survive.
        let store = FileStateStore::new(dir.path()).with_retention(RetentionPolicy {
            max_files: None,
            max_age: Some(Duration::milliseconds(-1)),
        });
        store.save(&run_state("app", 1, 1)).unwrap();
        store.save(&run_state("app", 2, 1)).unwrap();
        let refs = store.list("app").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].run_id, 2);
    }

    #[test]
    fn recover_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let err = store
            .recover(Path::new("/definitely/not/here.json"))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn apps_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&run_state("app1", 1, 1)).unwrap();
        store.save(&run_state("app2", 5, 1)).unwrap();
        assert_eq!(store.get_latest("app1").unwrap().unwrap().run_id, 1);
        assert_eq!(store.get_latest("app2").unwrap().unwrap().run_id, 5);
    }

    #[test]
    fn file_name_parse_handles_dotted_app_names() {
        let path = Path::new("/state/my.app/my.app.3.2.1700000000000.json");
        let parsed = FileStateStore::parse_file_name(path).unwrap();
        assert_eq!(parsed.app_name, "my.app");
        assert_eq!(parsed.run_id, 3);
        assert_eq!(parsed.attempt_id, 2);
        assert_eq!(parsed.timestamp_millis, 1_700_000_000_000);
    }
}
