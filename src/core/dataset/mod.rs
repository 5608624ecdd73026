//! The dataset manager: the 45%-of-budget core of the daemon. Owns the
//! three ACL flat files, the coalescing reload/recompile schedulers, and
//! the master XML document rebuild pipeline.
//!
//! Grounded throughout on
//! `original_source/erddaputil/erddap/datasets.py::ErddapDatasetManager`.

pub mod acl;
pub mod ip;
pub mod state;
pub mod xml;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use url::Url;

use crate::core::errors::CoreError;
use acl::AclFile;
use state::{DatasetReloadEntry, RecompileRequest, ReloadFlag};
use xml::XmlElement;

/// Filesystem and timing knobs the dataset manager is configured with.
/// Built from the daemon's [`crate::config::Config`] at startup.
pub struct DatasetManagerSettings {
    pub big_parent_directory: PathBuf,
    pub datasets_template: Option<PathBuf>,
    pub datasets_d: Option<PathBuf>,
    pub datasets_xml: PathBuf,
    pub backups_dir: PathBuf,
    pub erddap_base_url: Option<Url>,
    /// Maximum number of datasets that may sit in the reload queue before
    /// the oldest excess entries are force-drained, regardless of
    /// `max_delay`.
    pub max_pending: usize,
    pub max_delay: Duration,
    pub max_recompile_delay: Duration,
    pub skip_misconfigured_datasets: bool,
    pub backup_retention_days: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub dataset_id: String,
    pub dataset_type: Option<String>,
    pub active: bool,
}

struct ManagerState {
    reload_queue: HashMap<String, DatasetReloadEntry>,
    recompile_request: Option<RecompileRequest>,
    /// Structural hash of each dataset's merged fragment, from the last
    /// successful recompilation — used to decide which datasets actually
    /// changed and therefore need a forced reload.
    last_hashes: HashMap<String, String>,
}

pub struct DatasetManager {
    settings: DatasetManagerSettings,
    pub email_block_list: AclFile,
    pub ip_block_list: AclFile,
    pub unlimited_allow_list: AclFile,
    state: Mutex<ManagerState>,
    http: reqwest::Client,
}

impl DatasetManager {
    pub fn new(
        settings: DatasetManagerSettings,
        email_block_list_path: PathBuf,
        ip_block_list_path: PathBuf,
        unlimited_allow_list_path: PathBuf,
    ) -> Self {
        Self {
            settings,
            email_block_list: AclFile::new(email_block_list_path, ip::validate_email),
            ip_block_list: AclFile::new(ip_block_list_path, ip::validate_ip_entry),
            unlimited_allow_list: AclFile::new(unlimited_allow_list_path, ip::validate_ip_entry),
            state: Mutex::new(ManagerState {
                reload_queue: HashMap::new(),
                recompile_request: None,
                last_hashes: HashMap::new(),
            }),
            http: reqwest::Client::new(),
        }
    }

    // ---- reload scheduling -------------------------------------------------

    /// Queues a reload for `dataset_id` at severity `flag`. Coalesced: a
    /// dataset already queued has its flag upgraded (never downgraded) and
    /// its debounce timer reset, per [`DatasetReloadEntry::merge`].
    pub fn reload_dataset(&self, dataset_id: &str, flag: ReloadFlag) {
        if dataset_id.trim().is_empty() {
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        state
            .reload_queue
            .entry(dataset_id.to_string())
            .and_modify(|e| e.merge(flag, now))
            .or_insert_with(|| DatasetReloadEntry::new(flag, now));
    }

    /// Queues a reload at `flag` severity for every active dataset
    /// currently known to the master document.
    pub fn reload_all_datasets(&self, flag: ReloadFlag) -> Result<(), CoreError> {
        for id in self.list_datasets()?.into_iter().filter(|d| d.active).map(|d| d.dataset_id) {
            self.reload_dataset(&id, flag);
        }
        Ok(())
    }

    /// Queues a recompilation. `skip_errored` only ever relaxes toward
    /// `false` and `reload_all` only ever tightens toward `true` across
    /// coalesced requests (see [`RecompileRequest::merge`]).
    pub fn compile_datasets(&self, reload_all: bool, skip_errored: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match &mut state.recompile_request {
            Some(req) => req.merge(skip_errored, reload_all, now),
            None => state.recompile_request = Some(RecompileRequest::new(skip_errored, reload_all, now)),
        }
    }

    /// The periodic tick: drains whatever recompile request and reload
    /// entries are due. Called by the supervisor's ticker worker.
    pub fn flush(&self) -> Result<(), CoreError> {
        self.flush_recompilation(false)?;
        self.flush_datasets(false)?;
        Ok(())
    }

    /// Drains every pending reload entry immediately, regardless of its own
    /// debounce timer. Used by command handlers whose caller asked for
    /// `flush=true`.
    pub fn flush_datasets_now(&self) -> Result<(), CoreError> {
        self.flush_datasets(true)
    }

    /// Runs the outstanding recompile request immediately, if any. Used by
    /// command handlers whose caller asked for `flush=true`/`immediate=true`.
    pub fn flush_recompilation_now(&self) -> Result<(), CoreError> {
        self.flush_recompilation(true)
    }

    fn flush_recompilation(&self, force: bool) -> Result<(), CoreError> {
        let due = {
            let state = self.state.lock();
            match &state.recompile_request {
                None => None,
                Some(req) => {
                    if force || req.is_due(Instant::now(), self.settings.max_recompile_delay) {
                        Some((req.skip_errored, req.reload_all))
                    } else {
                        None
                    }
                }
            }
        };
        if let Some((skip_errored, reload_all)) = due {
            self.do_recompilation(reload_all, skip_errored)?;
            self.state.lock().recompile_request = None;
        }
        Ok(())
    }

    /// Drains every reload entry that is due: `force` drains everything
    /// unconditionally; otherwise an entry is due once its own quiet
    /// period (`max_delay`) elapses, *or* once the queue holds more than
    /// `max_pending` entries, in which case the oldest entries (by
    /// `enqueued_at`, ascending) beyond that count are drained regardless
    /// of their own timer.
    fn flush_datasets(&self, force: bool) -> Result<(), CoreError> {
        let due_ids: Vec<(String, ReloadFlag)> = {
            let state = self.state.lock();
            let now = Instant::now();
            let mut ordered: Vec<(&String, &DatasetReloadEntry)> = state.reload_queue.iter().collect();
            ordered.sort_by_key(|(_, e)| e.last_queued_at);

            let excess = ordered.len().saturating_sub(self.settings.max_pending);
            ordered
                .into_iter()
                .enumerate()
                .filter(|(idx, (_, e))| force || *idx < excess || e.is_due(now, self.settings.max_delay))
                .map(|(_, (id, e))| (id.clone(), e.flag))
                .collect()
        };
        // A drain failure (e.g. the flag directory is unwritable) is
        // logged and counted but never re-queues the entry: leaving it in
        // place would retry the same failing write forever.
        for (id, flag) in &due_ids {
            if let Err(e) = self.write_reload_flag(id, *flag) {
                tracing::warn!(dataset_id = %id, error = %e, "failed to write reload flag file");
            }
        }
        if !due_ids.is_empty() {
            let mut state = self.state.lock();
            for (id, _) in &due_ids {
                state.reload_queue.remove(id);
            }
        }
        Ok(())
    }

    /// Writes the trigger file for `dataset_id` at the severity directory
    /// `flag` maps to. If the file already exists, the data server hasn't
    /// yet consumed the previous signal and the drain is a no-op — it must
    /// not overwrite (and thereby lose) that still-pending signal.
    fn write_reload_flag(&self, dataset_id: &str, flag: ReloadFlag) -> Result<(), CoreError> {
        let dir_name = match flag {
            ReloadFlag::Soft => "flag",
            ReloadFlag::Bad => "badFilesFlag",
            ReloadFlag::Hard => "hardFlag",
        };
        let dir = self.settings.big_parent_directory.join(dir_name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(dataset_id);
        if path.exists() {
            return Ok(());
        }
        std::fs::write(path, b"1")?;
        Ok(())
    }

    // ---- recompilation pipeline --------------------------------------------

    /// The nine-step rebuild: parse the template, merge in the dataset
    /// fragments, recompile the block/allow-list elements, diff against
    /// the last known hash per dataset, back up the existing master
    /// document, write the new one, force-reload whatever changed, flush
    /// the reload queue, and prune stale backups.
    fn do_recompilation(&self, reload_all: bool, skip_errored: bool) -> Result<(), CoreError> {
        let mut root = self.load_template()?;
        self.merge_fragments(&mut root, skip_errored)?;
        self.compile_block_allow_lists(&mut root)?;

        let new_hashes = hash_all_datasets(&root);
        let prior_hashes = self.state.lock().last_hashes.clone();

        // Per §4.3.2 step 7: a dataset present both before and after is
        // hard-reloaded if its digest changed, or bad-files-reloaded if
        // `reload_all` was requested even though nothing changed. A
        // dataset that's new in this recompilation gets no reload of its
        // own; if nothing else was queued, one prior dataset is soft
        // reloaded so the data server notices the master document changed.
        let mut to_reload: Vec<(String, ReloadFlag)> = Vec::new();
        for (id, hash) in &new_hashes {
            if let Some(old_hash) = prior_hashes.get(id) {
                if old_hash != hash {
                    to_reload.push((id.clone(), ReloadFlag::Hard));
                } else if reload_all {
                    to_reload.push((id.clone(), ReloadFlag::Bad));
                }
            }
        }
        let new_dataset_appeared = new_hashes.keys().any(|id| !prior_hashes.contains_key(id));
        if new_dataset_appeared && to_reload.is_empty() {
            if let Some(prior_id) = prior_hashes.keys().next() {
                to_reload.push((prior_id.clone(), ReloadFlag::Soft));
            }
        }

        self.backup_existing_document()?;
        let serialized = xml::write_document(&root);
        std::fs::write(&self.settings.datasets_xml, serialized)?;

        {
            let mut state = self.state.lock();
            state.last_hashes = new_hashes;
        }

        for (id, flag) in &to_reload {
            self.reload_dataset(id, *flag);
        }
        self.flush_datasets(true)?;
        self.cleanup_backup_files()?;
        Ok(())
    }

    fn load_template(&self) -> Result<XmlElement, CoreError> {
        match &self.settings.datasets_template {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                xml::parse_document(&contents)
            }
            None => Ok(XmlElement::new("erddapDatasets")),
        }
    }

    /// Merges every fragment file in `datasets_d` into `root`, keyed by
    /// `datasetID`: a fragment replaces a template dataset with the same
    /// id, or is appended if new. Malformed fragments are skipped (and
    /// logged) when `skip_errored` is set; otherwise the first parse
    /// failure aborts the whole recompilation.
    fn merge_fragments(&self, root: &mut XmlElement, skip_errored: bool) -> Result<(), CoreError> {
        let Some(dir) = &self.settings.datasets_d else {
            return Ok(());
        };
        if !dir.is_dir() {
            return Ok(());
        }

        let mut fragment_paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("xml"))
            .collect();
        fragment_paths.sort();

        let mut by_id: BTreeMap<String, XmlElement> = BTreeMap::new();
        for elem in root.children_named("dataset") {
            if let Some(id) = elem.attr("datasetID") {
                by_id.insert(id.to_string(), elem.clone());
            }
        }

        for path in fragment_paths {
            let contents = std::fs::read_to_string(&path)?;
            match xml::parse_document(&contents) {
                Ok(fragment) => {
                    let datasets: Vec<XmlElement> = if fragment.tag == "dataset" {
                        vec![fragment]
                    } else {
                        fragment.children_named("dataset").cloned().collect()
                    };
                    for dataset in datasets {
                        if let Some(id) = dataset.attr("datasetID") {
                            by_id.insert(id.to_string(), dataset);
                        }
                    }
                }
                Err(e) => {
                    if skip_errored {
                        tracing::warn!(path = %path.display(), error = %e, "skipping misconfigured dataset fragment");
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        root.children.retain(|c| c.tag != "dataset");
        for elem in by_id.into_values() {
            root.children.push(elem);
        }
        Ok(())
    }

    /// Rewrites `<ipAddressUnlimited>`, `<subscriptionEmailBlacklist>`, and
    /// `<requestBlacklist>` with the union of the template's own text and
    /// the corresponding ACL file's (expanded) entries.
    fn compile_block_allow_lists(&self, root: &mut XmlElement) -> Result<(), CoreError> {
        let unlimited = ip::expand_ip_addresses(
            &self.unlimited_allow_list.read_all()?.into_iter().collect::<Vec<_>>(),
            false,
        )?;
        self.set_list_element(root, "ipAddressUnlimited", &unlimited);

        let emails: Vec<String> = self.email_block_list.read_all()?.into_iter().collect();
        self.set_list_element(root, "subscriptionEmailBlacklist", &emails);

        let ips = ip::expand_ip_addresses(&self.ip_block_list.read_all()?.into_iter().collect::<Vec<_>>(), true)?;
        self.set_list_element(root, "requestBlacklist", &ips);

        Ok(())
    }

    fn set_list_element(&self, root: &mut XmlElement, tag: &str, from_file: &[String]) {
        let existing: BTreeSet<String> = root
            .children_named(tag)
            .next()
            .and_then(|e| e.text.clone())
            .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let merged: BTreeSet<String> = existing.into_iter().chain(from_file.iter().cloned()).collect();
        let text = merged.into_iter().collect::<Vec<_>>().join(",");

        root.children.retain(|c| c.tag != tag);
        let mut elem = XmlElement::new(tag);
        elem.text = Some(text);
        root.children.push(elem);
    }

    /// Copies the current master document into the backup directory under
    /// a timestamped name, before the new one is written. Disambiguated by
    /// a trailing counter so two recompilations within the same second
    /// never collide.
    fn backup_existing_document(&self) -> Result<(), CoreError> {
        if !self.settings.datasets_xml.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.settings.backups_dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        for counter in 0.. {
            let filename = format!("datasets.xml.{stamp}.{counter}.bak");
            let dest = self.settings.backups_dir.join(&filename);
            if dest.exists() {
                continue;
            }
            std::fs::copy(&self.settings.datasets_xml, dest)?;
            return Ok(());
        }
        unreachable!()
    }

    fn cleanup_backup_files(&self) -> Result<(), CoreError> {
        if !self.settings.backups_dir.is_dir() {
            return Ok(());
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(self.settings.backup_retention_days) * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for entry in std::fs::read_dir(&self.settings.backups_dir)? {
            let entry = entry?;
            let modified = entry.metadata().and_then(|m| m.modified()).unwrap_or(SystemTime::now());
            if modified < cutoff {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    // ---- ACL passthroughs ---------------------------------------------------

    /// Adds or removes an entry from one of the three ACL files, queuing a
    /// recompilation only if the file's contents actually changed.
    pub fn update_email_block_list(&self, value: &str, remove: bool) -> Result<(), CoreError> {
        if self.email_block_list.append_or_remove(value, remove)? {
            self.compile_datasets(false, true);
        }
        Ok(())
    }

    pub fn update_ip_block_list(&self, value: &str, remove: bool) -> Result<(), CoreError> {
        if self.ip_block_list.append_or_remove(value, remove)? {
            self.compile_datasets(false, true);
        }
        Ok(())
    }

    pub fn update_allow_unlimited_list(&self, value: &str, remove: bool) -> Result<(), CoreError> {
        if self.unlimited_allow_list.append_or_remove(value, remove)? {
            self.compile_datasets(false, true);
        }
        Ok(())
    }

    // ---- dataset directory operations ---------------------------------------

    pub fn list_datasets(&self) -> Result<Vec<DatasetSummary>, CoreError> {
        if !self.settings.datasets_xml.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.settings.datasets_xml)?;
        let root = xml::parse_document(&contents)?;
        Ok(root
            .children_named("dataset")
            .filter_map(|d| {
                d.attr("datasetID").map(|id| DatasetSummary {
                    dataset_id: id.to_string(),
                    dataset_type: d.attr("type").map(str::to_string),
                    active: d.attr("active").is_none_or(|v| v != "false"),
                })
            })
            .collect())
    }

    /// Flips a dataset's `active` attribute in its source fragment file.
    /// Stops at the first fragment whose `datasetID` matches (mirrors the
    /// original's `break` after `_try_setting_active_flag` returns `1`,
    /// `datasets.py:141-144`): a no-op if that dataset's `active` attribute
    /// already equals `active` (`_try_setting_active_flag`'s `return 2`),
    /// and a `ValidationError` if no fragment names this dataset at all
    /// (spec line 70's "failure if not found"). Only an actual change
    /// queues a soft reload and a recompilation.
    pub fn set_active_flag(&self, dataset_id: &str, active: bool) -> Result<bool, CoreError> {
        let Some(dir) = &self.settings.datasets_d else {
            return Err(CoreError::config("no datasets.d directory is configured"));
        };
        let mut found = false;
        let mut changed = false;
        'files: for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let Ok(mut fragment) = xml::parse_document(&contents) else {
                continue;
            };
            let matched: Option<&mut XmlElement> = if fragment.tag == "dataset" {
                (fragment.attr("datasetID") == Some(dataset_id)).then_some(&mut fragment)
            } else {
                fragment.children.iter_mut().find(|c| c.tag == "dataset" && c.attr("datasetID") == Some(dataset_id))
            };
            let Some(dataset) = matched else {
                continue;
            };
            found = true;
            let currently_active = dataset.attr("active").is_none_or(|v| v != "false");
            if currently_active != active {
                set_attr(dataset, "active", if active { "true" } else { "false" });
                changed = true;
            }
            // `dataset`'s mutable borrow of `fragment` ends at its last use
            // above, so `fragment` can be read again here to serialize it.
            if changed {
                std::fs::write(&path, xml::write_document(&fragment))?;
            }
            break 'files;
        }
        if !found {
            return Err(CoreError::validation(format!("no fragment defines dataset '{dataset_id}'")));
        }
        if changed {
            self.reload_dataset(dataset_id, ReloadFlag::Soft);
            self.compile_datasets(false, true);
        }
        Ok(changed)
    }

    /// Recursively unlinks every non-symlink file under the decompressed
    /// cache. With no `ids`, clears `<bpd>/decompressed` in its entirety;
    /// with `ids`, restricts the walk to each id's own subtree
    /// (`<bpd>/decompressed/<last two chars of id>/<id>`).
    pub fn clear_cache(&self, ids: Option<&[String]>) -> Result<(), CoreError> {
        let decompressed = self.settings.big_parent_directory.join("decompressed");
        match ids {
            None => self.clear_cache_root(&decompressed),
            Some(ids) => {
                for id in ids {
                    let id = id.trim();
                    if id.is_empty() {
                        continue;
                    }
                    let suffix = last_two_chars(id);
                    self.clear_cache_root(&decompressed.join(suffix).join(id))?;
                }
                Ok(())
            }
        }
    }

    /// Walks `root` with an explicit stack rather than recursion so a
    /// deeply nested cache can't blow the stack, and never follows
    /// symlinks — including at `root` itself — so a cache directory that
    /// is itself a symlink is left untouched rather than deleted through.
    fn clear_cache_root(&self, root: &Path) -> Result<(), CoreError> {
        if !root.exists() {
            return Ok(());
        }
        if root.symlink_metadata()?.file_type().is_symlink() {
            return Err(CoreError::validation("refusing to clear a symlinked cache directory"));
        }

        let mut stack = vec![root.to_path_buf()];
        let mut dirs_to_remove = Vec::new();
        while let Some(dir) = stack.pop() {
            dirs_to_remove.push(dir.clone());
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        for dir in dirs_to_remove.into_iter().rev() {
            let _ = std::fs::remove_dir(dir);
        }
        Ok(())
    }

    // ---- data-server passthroughs --------------------------------------------

    /// Forces the data server to flush its log buffers by requesting its
    /// status page. Requires `erddap_base_url` to be configured.
    pub async fn flush_logs(&self) -> Result<(), CoreError> {
        let base = self
            .settings
            .erddap_base_url
            .as_ref()
            .ok_or_else(|| CoreError::config("erddap_base_url is not configured"))?;
        let status_url = base
            .join("status.html")
            .map_err(|e| CoreError::config(format!("invalid erddap_base_url: {e}")))?;
        self.http.get(status_url).send().await?.error_for_status()?;
        Ok(())
    }

    /// Recursively `chown`s the big parent directory. A Unix-only
    /// maintenance operation; a no-op error on other targets rather than a
    /// silent skip, mirroring the original's `hasattr(os, 'chown')` guard.
    #[cfg(unix)]
    pub fn fix_bpd_permissions(&self, uid: u32, gid: u32) -> Result<(), CoreError> {
        chown_recursive(&self.settings.big_parent_directory, uid, gid)
    }

    #[cfg(not(unix))]
    pub fn fix_bpd_permissions(&self, _uid: u32, _gid: u32) -> Result<(), CoreError> {
        Err(CoreError::config("fix_bpd_permissions is only supported on Unix targets"))
    }
}

#[cfg(unix)]
fn chown_recursive(path: &Path, uid: u32, gid: u32) -> Result<(), CoreError> {
    use std::os::unix::fs::chown;
    chown(path, Some(uid), Some(gid))?;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            chown_recursive(&entry.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// The last two characters of a dataset id, used as the cache tree's
/// sharding directory (`<bpd>/decompressed/<shard>/<id>`). Ids shorter than
/// two characters use the whole id as their own shard.
fn last_two_chars(id: &str) -> &str {
    let take = id.char_indices().rev().nth(1).map(|(i, _)| i).unwrap_or(0);
    &id[take..]
}

fn set_attr(elem: &mut XmlElement, key: &str, value: &str) {
    if let Some(existing) = elem.attrs.iter_mut().find(|(k, _)| k == key) {
        existing.1 = value.to_string();
    } else {
        elem.attrs.push((key.to_string(), value.to_string()));
    }
}

fn hash_all_datasets(root: &XmlElement) -> HashMap<String, String> {
    root.children_named("dataset")
        .filter_map(|d| d.attr("datasetID").map(|id| (id.to_string(), hash_xml_element(d))))
        .collect()
}

/// A stable, order-independent structural digest of an XML element: every
/// text-bearing descendant contributes a `path[text]==value` line and
/// every non-`name` attribute contributes a `path[attr==value]` line, the
/// lines are sorted, and the whole thing is SHA-1 hashed. Two documents
/// that differ only in child ordering hash identically; any change to
/// text or attribute content changes the digest.
///
/// Grounded on `original_source/erddaputil/erddap/datasets.py::_hash_xml_element`.
pub fn hash_xml_element(root: &XmlElement) -> String {
    let mut lines = Vec::new();
    collect_hash_lines(root, "", &mut lines);
    lines.sort();
    let mut hasher = Sha1::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn collect_hash_lines(elem: &XmlElement, path: &str, lines: &mut Vec<String>) {
    let own_path = match elem.attr("name") {
        Some(name) => format!("{path}/{}[name={name}]", elem.tag),
        None => format!("{path}/{}", elem.tag),
    };

    if let Some(text) = elem.text.as_ref().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        lines.push(format!("{own_path}[text]=={text}"));
    }
    for (key, value) in &elem.attrs {
        if key == "name" {
            continue;
        }
        lines.push(format!("{own_path}[{key}=={value}]"));
    }
    for child in &elem.children {
        collect_hash_lines(child, &own_path, lines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path) -> DatasetManagerSettings {
        DatasetManagerSettings {
            big_parent_directory: dir.to_path_buf(),
            datasets_template: None,
            datasets_d: Some(dir.join("datasets.d")),
            datasets_xml: dir.join("datasets.xml"),
            backups_dir: dir.join("backups"),
            erddap_base_url: None,
            max_pending: 99,
            max_delay: Duration::from_secs(30),
            max_recompile_delay: Duration::from_secs(30),
            skip_misconfigured_datasets: true,
            backup_retention_days: 31,
        }
    }

    fn manager(dir: &Path) -> DatasetManager {
        DatasetManager::new(
            settings(dir),
            dir.join("email_block_list.txt"),
            dir.join("ip_block_list.txt"),
            dir.join("unlimited_allow_list.txt"),
        )
    }

    #[test]
    fn hash_is_order_independent() {
        let mut a = XmlElement::new("dataset");
        a.attrs.push(("datasetID".into(), "x".into()));
        let mut child1 = XmlElement::new("title");
        child1.text = Some("one".into());
        let mut child2 = XmlElement::new("subtitle");
        child2.text = Some("two".into());
        a.children = vec![child1.clone(), child2.clone()];

        let mut b = a.clone();
        b.children = vec![child2, child1];

        assert_eq!(hash_xml_element(&a), hash_xml_element(&b));
    }

    #[test]
    fn hash_changes_when_text_changes() {
        let mut a = XmlElement::new("dataset");
        a.text = Some("one".into());
        let mut b = a.clone();
        b.text = Some("two".into());
        assert_ne!(hash_xml_element(&a), hash_xml_element(&b));
    }

    #[test]
    fn recompilation_merges_fragments_and_writes_master_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("datasets.d")).unwrap();
        std::fs::write(
            dir.path().join("datasets.d/abc.xml"),
            r#"<dataset type="EDDTableFromAsciiFiles" datasetID="abc"><reloadEveryNMinutes>10</reloadEveryNMinutes></dataset>"#,
        )
        .unwrap();

        let mgr = manager(dir.path());
        mgr.do_recompilation(false, true).unwrap();

        let written = std::fs::read_to_string(dir.path().join("datasets.xml")).unwrap();
        assert!(written.contains("datasetID=\"abc\""));

        let datasets = mgr.list_datasets().unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].dataset_id, "abc");
    }

    #[test]
    fn recompilation_queues_a_hard_reload_for_changed_datasets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("datasets.d")).unwrap();
        std::fs::write(
            dir.path().join("datasets.d/abc.xml"),
            r#"<dataset type="EDDTableFromAsciiFiles" datasetID="abc"><reloadEveryNMinutes>10</reloadEveryNMinutes></dataset>"#,
        )
        .unwrap();

        let mgr = manager(dir.path());
        mgr.do_recompilation(false, true).unwrap();
        assert!(mgr.state.lock().reload_queue.is_empty(), "flush_datasets(true) should have drained the queue already");

        // Change the fragment's text content: the digest must change and
        // the next recompilation should trigger a hard reload flag file.
        std::fs::write(
            dir.path().join("datasets.d/abc.xml"),
            r#"<dataset type="EDDTableFromAsciiFiles" datasetID="abc"><reloadEveryNMinutes>20</reloadEveryNMinutes></dataset>"#,
        )
        .unwrap();
        mgr.do_recompilation(false, true).unwrap();
        assert!(dir.path().join("hardFlag/abc").exists());
    }

    #[test]
    fn recompilation_soft_reloads_a_prior_dataset_when_a_new_one_appears() {
        // Mirrors the end-to-end scenario where a template dataset `T` is
        // untouched but a brand-new fragment `X` appears: no digest
        // changed, so the only reload queued is a soft one for `T`, to
        // make the data server notice the master document changed at all.
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("template.xml");
        std::fs::write(
            &template_path,
            r#"<erddapDatasets><dataset type="EDDTableFromAsciiFiles" datasetID="T"></dataset></erddapDatasets>"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("datasets.d")).unwrap();

        let mut settings = settings(dir.path());
        settings.datasets_template = Some(template_path);
        let mgr = DatasetManager::new(
            settings,
            dir.path().join("email_block_list.txt"),
            dir.path().join("ip_block_list.txt"),
            dir.path().join("unlimited_allow_list.txt"),
        );

        // First compile: `T` is new relative to an empty hash map, so it
        // gets hard-reloaded and its digest recorded.
        mgr.do_recompilation(false, true).unwrap();
        assert!(dir.path().join("hardFlag/T").exists());
        std::fs::remove_file(dir.path().join("hardFlag/T")).unwrap();

        std::fs::write(
            dir.path().join("datasets.d/x.xml"),
            r#"<dataset type="EDDTableFromAsciiFiles" datasetID="X"></dataset>"#,
        )
        .unwrap();
        mgr.do_recompilation(false, true).unwrap();

        assert!(dir.path().join("flag/T").exists(), "T should get a soft reload since nothing else changed");
        assert!(!dir.path().join("hardFlag/X").exists(), "the new dataset itself is not reloaded");

        let datasets = mgr.list_datasets().unwrap();
        assert_eq!(datasets.len(), 2);
    }

    #[test]
    fn update_ip_block_list_triggers_recompilation_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.update_ip_block_list("203.0.113.5", false).unwrap();
        assert!(mgr.state.lock().recompile_request.is_some());

        mgr.state.lock().recompile_request = None;
        mgr.update_ip_block_list("203.0.113.5", false).unwrap();
        assert!(mgr.state.lock().recompile_request.is_none(), "re-adding the same entry should not requeue");
    }

    #[test]
    fn clear_cache_refuses_to_walk_through_a_symlinked_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real_cache");
        std::fs::create_dir_all(&real).unwrap();
        std::fs::create_dir_all(dir.path().join("decompressed/s1")).unwrap();
        let link = dir.path().join("decompressed/s1/ds1");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real, &link).unwrap();

        #[cfg(unix)]
        {
            let mgr = manager(dir.path());
            assert!(mgr.clear_cache(Some(&["ds1".to_string()])).is_err());
            assert!(real.exists());
        }
    }

    #[test]
    fn clear_cache_with_no_ids_clears_the_whole_decompressed_tree() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("decompressed/s1/ds1/sub");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("cached.nc"), b"data").unwrap();

        let mgr = manager(dir.path());
        mgr.clear_cache(None).unwrap();
        assert!(!dir.path().join("decompressed/s1/ds1/sub/cached.nc").exists());
    }

    #[test]
    fn clear_cache_with_ids_restricts_to_that_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let ds1 = dir.path().join("decompressed/s1/ds1");
        let ds2 = dir.path().join("decompressed/s2/ds2");
        std::fs::create_dir_all(&ds1).unwrap();
        std::fs::create_dir_all(&ds2).unwrap();
        std::fs::write(ds1.join("a.nc"), b"data").unwrap();
        std::fs::write(ds2.join("b.nc"), b"data").unwrap();

        let mgr = manager(dir.path());
        mgr.clear_cache(Some(&["ds1".to_string()])).unwrap();
        assert!(!ds1.join("a.nc").exists());
        assert!(ds2.join("b.nc").exists());
    }
}
