//! Wires every [`crate::core::dataset::DatasetManager`] operation into a
//! [`CommandRegistry`] so it can be reached over the local socket or the
//! broker. Grounded on `original_source/erddaputil/main/commands.py`'s
//! `@cmd_and_control.register` decorators, collapsed here into a single
//! registration function since this crate has no macro-based decorator
//! sugar.

use std::sync::Arc;

use serde_json::Value;

use crate::core::command::{Command, CommandResponse};
use crate::core::dataset::DatasetManager;
use crate::core::dataset::state::ReloadFlag;
use crate::core::errors::CoreError;
use crate::core::registry::CommandRegistry;

pub fn register(registry: &CommandRegistry, manager: Arc<DatasetManager>) {
    let m = manager.clone();
    registry.register(
        "reload_dataset",
        Arc::new(move |cmd: &Command| {
            let ids = kwarg_string_list(cmd, "ids")?;
            let flag = kwarg_reload_flag(cmd, "flag")?;
            for id in &ids {
                m.reload_dataset(id, flag);
            }
            if cmd.kwarg_bool("flush", false) {
                m.flush_datasets_now()?;
            }
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    let m = manager.clone();
    registry.register(
        "reload_all_datasets",
        Arc::new(move |cmd: &Command| {
            let flag = kwarg_reload_flag(cmd, "flag")?;
            m.reload_all_datasets(flag)?;
            if cmd.kwarg_bool("flush", false) {
                m.flush_datasets_now()?;
            }
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    let m = manager.clone();
    registry.register(
        "set_active_flag",
        Arc::new(move |cmd: &Command| {
            let ids = kwarg_string_list(cmd, "ids")?;
            let active = cmd.kwarg_bool("active", true);
            for id in &ids {
                m.set_active_flag(id, active)?;
            }
            if cmd.kwarg_bool("flush", false) {
                m.flush_recompilation_now()?;
            }
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    let m = manager.clone();
    registry.register(
        "update_email_block_list",
        Arc::new(move |cmd: &Command| {
            let entries = kwarg_string_list(cmd, "entries")?;
            let add = cmd.kwarg_bool("add", true);
            for entry in &entries {
                m.update_email_block_list(entry, !add)?;
            }
            if cmd.kwarg_bool("flush", false) {
                m.flush_recompilation_now()?;
            }
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    let m = manager.clone();
    registry.register(
        "update_ip_block_list",
        Arc::new(move |cmd: &Command| {
            let entries = kwarg_string_list(cmd, "entries")?;
            let add = cmd.kwarg_bool("add", true);
            for entry in &entries {
                m.update_ip_block_list(entry, !add)?;
            }
            if cmd.kwarg_bool("flush", false) {
                m.flush_recompilation_now()?;
            }
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    let m = manager.clone();
    registry.register(
        "update_allow_unlimited_list",
        Arc::new(move |cmd: &Command| {
            let entries = kwarg_string_list(cmd, "entries")?;
            let add = cmd.kwarg_bool("add", true);
            for entry in &entries {
                m.update_allow_unlimited_list(entry, !add)?;
            }
            if cmd.kwarg_bool("flush", false) {
                m.flush_recompilation_now()?;
            }
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    let m = manager.clone();
    registry.register(
        "list_datasets",
        Arc::new(move |cmd: &Command| Ok(CommandResponse::success(cmd.guid.clone(), m.list_datasets()?))),
    );

    let m = manager.clone();
    registry.register(
        "compile_datasets",
        Arc::new(move |cmd: &Command| {
            let skip_errored = cmd.kwarg_bool("skip_errored", true);
            let reload_all = cmd.kwarg_bool("reload_all", false);
            m.compile_datasets(reload_all, skip_errored);
            if cmd.kwarg_bool("immediate", false) {
                m.flush_recompilation_now()?;
            }
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    let m = manager.clone();
    registry.register(
        "clear_cache",
        Arc::new(move |cmd: &Command| {
            let ids = cmd.kwargs.get("ids").map(deserialize_string_list).transpose()?;
            m.clear_cache(ids.as_deref())?;
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    let m = manager.clone();
    registry.register(
        "flush_logs",
        Arc::new(move |cmd: &Command| {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(m.flush_logs())?;
                Ok::<_, CoreError>(())
            })?;
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );

    registry.register(
        "fix_bpd_permissions",
        Arc::new(move |cmd: &Command| {
            let uid = kwarg_u32(cmd, "uid")?;
            let gid = kwarg_u32(cmd, "gid")?;
            manager.fix_bpd_permissions(uid, gid)?;
            Ok(CommandResponse::ok(cmd.guid.clone()))
        }),
    );
}

fn kwarg_string_list(cmd: &Command, key: &str) -> Result<Vec<String>, CoreError> {
    let value = cmd
        .kwargs
        .get(key)
        .ok_or_else(|| CoreError::validation(format!("'{key}' is required")))?;
    deserialize_string_list(value)
}

fn deserialize_string_list(value: &Value) -> Result<Vec<String>, CoreError> {
    serde_json::from_value(value.clone()).map_err(|_| CoreError::validation("expected an array of strings"))
}

fn kwarg_reload_flag(cmd: &Command, key: &str) -> Result<ReloadFlag, CoreError> {
    match cmd.kwargs.get(key) {
        None => Ok(ReloadFlag::Soft),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "soft" => Ok(ReloadFlag::Soft),
            "bad" => Ok(ReloadFlag::Bad),
            "hard" => Ok(ReloadFlag::Hard),
            other => Err(CoreError::validation(format!("'{other}' is not a valid reload flag"))),
        },
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(ReloadFlag::Soft),
            Some(1) => Ok(ReloadFlag::Bad),
            Some(2) => Ok(ReloadFlag::Hard),
            _ => Err(CoreError::validation("reload flag must be 0, 1, or 2")),
        },
        Some(_) => Err(CoreError::validation("'flag' must be a string or integer")),
    }
}

fn kwarg_u32(cmd: &Command, key: &str) -> Result<u32, CoreError> {
    cmd.kwargs
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .ok_or_else(|| CoreError::validation(format!("'{key}' is required and must be a non-negative integer")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::DatasetManagerSettings;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn manager(dir: &std::path::Path) -> Arc<DatasetManager> {
        Arc::new(DatasetManager::new(
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
            },
            dir.join("email_block_list.txt"),
            dir.join("ip_block_list.txt"),
            dir.join("unlimited_allow_list.txt"),
        ))
    }

    #[test]
    fn reload_dataset_accepts_ids_and_flag_kwargs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CommandRegistry::new();
        register(&registry, manager(dir.path()));

        let mut kwargs = BTreeMap::new();
        kwargs.insert("ids".to_string(), serde_json::json!(["a", "b"]));
        kwargs.insert("flag".to_string(), serde_json::json!("hard"));
        let cmd = Command::new("reload_dataset").with_kwargs(kwargs);
        let resp = registry.route(&cmd);
        assert!(resp.is_success());
    }

    #[test]
    fn reload_dataset_without_ids_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CommandRegistry::new();
        register(&registry, manager(dir.path()));

        let resp = registry.route(&Command::new("reload_dataset"));
        assert!(!resp.is_success());
        assert_eq!(resp.message["kind"], "validation_error");
    }

    #[test]
    fn list_datasets_returns_empty_when_no_master_document() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CommandRegistry::new();
        register(&registry, manager(dir.path()));

        let resp = registry.route(&Command::new("list_datasets"));
        assert!(resp.is_success());
        assert_eq!(resp.message, serde_json::json!([]));
    }
}
