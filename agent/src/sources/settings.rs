/// Desktop settings watcher (dconf `Notify` signals).
///
/// Fixed-path schemas are looked up directly; relocatable ones go through the
/// [`SchemaResolver`]. LibreOffice keeps its registry in dconf without any
/// schema, so its paths are read raw and reported under their own namespace.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use crate::bus_monitor::{BusKind, BusLine, BusMonitor, Notify};
use crate::event::{ChangeEvent, ChangeSink, Namespace};
use crate::gvariant;
use crate::schema::{RelocatableSchema, SchemaCatalog, SchemaResolver};
use crate::sources::{command_output, SourceContext, RESPAWN_DELAY};
use crate::status::SourceState;

pub const DCONF_BUS_NAME: &str = "ca.desrt.dconf";
pub const DCONF_OBJECT_PATH: &str = "/ca/desrt/dconf/Writer/user";
const NOTIFY_MEMBER: &str = "ca.desrt.dconf.Writer.Notify";
pub const LIBREOFFICE_PREFIX: &str = "/org/libreoffice/registry";

/// A setting's current value in GVariant text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingValue {
    pub value: String,
    pub signature: String,
}

/// Read access to installed schemas and stored values.
pub trait SettingsBackend: Send {
    fn catalog(&self) -> Result<SchemaCatalog>;
    /// Value of `key` in `schema`, mounted at `path` for relocatable schemas.
    fn read_setting(&self, schema: &str, path: Option<&str>, key: &str) -> Result<SettingValue>;
    /// Raw dconf value at a full key path.
    fn read_raw(&self, key_path: &str) -> Result<SettingValue>;
}

/// Backend driving the `gsettings` and `dconf` command-line tools.
pub struct GsettingsCli;

impl GsettingsCli {
    fn schema_arg(schema: &str, path: Option<&str>) -> String {
        match path {
            Some(path) => format!("{schema}:{path}"),
            None => schema.to_string(),
        }
    }
}

impl SettingsBackend for GsettingsCli {
    fn catalog(&self) -> Result<SchemaCatalog> {
        let fixed = parse_schema_paths(&command_output(
            "gsettings",
            &["list-schemas", "--print-paths"],
        )?);
        let ids = command_output("gsettings", &["list-relocatable-schemas"])?;
        let mut relocatable = Vec::new();
        for id in ids.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // Any valid path works for listing the keys of a relocatable schema.
            match command_output("gsettings", &["list-keys", &format!("{id}:/")]) {
                Ok(keys) => relocatable.push(RelocatableSchema::new(
                    id,
                    keys.lines().map(str::trim).filter(|k| !k.is_empty()),
                )),
                Err(e) => tracing::debug!("skipping schema {id}: {e:#}"),
            }
        }
        tracing::debug!(
            fixed = fixed.len(),
            relocatable = relocatable.len(),
            "schema catalog loaded"
        );
        Ok(SchemaCatalog { fixed, relocatable })
    }

    fn read_setting(&self, schema: &str, path: Option<&str>, key: &str) -> Result<SettingValue> {
        let target = Self::schema_arg(schema, path);
        let value = command_output("gsettings", &["get", &target, key])?;
        let range = command_output("gsettings", &["range", &target, key])?;
        let value = value.trim().to_string();
        let signature = gvariant::range_signature(&range)
            .or_else(|| gvariant::infer_signature(&value))
            .with_context(|| format!("Unknown type for {target} {key}"))?;
        Ok(SettingValue { value, signature })
    }

    fn read_raw(&self, key_path: &str) -> Result<SettingValue> {
        let value = command_output("dconf", &["read", key_path])?.trim().to_string();
        let signature = gvariant::infer_signature(&value)
            .with_context(|| format!("Could not parse dconf value of {key_path}: {value}"))?;
        Ok(SettingValue { value, signature })
    }
}

/// `gsettings list-schemas --print-paths` output → path to schema id.
pub fn parse_schema_paths(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (id, path) = line.trim().split_once(' ')?;
            Some((path.trim().to_string(), id.to_string()))
        })
        .collect()
}

pub struct SettingsWatcher<B> {
    backend: B,
    resolver: SchemaResolver,
    sink: Arc<dyn ChangeSink>,
}

impl<B: SettingsBackend> SettingsWatcher<B> {
    pub fn new(backend: B, sink: Arc<dyn ChangeSink>) -> Result<Self> {
        let catalog = backend.catalog().context("Failed to load schema catalog")?;
        Ok(Self {
            backend,
            resolver: SchemaResolver::new(catalog),
            sink,
        })
    }

    /// Handles one `Notify` signal. Returns the number of changes emitted.
    pub fn handle_notify(&mut self, notify: &Notify) -> usize {
        tracing::debug!(path = %notify.path, keys = ?notify.keys, "dconf notify");
        if notify.path.starts_with(LIBREOFFICE_PREFIX) {
            return self.office_change(&notify.path, &notify.keys);
        }

        if let Some(schema) = self.resolver.fixed_schema(&notify.path) {
            let schema = schema.to_string();
            return self.settings_change(&schema, None, &notify.path, &notify.keys);
        }

        match self.resolver.resolve(&notify.path, &notify.keys) {
            Some(schema) => self.settings_change(&schema, Some(&notify.path), &notify.path, &notify.keys),
            None => {
                tracing::debug!(path = %notify.path, "schema unresolved, change dropped");
                0
            }
        }
    }

    fn settings_change(&self, schema: &str, mount: Option<&str>, path: &str, keys: &[String]) -> usize {
        let mut emitted = 0;
        for key in keys {
            let setting = match self.backend.read_setting(schema, mount, key) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("failed to read {schema} {key}: {e:#}");
                    continue;
                }
            };
            let payload = json!({
                "key": format!("{path}{key}"),
                "schema": schema,
                "value": setting.value,
                "signature": setting.signature,
            });
            self.sink
                .submit(ChangeEvent::new(Namespace::DesktopSettings, payload.to_string()));
            emitted += 1;
        }
        emitted
    }

    fn office_change(&self, path: &str, keys: &[String]) -> usize {
        let mut emitted = 0;
        for key in keys {
            let key_path = format!("{path}{key}");
            let setting = match self.backend.read_raw(&key_path) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("failed to read office setting {key_path}: {e:#}");
                    return emitted;
                }
            };
            let payload = json!({
                "key": key_path,
                "value": setting.value,
                "signature": setting.signature,
            });
            self.sink
                .submit(ChangeEvent::new(Namespace::OfficeSettings, payload.to_string()));
            emitted += 1;
        }
        emitted
    }
}

/// Creates the marker file that makes LibreOffice write through dconf.
pub fn ensure_dconfwrite(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, b"").with_context(|| format!("Failed to create {}", path.display()))
}

/// Driver loop: follows the dconf writer on the session bus forever.
pub fn run(mut ctx: SourceContext) {
    if let Err(e) = ensure_dconfwrite(&crate::paths::libreoffice_dconfwrite_path()) {
        tracing::error!("{e:#}");
    }

    let mut watcher = loop {
        match SettingsWatcher::new(GsettingsCli, Arc::clone(&ctx.sink)) {
            Ok(w) => break w,
            Err(e) => {
                tracing::warn!("{e:#}");
                ctx.reporter.set(SourceState::Degraded);
                std::thread::sleep(RESPAWN_DELAY);
            }
        }
    };

    loop {
        match BusMonitor::spawn(BusKind::Session, DCONF_BUS_NAME, DCONF_OBJECT_PATH) {
            Ok(monitor) => {
                for line in monitor {
                    match line {
                        BusLine::NameOwned => ctx.reporter.set(SourceState::Watching),
                        BusLine::NameVanished => ctx.reporter.set(SourceState::Degraded),
                        BusLine::Signal { member, args } if member == NOTIFY_MEMBER => {
                            match Notify::from_args(&args) {
                                Some(notify) => {
                                    watcher.handle_notify(&notify);
                                }
                                None => tracing::debug!("unparseable Notify arguments: {args}"),
                            }
                        }
                        BusLine::Signal { .. } => {}
                    }
                }
                tracing::warn!("dconf bus monitor exited");
            }
            Err(e) => tracing::warn!("{e:#}"),
        }
        ctx.reporter.set(SourceState::Degraded);
        std::thread::sleep(RESPAWN_DELAY);
    }
}
