/// NetworkManager connection watcher.
///
/// Every `NewConnection` signal is handled on its own: the public profile is
/// read, overlaid with the secrets of the settings matching the connection
/// type, scrubbed of the deny-listed secrets and emitted whole.
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::bus_monitor::{self, BusKind, BusLine, BusMonitor};
use crate::event::{ChangeEvent, ChangeSink, Namespace};
use crate::sources::{command_output, SourceContext, RESPAWN_DELAY};
use crate::status::SourceState;
use crate::variant::{lookup_str, merge, redact, SECRET_PATHS};

pub const NM_BUS_NAME: &str = "org.freedesktop.NetworkManager";
pub const NM_SETTINGS_PATH: &str = "/org/freedesktop/NetworkManager/Settings";
const NEW_CONNECTION_MEMBER: &str = "org.freedesktop.NetworkManager.Settings.NewConnection";

/// Access to connection profiles by D-Bus object path.
pub trait NetworkBackend: Send {
    /// Public settings as `{setting: {property: value}}`.
    fn connection_settings(&self, object_path: &str) -> Result<Value>;
    /// Secrets of one setting, in the same shape.
    fn secrets(&self, object_path: &str, setting: &str) -> Result<Value>;
}

/// Settings whose secrets are merged for a connection type. `None` means the
/// type is not collected.
pub fn secret_settings_for(connection_type: &str) -> Option<&'static [&'static str]> {
    match connection_type {
        "802-11-wireless" => Some(&["802-11-wireless-security", "802-1x"]),
        "vpn" => Some(&["vpn"]),
        "802-3-ethernet" => Some(&["802-1x"]),
        _ => None,
    }
}

/// Backend driving `nmcli` in terse mode.
pub struct NmcliBackend;

impl NetworkBackend for NmcliBackend {
    fn connection_settings(&self, object_path: &str) -> Result<Value> {
        let out = command_output(
            "nmcli",
            &["-t", "-e", "no", "connection", "show", "path", object_path],
        )?;
        Ok(parse_nmcli_fields(&out))
    }

    fn secrets(&self, object_path: &str, setting: &str) -> Result<Value> {
        let out = command_output(
            "nmcli",
            &["-t", "-e", "no", "-s", "-f", setting, "connection", "show", "path", object_path],
        )?;
        Ok(parse_nmcli_fields(&out))
    }
}

/// Parses `setting.property:value` lines into a two-level tree. Runtime
/// sections (upper case, e.g. `GENERAL`) and unset values (`--`) are skipped;
/// the VPN `data` and `secrets` properties are expanded into maps.
pub fn parse_nmcli_fields(output: &str) -> Value {
    let mut tree: Map<String, Value> = Map::new();
    for line in output.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let Some((section, property)) = field.split_once('.') else {
            continue;
        };
        if section.chars().any(|c| c.is_ascii_uppercase()) {
            continue;
        }
        let value = value.trim();
        if value.is_empty() || value == "--" {
            continue;
        }
        let parsed = if section == "vpn" && matches!(property, "data" | "secrets") {
            parse_vpn_map(value)
        } else {
            Value::String(value.to_string())
        };
        if let Value::Object(props) = tree
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
        {
            props.insert(property.to_string(), parsed);
        }
    }
    Value::Object(tree)
}

/// `key = value, key2 = value2` → `{key: value, key2: value2}`.
fn parse_vpn_map(text: &str) -> Value {
    let map = text
        .split(", ")
        .filter_map(|pair| {
            let (k, v) = pair.split_once(" = ")?;
            Some((k.trim().to_string(), Value::String(v.trim().to_string())))
        })
        .collect();
    Value::Object(map)
}

pub struct NetworkWatcher<B> {
    backend: B,
    sink: Arc<dyn ChangeSink>,
}

impl<B: NetworkBackend> NetworkWatcher<B> {
    pub fn new(backend: B, sink: Arc<dyn ChangeSink>) -> Self {
        Self { backend, sink }
    }

    /// Handles a newly added connection. Returns whether a change was emitted.
    pub fn handle_new_connection(&self, object_path: &str) -> bool {
        let conf = match self.backend.connection_settings(object_path) {
            Ok(conf) => conf,
            Err(e) => {
                tracing::warn!("failed to read connection {object_path}: {e:#}");
                return false;
            }
        };
        let conn_type = lookup_str(&conf, "connection", "type").unwrap_or_default();
        let Some(settings) = secret_settings_for(conn_type) else {
            tracing::debug!("connection type {conn_type} not collected");
            return false;
        };

        let mut merged = conf.clone();
        for setting in settings {
            match self.backend.secrets(object_path, setting) {
                Ok(secrets) => merged = merge(&merged, &secrets),
                Err(e) => tracing::debug!("no {setting} secrets for {object_path}: {e:#}"),
            }
        }
        let filtered = redact(&merged, SECRET_PATHS);

        let payload = json!({
            "data": filtered.to_string(),
            "uuid": lookup_str(&conf, "connection", "uuid").unwrap_or_default(),
            "type": conn_type,
            "id": lookup_str(&conf, "connection", "id").unwrap_or_default(),
        });
        tracing::debug!(object_path, conn_type, "connection submitted");
        self.sink
            .submit(ChangeEvent::new(Namespace::NetworkManager, payload.to_string()));
        true
    }
}

/// Driver loop: follows NetworkManager settings on the system bus forever.
pub fn run(mut ctx: SourceContext) {
    let watcher = NetworkWatcher::new(NmcliBackend, Arc::clone(&ctx.sink));
    loop {
        match BusMonitor::spawn(BusKind::System, NM_BUS_NAME, NM_SETTINGS_PATH) {
            Ok(monitor) => {
                for line in monitor {
                    match line {
                        BusLine::NameOwned => ctx.reporter.set(SourceState::Watching),
                        BusLine::NameVanished => ctx.reporter.set(SourceState::Degraded),
                        BusLine::Signal { member, args } if member == NEW_CONNECTION_MEMBER => {
                            if let Some(path) = bus_monitor::object_path_arg(&args) {
                                watcher.handle_new_connection(&path);
                            }
                        }
                        BusLine::Signal { .. } => {}
                    }
                }
                tracing::warn!("NetworkManager bus monitor exited");
            }
            Err(e) => tracing::warn!("{e:#}"),
        }
        ctx.reporter.set(SourceState::Degraded);
        std::thread::sleep(RESPAWN_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::VecSink;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeNm {
        conf: Value,
        secrets: HashMap<&'static str, Value>,
        asked: Mutex<Vec<String>>,
    }

    impl NetworkBackend for FakeNm {
        fn connection_settings(&self, _object_path: &str) -> Result<Value> {
            Ok(self.conf.clone())
        }

        fn secrets(&self, _object_path: &str, setting: &str) -> Result<Value> {
            self.asked.lock().unwrap().push(setting.to_string());
            self.secrets
                .get(setting)
                .cloned()
                .ok_or_else(|| anyhow!("no secrets"))
        }
    }

    fn fake(conn_type: &str, secrets: HashMap<&'static str, Value>) -> FakeNm {
        FakeNm {
            conf: json!({
                "connection": {"id": "Corp", "uuid": "u-42", "type": conn_type, "permissions": "user:me"},
                "802-1x": {"identity": "me"}
            }),
            secrets,
            asked: Mutex::new(Vec::new()),
        }
    }

    fn emitted(sink: &VecSink) -> Vec<Value> {
        sink.take_json(Namespace::NetworkManager)
    }

    #[test]
    fn ethernet_merges_8021x_and_redacts_password() {
        let mut secrets = HashMap::new();
        secrets.insert("802-1x", json!({"802-1x": {"password": "hunter2", "ca-cert": "/ca.pem"}}));
        let sink = Arc::new(VecSink::default());
        let w = NetworkWatcher::new(fake("802-3-ethernet", secrets), sink.clone());

        assert!(w.handle_new_connection("/org/freedesktop/NetworkManager/Settings/1"));
        let payload = &emitted(&sink)[0];
        assert_eq!(payload["uuid"], "u-42");
        assert_eq!(payload["type"], "802-3-ethernet");
        assert_eq!(payload["id"], "Corp");

        let data: Value = serde_json::from_str(payload["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["802-1x"]["identity"], "me");
        assert_eq!(data["802-1x"]["ca-cert"], "/ca.pem");
        assert!(data["802-1x"].get("password").is_none());
        assert!(data["connection"].get("permissions").is_none());
    }

    #[test]
    fn wireless_asks_for_both_secret_settings() {
        let backend = fake("802-11-wireless", HashMap::new());
        let sink = Arc::new(VecSink::default());
        let w = NetworkWatcher::new(backend, sink.clone());

        // Failing secret fetches are ignored.
        assert!(w.handle_new_connection("/p"));
        assert_eq!(
            *w.backend.asked.lock().unwrap(),
            vec!["802-11-wireless-security", "802-1x"]
        );
        assert_eq!(emitted(&sink).len(), 1);
    }

    #[test]
    fn vpn_secrets_are_redacted() {
        let mut secrets = HashMap::new();
        secrets.insert("vpn", json!({"vpn": {"secrets": {"password": "p", "cert-pass": "c"}}}));
        let sink = Arc::new(VecSink::default());
        let w = NetworkWatcher::new(fake("vpn", secrets), sink.clone());
        assert!(w.handle_new_connection("/p"));

        let payload = &emitted(&sink)[0];
        let data: Value = serde_json::from_str(payload["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["vpn"]["secrets"], json!({"cert-pass": "c"}));
    }

    #[test]
    fn unsupported_type_is_skipped() {
        let backend = fake("bridge", HashMap::new());
        let sink = Arc::new(VecSink::default());
        let w = NetworkWatcher::new(backend, sink.clone());
        assert!(!w.handle_new_connection("/p"));
        assert!(sink.take().is_empty());
        assert!(w.backend.asked.lock().unwrap().is_empty());
    }

    #[test]
    fn nmcli_output_is_parsed_into_sections() {
        let out = "\
connection.id:Corp VPN
connection.uuid:u-1
connection.type:vpn
connection.permissions:--
vpn.service-type:org.freedesktop.NetworkManager.openvpn
vpn.data:remote = vpn.example.com, connection-type = password
GENERAL.STATE:activated
ipv4.addresses:10.0.0.2/24
";
        let tree = parse_nmcli_fields(out);
        assert_eq!(tree["connection"]["id"], "Corp VPN");
        assert!(tree["connection"].get("permissions").is_none());
        assert_eq!(tree["vpn"]["data"]["remote"], "vpn.example.com");
        assert_eq!(tree["vpn"]["data"]["connection-type"], "password");
        assert_eq!(tree["ipv4"]["addresses"], "10.0.0.2/24");
        assert!(tree.get("GENERAL").is_none());
    }

    #[test]
    fn secret_settings_table() {
        assert_eq!(secret_settings_for("vpn"), Some(&["vpn"][..]));
        assert_eq!(secret_settings_for("802-3-ethernet"), Some(&["802-1x"][..]));
        assert_eq!(secret_settings_for("loopback"), None);
    }
}
