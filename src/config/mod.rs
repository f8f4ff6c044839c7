use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const AUTH_DIR_NAME: &str = ".swarmboard";
const AUTH_FILE_NAME: &str = "auth.json";

/// Explicit environment threaded through component constructors: the project
/// root, the blackboard directory, and where credentials were loaded from.
#[derive(Debug, Clone)]
pub struct Environment {
    pub root_path: PathBuf,
    pub blackboard_dir: PathBuf,
    pub keys_path: Option<PathBuf>,
}

impl Environment {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        let root_path = root_path.into();
        let blackboard_dir = root_path.join(".blackboard");
        Self {
            root_path,
            blackboard_dir,
            keys_path: None,
        }
    }

    pub fn with_blackboard_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blackboard_dir = dir.into();
        self
    }

    pub fn with_keys_path(mut self, path: Option<PathBuf>) -> Self {
        self.keys_path = path;
        self
    }
}

/// Provider credentials, resolved through three layers:
/// 1. an explicit keys file (`--keys keys.json`),
/// 2. the user auth store (`~/.swarmboard/auth.json`, mode 0600),
/// 3. `<PROVIDER>_API_KEY` environment variables.
///
/// Values may be plain strings or `{"type": "api", "key": "..."}` objects.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    entries: Map<String, Value>,
}

impl Credentials {
    pub fn load(keys_path: Option<&Path>) -> Self {
        let mut entries = Map::new();

        // Auth store first, explicit keys file on top.
        if let Some(auth_path) = auth_file_path()
            && let Some(stored) = read_json_map(&auth_path)
        {
            entries.extend(stored);
        }

        if let Some(path) = keys_path {
            match read_json_map(path) {
                Some(keys) => entries.extend(keys),
                None => warn!("could not read keys file at {}", path.display()),
            }
        }

        Self { entries }
    }

    pub fn from_map(entries: Map<String, Value>) -> Self {
        Self { entries }
    }

    /// Resolve the API key for a provider, falling back to the environment.
    pub fn key_for(&self, provider: &str) -> Option<String> {
        if let Some(value) = self.entries.get(provider) {
            if let Some(key) = extract_key(value) {
                return Some(key);
            }
            debug!("credential entry for '{}' has no usable key", provider);
        }
        let env_var = format!("{}_API_KEY", provider.to_uppercase());
        std::env::var(&env_var).ok().filter(|v| !v.is_empty())
    }

    /// Persist one credential into the user auth store with 0600 perms.
    pub fn store(provider: &str, key: &str) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let Some(auth_path) = auth_file_path() else {
            return Err(std::io::Error::other("no home directory"));
        };
        if let Some(dir) = auth_path.parent() {
            std::fs::create_dir_all(dir)?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let mut entries = read_json_map(&auth_path).unwrap_or_default();
        entries.insert(
            provider.to_string(),
            serde_json::json!({"type": "api", "key": key}),
        );

        // Temp-file-and-rename keeps the store intact on a torn write.
        let tmp_path = auth_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(&entries)?)?;
        std::fs::rename(&tmp_path, &auth_path)?;
        std::fs::set_permissions(&auth_path, std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

fn auth_file_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(AUTH_DIR_NAME).join(AUTH_FILE_NAME))
}

fn read_json_map(path: &Path) -> Option<Map<String, Value>> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn extract_key(value: &Value) -> Option<String> {
    match value {
        Value::String(key) if !key.is_empty() => Some(key.clone()),
        Value::Object(map) => map
            .get("key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(ToString::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_string_entry_resolves() {
        let mut entries = Map::new();
        entries.insert("openai".to_string(), json!("sk-plain"));
        let creds = Credentials::from_map(entries);
        assert_eq!(creds.key_for("openai").as_deref(), Some("sk-plain"));
    }

    #[test]
    fn typed_object_entry_resolves() {
        let mut entries = Map::new();
        entries.insert("deepseek".to_string(), json!({"type": "api", "key": "sk-obj"}));
        let creds = Credentials::from_map(entries);
        assert_eq!(creds.key_for("deepseek").as_deref(), Some("sk-obj"));
    }

    #[test]
    fn keys_file_overrides_nothing_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let creds = Credentials::load(Some(&dir.path().join("absent.json")));
        // Resolution falls through to the environment (likely unset here).
        let _ = creds.key_for("no_such_provider_xyz");
    }

    #[test]
    fn keys_file_entries_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, r#"{"groq": {"type": "api", "key": "sk-groq"}}"#).unwrap();
        let creds = Credentials::load(Some(&path));
        assert_eq!(creds.key_for("groq").as_deref(), Some("sk-groq"));
    }

    #[test]
    fn env_fallback_is_used() {
        let mut entries = Map::new();
        entries.insert("empty_provider".to_string(), json!(""));
        let creds = Credentials::from_map(entries);
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe {
            std::env::set_var("EMPTY_PROVIDER_API_KEY", "sk-env");
        }
        assert_eq!(creds.key_for("empty_provider").as_deref(), Some("sk-env"));
        unsafe {
            std::env::remove_var("EMPTY_PROVIDER_API_KEY");
        }
    }

    #[test]
    fn environment_paths_derive_from_root() {
        let env = Environment::new("/work/project");
        assert_eq!(env.blackboard_dir, PathBuf::from("/work/project/.blackboard"));
        assert!(env.keys_path.is_none());
    }
}
