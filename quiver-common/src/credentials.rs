use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QuiverError, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CredentialFlags: u8 {
        /// Only ever sent over https.
        const HTTPS_ONLY       = 0b0001;
        /// Sent preemptively, without waiting for a 401 challenge.
        const AUTO             = 0b0010;
        /// Subdomains of `host` match too.
        const MATCH_HOST       = 0b0100;
        /// Kept on cross-host redirects.
        const PASS_ON_REDIRECT = 0b1000;
    }
}

impl Default for CredentialFlags {
    fn default() -> Self {
        CredentialFlags::HTTPS_ONLY
    }
}

/// One credential record from configuration. Matching is stable: the first
/// record in configuration order wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(default)]
    pub flags: CredentialFlags,
}

impl Credential {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            realm: None,
            flags: CredentialFlags::default(),
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_flags(mut self, flags: CredentialFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether this record applies to a request. `realm` is the realm of a
    /// `WWW-Authenticate` challenge when the server sent one; the realm
    /// filter only applies in that case.
    pub fn matches(&self, host: &str, https: bool, realm: Option<&str>) -> bool {
        if self.flags.contains(CredentialFlags::HTTPS_ONLY) && !https {
            return false;
        }
        let host_ok = host.eq_ignore_ascii_case(&self.host)
            || (self.flags.contains(CredentialFlags::MATCH_HOST)
                && host
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", self.host.to_ascii_lowercase())));
        if !host_ok {
            return false;
        }
        match (realm, &self.realm) {
            (Some(challenge), Some(configured)) => challenge == configured,
            _ => true,
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the password.
        write!(f, "{}@{}", self.username, self.host)
    }
}

/// Load credentials from the `COURSIER_CREDENTIALS` value: either inline
/// content or a path to a properties-style file.
pub fn load(raw: &str) -> Result<Vec<Credential>> {
    let trimmed = raw.trim();
    if trimmed.contains('\n') || trimmed.starts_with("host.") {
        parse(trimmed)
    } else {
        let path = Path::new(trimmed);
        let content = std::fs::read_to_string(path).map_err(|e| {
            QuiverError::Credential(format!(
                "cannot read credentials file {}: {e}",
                path.display()
            ))
        })?;
        parse(&content)
    }
}

/// Parse the line-oriented credentials format:
///
/// ```text
/// host.central.host=repo.example.com
/// host.central.username=alice
/// host.central.password=hunter2
/// host.central.realm=Example Realm
/// host.central.https-only=true
/// host.central.auto=true
/// host.central.pass-on-redirect=false
/// ```
pub fn parse(content: &str) -> Result<Vec<Credential>> {
    #[derive(Default)]
    struct Partial {
        host: Option<String>,
        username: Option<String>,
        password: Option<String>,
        realm: Option<String>,
        https_only: Option<bool>,
        auto: Option<bool>,
        match_host: Option<bool>,
        pass_on_redirect: Option<bool>,
    }

    let mut partials: BTreeMap<String, Partial> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            QuiverError::Credential(format!("line {}: missing '='", line_no + 1))
        })?;
        let key = key.trim();
        let value = value.trim();
        let rest = key.strip_prefix("host.").ok_or_else(|| {
            QuiverError::Credential(format!("line {}: expected 'host.<name>.<field>'", line_no + 1))
        })?;
        let (name, field) = rest.rsplit_once('.').ok_or_else(|| {
            QuiverError::Credential(format!("line {}: expected 'host.<name>.<field>'", line_no + 1))
        })?;

        if !partials.contains_key(name) {
            order.push(name.to_string());
        }
        let partial = partials.entry(name.to_string()).or_default();
        let parse_bool = |v: &str| -> Result<bool> {
            match v {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(QuiverError::Credential(format!(
                    "line {}: expected true/false, got '{other}'",
                    line_no + 1
                ))),
            }
        };
        match field {
            "host" => partial.host = Some(value.to_string()),
            "username" => partial.username = Some(value.to_string()),
            "password" => partial.password = Some(value.to_string()),
            "realm" => partial.realm = Some(value.to_string()),
            "https-only" => partial.https_only = Some(parse_bool(value)?),
            "auto" => partial.auto = Some(parse_bool(value)?),
            "match-host" => partial.match_host = Some(parse_bool(value)?),
            "pass-on-redirect" => partial.pass_on_redirect = Some(parse_bool(value)?),
            other => {
                debug!("ignoring unknown credential field '{other}'");
            }
        }
    }

    let mut credentials = Vec::new();
    for name in order {
        let partial = partials.remove(&name).expect("collected above");
        let host = partial
            .host
            .ok_or_else(|| QuiverError::Credential(format!("credential '{name}': missing host")))?;
        let mut flags = CredentialFlags::empty();
        if partial.https_only.unwrap_or(true) {
            flags |= CredentialFlags::HTTPS_ONLY;
        }
        if partial.auto.unwrap_or(false) {
            flags |= CredentialFlags::AUTO;
        }
        if partial.match_host.unwrap_or(false) {
            flags |= CredentialFlags::MATCH_HOST;
        }
        if partial.pass_on_redirect.unwrap_or(false) {
            flags |= CredentialFlags::PASS_ON_REDIRECT;
        }
        credentials.push(Credential {
            host,
            username: partial.username.unwrap_or_default(),
            password: partial.password.unwrap_or_default(),
            realm: partial.realm,
            flags,
        });
    }
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
host.central.host=repo.example.com
host.central.username=alice
host.central.password=hunter2
host.central.realm=Example Realm
host.central.https-only=true
host.central.pass-on-redirect=true

host.mirror.host=mirror.example.org
host.mirror.username=bob
host.mirror.password=pw
host.mirror.https-only=false
host.mirror.match-host=true
host.mirror.auto=true
";

    #[test]
    fn parse_file_format() {
        let creds = parse(SAMPLE).unwrap();
        assert_eq!(creds.len(), 2);

        let central = &creds[0];
        assert_eq!(central.host, "repo.example.com");
        assert_eq!(central.username, "alice");
        assert_eq!(central.realm.as_deref(), Some("Example Realm"));
        assert!(central.flags.contains(CredentialFlags::HTTPS_ONLY));
        assert!(central.flags.contains(CredentialFlags::PASS_ON_REDIRECT));
        assert!(!central.flags.contains(CredentialFlags::AUTO));

        let mirror = &creds[1];
        assert!(!mirror.flags.contains(CredentialFlags::HTTPS_ONLY));
        assert!(mirror.flags.contains(CredentialFlags::MATCH_HOST));
        assert!(mirror.flags.contains(CredentialFlags::AUTO));
    }

    #[test]
    fn parse_rejects_missing_host() {
        let err = parse("host.x.username=u").unwrap_err();
        assert!(matches!(err, QuiverError::Credential(_)));
    }

    #[test]
    fn https_only_filter() {
        let cred = Credential::new("repo.example.com", "u", "p");
        assert!(cred.matches("repo.example.com", true, None));
        assert!(!cred.matches("repo.example.com", false, None));

        let plain = cred.clone().with_flags(CredentialFlags::empty());
        assert!(plain.matches("repo.example.com", false, None));
    }

    #[test]
    fn host_and_subdomain_matching() {
        let exact = Credential::new("example.com", "u", "p");
        assert!(exact.matches("example.com", true, None));
        assert!(!exact.matches("sub.example.com", true, None));
        assert!(!exact.matches("notexample.com", true, None));

        let wide = exact
            .clone()
            .with_flags(CredentialFlags::HTTPS_ONLY | CredentialFlags::MATCH_HOST);
        assert!(wide.matches("sub.example.com", true, None));
        assert!(wide.matches("a.b.example.com", true, None));
        assert!(!wide.matches("notexample.com", true, None));
    }

    #[test]
    fn realm_filter_applies_only_with_challenge() {
        let cred = Credential::new("repo.example.com", "u", "p").with_realm("Releases");
        assert!(cred.matches("repo.example.com", true, Some("Releases")));
        assert!(!cred.matches("repo.example.com", true, Some("Snapshots")));
        // No challenge realm: the filter does not apply.
        assert!(cred.matches("repo.example.com", true, None));
    }

    #[test]
    fn inline_load() {
        let creds = load("host.a.host=h.example.com\nhost.a.username=u").unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].host, "h.example.com");
    }
}
