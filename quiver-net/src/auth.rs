use quiver_common::credentials::Credential;
use url::Url;

/// Pick the credential for a request. Matching is stable: the first
/// matching record in configuration order wins, regardless of how
/// specific its host pattern is.
pub fn find_credential<'a>(
    credentials: &'a [Credential],
    url: &Url,
    realm: Option<&str>,
) -> Option<&'a Credential> {
    let host = url.host_str()?;
    let https = url.scheme() == "https";
    credentials
        .iter()
        .find(|credential| credential.matches(host, https, realm))
}

/// Extract the realm of a `WWW-Authenticate: Basic realm="..."` challenge.
pub fn challenge_realm(www_authenticate: &str) -> Option<String> {
    let lower = www_authenticate.to_ascii_lowercase();
    let idx = lower.find("realm=")?;
    let rest = &www_authenticate[idx + "realm=".len()..];
    let rest = rest.trim_start();
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        Some(stripped[..end].to_string())
    } else {
        let end = rest.find([',', ' ']).unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_common::credentials::CredentialFlags;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn first_declared_wins() {
        let credentials = vec![
            Credential::new("repo.example.com", "first", "pw"),
            Credential::new("repo.example.com", "second", "pw"),
        ];
        let chosen = find_credential(&credentials, &url("https://repo.example.com/a"), None);
        assert_eq!(chosen.unwrap().username, "first");
    }

    #[test]
    fn first_declared_wins_over_more_specific_later_entry() {
        // A broad match-host entry declared first beats an exact-host
        // entry declared later.
        let credentials = vec![
            Credential::new("example.com", "broad", "pw")
                .with_flags(CredentialFlags::HTTPS_ONLY | CredentialFlags::MATCH_HOST),
            Credential::new("repo.example.com", "exact", "pw"),
        ];
        let chosen = find_credential(&credentials, &url("https://repo.example.com/a"), None);
        assert_eq!(chosen.unwrap().username, "broad");
    }

    #[test]
    fn https_only_skipped_on_plain_http() {
        let credentials = vec![
            Credential::new("repo.example.com", "secure", "pw"),
            Credential::new("repo.example.com", "plain", "pw")
                .with_flags(CredentialFlags::empty()),
        ];
        let chosen = find_credential(&credentials, &url("http://repo.example.com/a"), None);
        assert_eq!(chosen.unwrap().username, "plain");
    }

    #[test]
    fn realm_narrows_the_match() {
        let credentials = vec![
            Credential::new("repo.example.com", "releases", "pw").with_realm("Releases"),
            Credential::new("repo.example.com", "anything", "pw"),
        ];
        let chosen = find_credential(
            &credentials,
            &url("https://repo.example.com/a"),
            Some("Snapshots"),
        );
        assert_eq!(chosen.unwrap().username, "anything");
    }

    #[test]
    fn challenge_realm_forms() {
        assert_eq!(
            challenge_realm("Basic realm=\"Sonatype Nexus\""),
            Some("Sonatype Nexus".to_string())
        );
        assert_eq!(
            challenge_realm("Basic realm=simple, charset=\"UTF-8\""),
            Some("simple".to_string())
        );
        assert_eq!(challenge_realm("Bearer"), None);
    }
}
