use std::fs::File;
use std::io;
use std::path::Path;

use quiver_common::config::ChecksumAlgorithm;
use quiver_common::error::{QuiverError, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hash a file on disk, lowercase hex.
pub fn compute(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    tracing::debug!(path = %path.display(), ?algorithm, "computing checksum");
    let mut file = File::open(path)?;
    let digest = match algorithm {
        ChecksumAlgorithm::Sha1 => {
            let mut hasher = Sha1::new();
            io::copy(&mut file, &mut hasher)?;
            hex::encode(hasher.finalize())
        }
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            io::copy(&mut file, &mut hasher)?;
            hex::encode(hasher.finalize())
        }
    };
    Ok(digest)
}

/// Extract the hash from a checksum file. Repositories publish either the
/// bare hex digest or `<digest>  <filename>`; some prepend blank lines.
pub fn parse_checksum_file(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_ascii_lowercase)
        .filter(|digest| !digest.is_empty() && digest.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Verify a file against an expected digest.
pub fn verify(path: &Path, algorithm: ChecksumAlgorithm, expected: &str, url: &str) -> Result<()> {
    let actual = compute(path, algorithm)?;
    if actual.eq_ignore_ascii_case(expected) {
        tracing::debug!(path = %path.display(), "checksum verified");
        Ok(())
    } else {
        Err(QuiverError::ChecksumMismatch {
            url: url.to_string(),
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.jar");
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        (dir, path)
    }

    #[test]
    fn sha1_of_known_input() {
        let (_dir, path) = file_with(b"hello world\n");
        // sha1sum of "hello world\n"
        assert_eq!(
            compute(&path, ChecksumAlgorithm::Sha1).unwrap(),
            "22596363b3de40b06f981fb85d82312e8c0ed511"
        );
    }

    #[test]
    fn sha256_of_known_input() {
        let (_dir, path) = file_with(b"hello world\n");
        assert_eq!(
            compute(&path, ChecksumAlgorithm::Sha256).unwrap(),
            "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447"
        );
    }

    #[test]
    fn checksum_file_shapes() {
        assert_eq!(
            parse_checksum_file("22596363b3de40b06f981fb85d82312e8c0ed511").as_deref(),
            Some("22596363b3de40b06f981fb85d82312e8c0ed511")
        );
        assert_eq!(
            parse_checksum_file("ABCDEF0123  artifact.jar\n").as_deref(),
            Some("abcdef0123")
        );
        assert_eq!(
            parse_checksum_file("\n\n  deadbeef\n").as_deref(),
            Some("deadbeef")
        );
        assert_eq!(parse_checksum_file(""), None);
        assert_eq!(parse_checksum_file("<html>not found</html>"), None);
    }

    #[test]
    fn verify_mismatch_reports_both_digests() {
        let (_dir, path) = file_with(b"hello world\n");
        let err = verify(
            &path,
            ChecksumAlgorithm::Sha1,
            "0000000000000000000000000000000000000000",
            "https://repo.example.com/a.jar",
        )
        .unwrap_err();
        match err {
            QuiverError::ChecksumMismatch { expected, actual, .. } => {
                assert_eq!(expected, "0000000000000000000000000000000000000000");
                assert_eq!(actual, "22596363b3de40b06f981fb85d82312e8c0ed511");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn verify_is_case_insensitive() {
        let (_dir, path) = file_with(b"hello world\n");
        verify(
            &path,
            ChecksumAlgorithm::Sha1,
            "22596363B3DE40B06F981FB85D82312E8C0ED511",
            "https://repo.example.com/a.jar",
        )
        .unwrap();
    }
}
