use std::path::PathBuf;

/// An entry offered to [`batch_add`](super::AccessExceptionStore::batch_add),
/// typically from a file dialog or a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    LocalPath(PathBuf),
    Url(String),
}

impl Candidate {
    /// Classify a command-line or clipboard string.
    pub fn parse(raw: &str) -> Self {
        if raw.contains("://") {
            Self::Url(raw.to_string())
        } else {
            Self::LocalPath(PathBuf::from(raw))
        }
    }

    /// Filesystem path for local entries: absolute paths and `file://`
    /// URLs on the local host. Everything else is `None`.
    pub fn to_local_path(&self) -> Option<PathBuf> {
        match self {
            Self::LocalPath(path) if path.is_absolute() => Some(path.clone()),
            Self::LocalPath(_) => None,
            Self::Url(url) => {
                let parsed = reqwest::Url::parse(url).ok()?;
                if parsed.scheme() != "file" {
                    return None;
                }
                match parsed.host_str() {
                    None | Some("") | Some("localhost") => parsed.to_file_path().ok(),
                    Some(_) => None,
                }
            }
        }
    }
}

impl From<PathBuf> for Candidate {
    fn from(path: PathBuf) -> Self {
        Self::LocalPath(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_entries() {
        assert_eq!(
            Candidate::parse("/srv/games").to_local_path(),
            Some(PathBuf::from("/srv/games"))
        );
        assert_eq!(
            Candidate::parse("file:///srv/my%20games").to_local_path(),
            Some(PathBuf::from("/srv/my games"))
        );
        assert_eq!(
            Candidate::parse("file://localhost/tmp").to_local_path(),
            Some(PathBuf::from("/tmp"))
        );
    }

    #[test]
    fn non_local_entries() {
        assert_eq!(Candidate::parse("relative/dir").to_local_path(), None);
        assert_eq!(Candidate::parse("https://host/dir").to_local_path(), None);
        assert_eq!(Candidate::parse("file://nas/share").to_local_path(), None);
    }
}
