//! Share grant lookups and request/response bodies.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use subtle::ConstantTimeEq;

/// What a share token resolves to.
#[derive(Clone, FromRow, Debug)]
pub struct ShareTarget {
    #[sqlx(rename = "id")]
    pub file_id: i64,
    pub filename: String,
    pub filesize: i64,
    pub share_password: Option<String>,
}

impl ShareTarget {
    /// Empty or missing stored passwords mean anyone holding the token may download.
    pub fn requires_password(&self) -> bool {
        self.share_password.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Whether `supplied` unlocks this share. Compared in constant time.
    pub fn permits(&self, supplied: Option<&str>) -> bool {
        match self.share_password.as_deref() {
            Some(stored) if !stored.is_empty() => {
                let supplied = supplied.unwrap_or_default();
                bool::from(stored.as_bytes().ct_eq(supplied.as_bytes()))
            }
            _ => true,
        }
    }
}

/// Current share settings of a file, as shown to its owner.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ShareDetails {
    pub share_token: String,
    pub share_password: String,
}

/// Body of `POST /api/share`.
#[derive(Deserialize, Debug)]
pub struct CreateShareRequest {
    pub file_id: i64,
    #[serde(default)]
    pub password: String,
}

/// Public metadata returned for a share token.
#[derive(Serialize, Debug)]
pub struct ShareInfo {
    pub filename: String,
    pub filesize: i64,
    pub has_password: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(password: Option<&str>) -> ShareTarget {
        ShareTarget {
            file_id: 1,
            filename: "a.txt".into(),
            filesize: 3,
            share_password: password.map(str::to_string),
        }
    }

    #[test]
    fn open_share_permits_anything() {
        for stored in [None, Some("")] {
            let t = target(stored);
            assert!(!t.requires_password());
            assert!(t.permits(None));
            assert!(t.permits(Some("whatever")));
        }
    }

    #[test]
    fn protected_share_needs_exact_password() {
        let t = target(Some("s3cret"));
        assert!(t.requires_password());
        assert!(t.permits(Some("s3cret")));
        assert!(!t.permits(Some("s3cre")));
        assert!(!t.permits(Some("")));
        assert!(!t.permits(None));
    }
}
