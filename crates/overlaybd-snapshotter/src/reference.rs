//! Image reference parsing.
//!
//! Only the little slice of reference handling the descriptor writer needs:
//! splitting `host[:port]/repo[:tag][@digest]` so the registry blob URL
//! prefix can be derived. Pulling, auth and digest verification live
//! elsewhere.

use std::fmt;

use crate::error::{Error, Result};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry host, possibly with a port.
    pub host: String,
    /// Repository path below the host.
    pub repository: String,
    /// Tag, when one was given.
    pub tag: Option<String>,
    /// Digest, when one was given.
    pub digest: Option<String>,
}

impl Reference {
    /// Parse a fully-qualified image reference.
    ///
    /// The host part is required: `registry.example.com/ns/app:v1` parses,
    /// a bare `app:v1` does not. This is the form the CRI hands over in the
    /// image-ref label.
    pub fn parse(s: &str) -> Result<Reference> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidArgument("empty image reference".into()));
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (s, None),
        };

        let (host, rest) = name.split_once('/').ok_or_else(|| {
            Error::InvalidArgument(format!("image reference {s:?} has no registry host"))
        })?;
        if host.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "image reference {s:?} has no registry host"
            )));
        }

        // a colon after the last slash separates the tag; earlier colons
        // belong to the host port
        let (repository, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx + 1..].contains('/') => (
                rest[..idx].to_string(),
                Some(rest[idx + 1..].to_string()),
            ),
            _ => (rest.to_string(), None),
        };
        if repository.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "image reference {s:?} has no repository"
            )));
        }

        Ok(Reference {
            host: host.to_string(),
            repository,
            tag,
            digest,
        })
    }

    /// The registry blob URL prefix for this reference:
    /// `https://<host>/v2/<repository>/blobs`.
    pub fn blob_url_prefix(&self) -> String {
        format!("https://{}/v2/{}/blobs", self.host, self.repository)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_with_tag() {
        let r = Reference::parse("registry.example.com/ns/app:v1").unwrap();
        assert_eq!(r.host, "registry.example.com");
        assert_eq!(r.repository, "ns/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(
            r.blob_url_prefix(),
            "https://registry.example.com/v2/ns/app/blobs"
        );
    }

    #[test]
    fn test_parse_short_host() {
        let r = Reference::parse("host/repo:tag").unwrap();
        assert_eq!(r.host, "host");
        assert_eq!(r.repository, "repo");
        assert_eq!(r.blob_url_prefix(), "https://host/v2/repo/blobs");
    }

    #[test]
    fn test_parse_with_port_and_digest() {
        let r = Reference::parse("localhost:5000/app@sha256:abcd").unwrap();
        assert_eq!(r.host, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abcd"));
        assert_eq!(r.blob_url_prefix(), "https://localhost:5000/v2/app/blobs");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("appwithouthost").is_err());
        assert!(Reference::parse("/repo").is_err());
        assert!(Reference::parse("host/:tag").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in [
            "registry.example.com/ns/app:v1",
            "localhost:5000/app@sha256:abcd",
            "host/repo",
        ] {
            assert_eq!(Reference::parse(s).unwrap().to_string(), s);
        }
    }
}
