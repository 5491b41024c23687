use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const COMPUTE_REPO_API: &str = "https://api.github.com/repos/firstbatchxyz/dkn-compute-node";
pub const LAUNCHER_REPO_API: &str =
    "https://api.github.com/repos/firstbatchxyz/dkn-compute-launcher";

const DEV_SUFFIX: &str = "-dev";

/// Which tag to pick from the release index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    LatestStable,
    LatestDev,
    PreviousStable,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::LatestStable => "latest",
            Channel::LatestDev => "latest-dev",
            Channel::PreviousStable => "previous",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("requesting {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("no tags found for channel {0}")]
    NoTagsFound(Channel),
    #[error("malformed release index response: {0}")]
    MalformedResponse(String),
}

/// Resolves version tags for a release channel.
pub trait ResolveTag {
    fn resolve(&self, channel: Channel) -> Result<String, ReleaseError>;
}

/// Release index backed by the GitHub REST API of one repository.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: reqwest::blocking::Client,
    repo_api: String,
}

impl GithubReleases {
    pub fn new(repo_api: impl Into<String>) -> Result<Self, ReleaseError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("dkn-compute-launcher/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ReleaseError::Client)?;
        Ok(Self {
            client,
            repo_api: repo_api.into(),
        })
    }

    fn get_text(&self, url: &str) -> Result<String, ReleaseError> {
        let request_err = |source| ReleaseError::Request {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().map_err(request_err)?;
        if !response.status().is_success() {
            return Err(ReleaseError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.text().map_err(request_err)
    }

    fn latest_release(&self) -> Result<String, ReleaseError> {
        let url = format!("{}/releases/latest", self.repo_api);
        parse_latest_release(&self.get_text(&url)?)
    }

    fn tag_listing(&self) -> Result<Vec<String>, ReleaseError> {
        let url = format!("{}/tags", self.repo_api);
        parse_tag_names(&self.get_text(&url)?)
    }
}

impl ResolveTag for GithubReleases {
    fn resolve(&self, channel: Channel) -> Result<String, ReleaseError> {
        let tag = match channel {
            Channel::LatestStable => self.latest_release()?,
            Channel::LatestDev | Channel::PreviousStable => {
                select_tag(channel, &self.tag_listing()?)?
            }
        };
        debug!(%channel, %tag, repo = %self.repo_api, "resolved release tag");
        Ok(tag)
    }
}

pub fn is_dev_tag(tag: &str) -> bool {
    tag.ends_with(DEV_SUFFIX)
}

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

fn malformed(err: serde_json::Error) -> ReleaseError {
    ReleaseError::MalformedResponse(err.to_string())
}

/// Extracts `tag_name` from a `releases/latest` payload.
pub fn parse_latest_release(body: &str) -> Result<String, ReleaseError> {
    let release: LatestRelease = serde_json::from_str(body).map_err(malformed)?;
    Ok(release.tag_name)
}

/// Extracts tag names from a `tags` listing, keeping the index's order.
pub fn parse_tag_names(body: &str) -> Result<Vec<String>, ReleaseError> {
    let tags: Vec<Tag> = serde_json::from_str(body).map_err(malformed)?;
    Ok(tags.into_iter().map(|tag| tag.name).collect())
}

/// Picks the tag for `channel` from a newest-first listing.
pub fn select_tag(channel: Channel, tags: &[String]) -> Result<String, ReleaseError> {
    let found = match channel {
        Channel::LatestStable => tags.first(),
        Channel::LatestDev => tags.iter().find(|tag| is_dev_tag(tag)),
        Channel::PreviousStable => tags.iter().filter(|tag| !is_dev_tag(tag)).nth(1),
    };
    found.cloned().ok_or(ReleaseError::NoTagsFound(channel))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn selects_tags_per_channel() {
        let listing = tags(&["v0.3.0-dev", "v0.2.5", "v0.2.4-dev", "v0.2.4", "v0.2.3"]);

        assert_eq!(select_tag(Channel::LatestStable, &listing).unwrap(), "v0.3.0-dev");
        assert_eq!(select_tag(Channel::LatestDev, &listing).unwrap(), "v0.3.0-dev");
        assert_eq!(select_tag(Channel::PreviousStable, &listing).unwrap(), "v0.2.4");
    }

    #[test]
    fn previous_stable_skips_latest_once() {
        let listing = tags(&["v2.0.0", "v1.9.0", "v1.8.0"]);
        assert_eq!(select_tag(Channel::PreviousStable, &listing).unwrap(), "v1.9.0");
    }

    #[test]
    fn empty_listing_has_no_tags() {
        for channel in [Channel::LatestStable, Channel::LatestDev, Channel::PreviousStable] {
            assert!(matches!(
                select_tag(channel, &[]),
                Err(ReleaseError::NoTagsFound(c)) if c == channel
            ));
        }
    }

    #[test]
    fn dev_channel_without_dev_tags_fails() {
        let listing = tags(&["v1.0.0", "v0.9.0"]);
        assert!(select_tag(Channel::LatestDev, &listing).is_err());
    }

    #[test]
    fn parses_github_payloads() {
        let latest = r#"{"tag_name": "v0.2.5", "name": "Release"}"#;
        assert_eq!(parse_latest_release(latest).unwrap(), "v0.2.5");

        let listing = r#"[{"name": "v0.2.5", "commit": {}}, {"name": "v0.2.4-dev"}]"#;
        assert_eq!(parse_tag_names(listing).unwrap(), tags(&["v0.2.5", "v0.2.4-dev"]));
    }

    #[test]
    fn rejects_entries_without_names() {
        assert!(matches!(
            parse_latest_release(r#"{"name": "no tag"}"#),
            Err(ReleaseError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_tag_names(r#"[{"name": "v1"}, {"sha": "abc"}]"#),
            Err(ReleaseError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_tag_names("not json"),
            Err(ReleaseError::MalformedResponse(_))
        ));
    }
}
