//! Encoding of the server proxy URL namespace
//!
//! Every instance lives at `<home>/server-proxy/<kind>/<instance>/<sub-path>`.
//! The number of path sections before the sub-path is fixed once the home
//! prefix is known, so parsing is a split plus a few index checks.

use regex::Regex;

/// Keyword segment that marks the server proxy namespace
pub const SERVER_PROXY_SEGMENT: &str = "server-proxy";

/// Result of decoding a proxied request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathDetails {
    pub kind_id: String,
    pub instance_id: String,
    /// Public path of the instance root, with a trailing slash
    pub base_path: String,
}

#[derive(Debug, Clone)]
pub struct PathManager {
    home: String,
    home_sections: Vec<String>,
    keyword_index: usize,
    kind_index: usize,
    instance_index: usize,
    section_count: usize,
    prefix: Regex,
}

impl PathManager {
    pub fn new(home_path: &str) -> Self {
        let home = normalize_home(home_path);
        let home_sections: Vec<String> = home
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        // Section 0 is the empty string before the leading slash.
        let keyword_index = home_sections.len() + 1;
        let kind_index = keyword_index + 1;
        let instance_index = kind_index + 1;
        let section_count = instance_index + 1;

        let prefix = Regex::new(&format!("^(/[^/?#]*){{{}}}", section_count - 1))
            .expect("valid prefix pattern");

        Self {
            home,
            home_sections,
            keyword_index,
            kind_index,
            instance_index,
            section_count,
            prefix,
        }
    }

    /// Normalized home prefix: empty, or starting with `/` and not ending with one
    pub fn home_path(&self) -> &str {
        &self.home
    }

    /// Number of `/`-separated sections of an instance root, counting the
    /// empty one before the leading slash
    pub fn section_count(&self) -> usize {
        self.section_count
    }

    pub fn kind_index(&self) -> usize {
        self.kind_index
    }

    pub fn instance_index(&self) -> usize {
        self.instance_index
    }

    /// Regex matching the fixed prefix up to and including the instance id
    pub fn match_prefix_regex(&self) -> &str {
        self.prefix.as_str()
    }

    /// Decode a request path. Returns `None` for anything outside the namespace.
    pub fn parse(&self, path: &str) -> Option<PathDetails> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let sections: Vec<&str> = path.split('/').collect();

        if sections.len() < self.section_count {
            return None;
        }
        if !sections[0].is_empty() {
            return None;
        }
        if sections[1..self.keyword_index] != self.home_sections[..] {
            return None;
        }
        if sections[self.keyword_index] != SERVER_PROXY_SEGMENT {
            return None;
        }

        let kind_id = decode_section(sections[self.kind_index])?;
        let instance_id = decode_section(sections[self.instance_index])?;

        let mut base_path = sections[..self.section_count].join("/");
        base_path.push('/');

        Some(PathDetails {
            kind_id,
            instance_id,
            base_path,
        })
    }

    /// Remove the namespace prefix, leaving the path the tool serves.
    /// Paths outside the namespace are returned unchanged.
    pub fn strip_prefix(&self, path: &str) -> String {
        if self.parse(path).is_none() {
            return path.to_string();
        }
        match self.prefix.find(path) {
            Some(m) => rooted(&path[m.end()..]),
            None => path.to_string(),
        }
    }

    /// Remove the home prefix from a path under it.
    ///
    /// Returns `None` when no home prefix is configured or the path lies
    /// outside of it.
    pub fn strip_home(&self, path: &str) -> Option<String> {
        if self.home.is_empty() {
            return None;
        }
        let rest = path.strip_prefix(self.home.as_str())?;
        if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') {
            Some(rooted(rest))
        } else {
            None
        }
    }

    /// Browser-facing path, including the home prefix
    pub fn public_path(&self, kind_id: &str, instance_id: &str, sub_path: &str) -> String {
        format!("{}{}", self.home, self.internal_path(kind_id, instance_id, sub_path))
    }

    /// Host-internal path, without the home prefix
    pub fn internal_path(&self, kind_id: &str, instance_id: &str, sub_path: &str) -> String {
        format!(
            "/{}/{}/{}/{}",
            SERVER_PROXY_SEGMENT,
            urlencoding::encode(kind_id),
            urlencoding::encode(instance_id),
            sub_path.trim_start_matches('/')
        )
    }

    /// Prefix under which every instance of a kind is mounted
    pub fn kind_mount_path(&self, kind_id: &str) -> String {
        format!(
            "{}/{}/{}/",
            self.home,
            SERVER_PROXY_SEGMENT,
            urlencoding::encode(kind_id)
        )
    }
}

impl Default for PathManager {
    fn default() -> Self {
        Self::new("")
    }
}

fn normalize_home(home: &str) -> String {
    let trimmed = home.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Make a path remainder absolute
fn rooted(rest: &str) -> String {
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

fn decode_section(section: &str) -> Option<String> {
    if section.is_empty() {
        return None;
    }
    urlencoding::decode(section).ok().map(|s| s.into_owned())
}
