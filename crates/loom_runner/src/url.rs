//! Serving-URL detection in process output.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{RunnerError, RunnerResult};

/// Lowest port accepted from process output.
pub const MIN_PORT: u16 = 1024;

/// Something that can recognise a serving URL in one line of output.
pub trait UrlMatcher: Send + Sync {
    fn name(&self) -> &str;

    /// The normalized URL announced by `line`, if any.
    fn match_line(&self, line: &str) -> Option<String>;
}

/// How a regex capture becomes a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// Groups: scheme, host, port
    FullUrl,
    /// Group 1: port on localhost
    PortOnly,
}

pub struct RegexUrlMatcher {
    name: String,
    regex: Regex,
    kind: CaptureKind,
}

impl RegexUrlMatcher {
    pub fn new(name: impl Into<String>, pattern: &str, kind: CaptureKind) -> RunnerResult<Self> {
        let name = name.into();
        let regex = Regex::new(pattern)
            .map_err(|e| RunnerError::Detection(format!("invalid pattern {}: {}", name, e)))?;
        Ok(Self { name, regex, kind })
    }

    /// `scheme://host:port` anywhere in the line.
    pub fn explicit_url() -> RunnerResult<Self> {
        Self::new(
            "explicit-url",
            r"(?i)\b(https?)://(localhost|\d{1,3}(?:\.\d{1,3}){3}|\[[0-9a-f:]*\]|[a-z0-9.-]+):(\d{2,5})\b",
            CaptureKind::FullUrl,
        )
    }

    /// A port following words such as "listening on" or "port".
    pub fn keyword_port() -> RunnerResult<Self> {
        Self::new(
            "keyword-port",
            r"(?i)\b(?:port|address|listening on|host|server at|endpoint)\b\s*[:=]?\s*(?:(?:[a-z0-9.-]+|\[[^\]]+\]):)?(\d{4,5})\b",
            CaptureKind::PortOnly,
        )
    }

    /// A bare `host:port` pair on a loopback, wildcard or IPv4 host.
    pub fn host_port() -> RunnerResult<Self> {
        Self::new(
            "host-port",
            r"(?i)(?:https?://)?(?:localhost|\d{1,3}(?:\.\d{1,3}){3}|\[[0-9a-f:]*\]):(\d{4,5})\b",
            CaptureKind::PortOnly,
        )
    }
}

/// `file:line:col` positions and module paths such as `node:internal/x:1080`
/// look like ports; a port match glued to either is not an address.
fn is_source_position(line: &str, start: usize, end: usize) -> bool {
    let mut after = line[end..].chars();
    if after.next() == Some(':') && after.next().is_some_and(|c| c.is_ascii_digit()) {
        return true;
    }
    let before = &line[..start];
    if before
        .chars()
        .next_back()
        .is_some_and(|c| matches!(c, '/' | '\\' | '.' | ':' | '_' | '-') || c.is_alphanumeric())
    {
        return true;
    }
    let token = before.rsplit(char::is_whitespace).next().unwrap_or_default();
    token.contains("node:") || token.contains('/')
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.parse::<u16>().ok().filter(|p| *p >= MIN_PORT)
}

fn normalize_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "[::]" | "[::0]" => "localhost",
        other => other,
    }
}

impl UrlMatcher for RegexUrlMatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_line(&self, line: &str) -> Option<String> {
        match self.kind {
            CaptureKind::FullUrl => {
                let captures = self.regex.captures(line)?;
                let scheme = captures.get(1)?.as_str().to_lowercase();
                let host = normalize_host(captures.get(2)?.as_str());
                let port = parse_port(captures.get(3)?.as_str())?;
                Some(format!("{}://{}:{}", scheme, host, port))
            }
            CaptureKind::PortOnly => self.regex.captures_iter(line).find_map(|captures| {
                let whole = captures.get(0)?;
                if is_source_position(line, whole.start(), whole.end()) {
                    return None;
                }
                let port = parse_port(captures.get(1)?.as_str())?;
                Some(format!("http://localhost:{}", port))
            }),
        }
    }
}

fn ansi_escapes() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").ok())
        .as_ref()
}

/// Ordered set of matchers; the first one that matches wins.
pub struct UrlDetector {
    matchers: Vec<Box<dyn UrlMatcher>>,
}

impl Default for UrlDetector {
    fn default() -> Self {
        let matchers = [
            RegexUrlMatcher::explicit_url(),
            RegexUrlMatcher::keyword_port(),
            RegexUrlMatcher::host_port(),
        ]
        .into_iter()
        .filter_map(|m| m.ok())
        .map(|m| Box::new(m) as Box<dyn UrlMatcher>)
        .collect();
        Self { matchers }
    }
}

impl UrlDetector {
    pub fn empty() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    pub fn with_matcher(mut self, matcher: impl UrlMatcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    pub fn detect(&self, line: &str) -> Option<String> {
        let cleaned = match ansi_escapes() {
            Some(re) => re.replace_all(line, "").into_owned(),
            None => line.to_string(),
        };
        self.matchers.iter().find_map(|m| m.match_line(&cleaned))
    }
}
