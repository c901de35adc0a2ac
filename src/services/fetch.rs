use dashmap::DashMap;
use rayon::prelude::*;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{StatusCode, Url};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::config::FetchConfig;
use crate::core::asset::{LogoAsset, LogoFormat};
use crate::core::prefix::PrefixGroups;
use crate::services::{Failure, ProgressCallback, Stage};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to access {url} (status code {status})")]
    Status { url: String, status: u16 },

    #[error("No logo or favicon found for {url}")]
    NoLogo { url: String },

    #[error("Invalid logo URL {href}: {reason}")]
    InvalidUrl { href: String, reason: String },

    #[error("Unrecognized image data at {url}")]
    UnknownFormat { url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Cannot start fetch workers: {0}")]
    Pool(String),

    #[error("Invalid domain name {0:?}")]
    InvalidDomain(String),
}

/// A domain names both a host and the file `<domain>.<ext>`, so it must stay
/// a single path component.
fn check_domain(domain: &str) -> Result<(), FetchError> {
    let unsafe_name = domain.is_empty()
        || domain.contains(['/', '\\'])
        || domain.contains("..")
        || domain.chars().any(char::is_control);
    if unsafe_name {
        return Err(FetchError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

/// Finds the logo reference in a page's markup.
///
/// Preference: the first `<img>` whose `alt` or `src` mentions "logo", then
/// the first `<link>` whose `rel` mentions "icon".
pub struct LogoLocator {
    img_tag: Regex,
    link_tag: Regex,
    alt: Regex,
    src: Regex,
    rel: Regex,
    href: Regex,
}

fn attribute_pattern(name: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r#"(?is)\s{name}\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#
    ))
}

impl LogoLocator {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            img_tag: Regex::new(r"(?is)<img\b[^>]*>")?,
            link_tag: Regex::new(r"(?is)<link\b[^>]*>")?,
            alt: attribute_pattern("alt")?,
            src: attribute_pattern("src")?,
            rel: attribute_pattern("rel")?,
            href: attribute_pattern("href")?,
        })
    }

    pub fn locate(&self, html: &str) -> Option<String> {
        let logo_img = self.img_tag.find_iter(html).find_map(|tag| {
            let tag = tag.as_str();
            let alt = attribute(&self.alt, tag).unwrap_or_default();
            let src = attribute(&self.src, tag).unwrap_or_default();
            let mentions_logo =
                alt.to_lowercase().contains("logo") || src.to_lowercase().contains("logo");
            (mentions_logo && !src.is_empty()).then_some(src)
        });
        if logo_img.is_some() {
            return logo_img;
        }

        self.link_tag.find_iter(html).find_map(|tag| {
            let tag = tag.as_str();
            let rel = attribute(&self.rel, tag)?;
            if !rel.to_lowercase().contains("icon") {
                return None;
            }
            attribute(&self.href, tag).filter(|h| !h.is_empty())
        })
    }
}

fn attribute(pattern: &Regex, tag: &str) -> Option<String> {
    let caps = pattern.captures(tag)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().trim().to_string())
}

/// Lowercase extension of the last path segment, query already excluded.
fn url_extension(url: &Url) -> Option<String> {
    let name = url.path_segments()?.next_back()?;
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Outcome of one fetch pass, in input order.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub assets: Vec<LogoAsset>,
    pub failures: Vec<Failure>,
    /// Domains not fetched because their prefix already has a logo.
    pub skipped: Vec<String>,
}

pub struct FetchService {
    client: Client,
    workers: usize,
    locator: LogoLocator,
    progress: Option<ProgressCallback>,
}

impl FetchService {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Self::from_client(client, config.workers)
    }

    pub fn from_client(client: Client, workers: usize) -> Result<Self, FetchError> {
        Ok(Self {
            client,
            workers: workers.max(1),
            locator: LogoLocator::new()?,
            progress: None,
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Fetch logos for `domains` into `out_dir` with a bounded worker pool.
    ///
    /// Domains that already have a file in `out_dir` are reused rather than
    /// downloaded again. With `prefix_prefilter`, domains whose prefix key is
    /// already covered by an existing file are skipped. Individual failures
    /// never abort the batch.
    pub fn fetch_all(
        &self,
        domains: &[String],
        out_dir: &Path,
        prefix_prefilter: bool,
    ) -> Result<FetchReport, FetchError> {
        fs::create_dir_all(out_dir)?;

        let mut seen = HashSet::new();
        let domains: Vec<&String> = domains.iter().filter(|d| seen.insert(d.as_str())).collect();
        let existing = existing_logos(out_dir)?;
        let known = PrefixGroups::build(existing.keys());

        let mut report = FetchReport::default();
        let mut pending = Vec::new();
        for domain in &domains {
            if existing.contains_key(domain.as_str()) {
                continue;
            }
            if prefix_prefilter && known.group_key_for(domain).is_some() {
                log::debug!("skipping {}: prefix already has a logo", domain);
                report.skipped.push(domain.to_string());
                continue;
            }
            pending.push(domain.as_str());
        }
        log::info!(
            "Fetching {} domains ({} cached, {} skipped by prefix)",
            pending.len(),
            domains.len() - pending.len() - report.skipped.len(),
            report.skipped.len()
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| FetchError::Pool(e.to_string()))?;
        let results: DashMap<&str, Result<LogoAsset, String>> = DashMap::new();
        pool.install(|| {
            pending.par_iter().for_each(|&domain| {
                let result = self.fetch_domain(domain, out_dir).map_err(|e| {
                    log::warn!("Error processing {}: {}", domain, e);
                    e.to_string()
                });
                results.insert(domain, result);
                if let Some(progress) = &self.progress {
                    progress(domain);
                }
            });
        });

        let mut existing = existing;
        for domain in domains {
            if let Some(asset) = existing.remove(domain.as_str()) {
                report.assets.push(asset);
                continue;
            }
            if let Some((_, result)) = results.remove(domain.as_str()) {
                match result {
                    Ok(asset) => report.assets.push(asset),
                    Err(reason) => report.failures.push(Failure::new(domain, Stage::Fetch, reason)),
                }
            }
        }
        log::info!(
            "Logos available for {} domains ({} failed)",
            report.assets.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Fetch one domain's logo to `<out_dir>/<domain>.<ext>`.
    pub fn fetch_domain(&self, domain: &str, out_dir: &Path) -> Result<LogoAsset, FetchError> {
        check_domain(domain)?;
        let page_url = format!("http://{domain}");
        let page = self.client.get(&page_url).send()?;
        if page.status() != StatusCode::OK {
            return Err(FetchError::Status {
                url: page_url,
                status: page.status().as_u16(),
            });
        }
        let base = page.url().clone();
        let html = page.text()?;

        let href = self
            .locator
            .locate(&html)
            .ok_or_else(|| FetchError::NoLogo { url: page_url.clone() })?;
        let logo_url = base.join(&href).map_err(|e| FetchError::InvalidUrl {
            href: href.clone(),
            reason: e.to_string(),
        })?;

        let image = self.client.get(logo_url.clone()).send()?;
        if image.status() != StatusCode::OK {
            return Err(FetchError::Status {
                url: logo_url.to_string(),
                status: image.status().as_u16(),
            });
        }
        let bytes = image.bytes()?;

        let format = url_extension(&logo_url)
            .and_then(|ext| LogoFormat::from_extension(&ext))
            .or_else(|| LogoFormat::sniff(&bytes))
            .ok_or_else(|| FetchError::UnknownFormat {
                url: logo_url.to_string(),
            })?;
        let path = out_dir.join(format!("{domain}.{}", format.extension()));
        fs::write(&path, &bytes)?;
        log::debug!("saved {} ({} bytes)", path.display(), bytes.len());

        Ok(LogoAsset {
            domain: domain.to_string(),
            path,
            format,
            size_bytes: bytes.len() as u64,
        })
    }
}

/// Logos already present in `dir`, keyed by domain.
fn existing_logos(dir: &Path) -> Result<HashMap<String, LogoAsset>, FetchError> {
    let mut found = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(asset) = LogoAsset::from_path(&path)? {
            found.insert(asset.domain.clone(), asset);
        }
    }
    Ok(found)
}

/// Read a domain list: one domain per line, blank lines, `#` comments and a
/// `domain` header ignored.
pub fn read_domain_list(path: &Path) -> Result<Vec<String>, std::io::Error> {
    let raw = fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(|line| line.split(',').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| !line.eq_ignore_ascii_case("domain"))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::io::{BufRead, BufReader, Cursor, Write};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    type Route = (&'static str, u16, &'static str, Vec<u8>);

    /// Minimal HTTP/1.1 server answering fixed routes; returns `host:port`.
    fn serve(routes: Vec<Route>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) <= 2 {
                        break;
                    }
                }
                let target = request_line.split_whitespace().nth(1).unwrap_or("/");
                let path = target.split('?').next().unwrap_or("/");
                let (status, content_type, body) = routes
                    .iter()
                    .find(|r| r.0 == path)
                    .map(|r| (r.1, r.2, r.3.clone()))
                    .unwrap_or((404, "text/plain", b"missing".to_vec()));
                let head = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        addr.to_string()
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbaImage::from_pixel(6, 6, Rgba([10, 200, 10, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn service() -> FetchService {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        FetchService::from_client(client, 4).unwrap()
    }

    #[test]
    fn test_locate_logo_img_by_alt_or_src() {
        let locator = LogoLocator::new().unwrap();
        let html = r#"<html><img src="/hero.jpg" alt="Hero">
            <IMG class="x" ALT='ACME Logo' src='/img/a.png'>
            <img src="/assets/logo-dark.svg"></html>"#;
        assert_eq!(locator.locate(html).as_deref(), Some("/img/a.png"));

        let by_src = r#"<img alt="" src="https://cdn.example.com/Logo.PNG?x=1">"#;
        assert_eq!(
            locator.locate(by_src).as_deref(),
            Some("https://cdn.example.com/Logo.PNG?x=1")
        );
    }

    #[test]
    fn test_locate_falls_back_to_favicon() {
        let locator = LogoLocator::new().unwrap();
        let html = r#"<head><link rel="stylesheet" href="/s.css">
            <link rel="shortcut icon" href="/favicon.ico"></head><img src="/hero.jpg">"#;
        assert_eq!(locator.locate(html).as_deref(), Some("/favicon.ico"));
    }

    #[test]
    fn test_locate_nothing() {
        let locator = LogoLocator::new().unwrap();
        assert_eq!(locator.locate("<html><img src=\"/a.jpg\"></html>"), None);
        assert_eq!(locator.locate(""), None);
    }

    #[test]
    fn test_url_extension() {
        let url = Url::parse("https://x.com/a/b/brand.SVG?v=2").unwrap();
        assert_eq!(url_extension(&url).as_deref(), Some("svg"));
        let bare = Url::parse("https://x.com/logo").unwrap();
        assert_eq!(url_extension(&bare), None);
    }

    #[test]
    fn test_read_domain_list() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("domains.csv");
        fs::write(&path, "domain\nacme.com\n\n# comment\nzeta.io,extra\n").unwrap();
        assert_eq!(read_domain_list(&path).unwrap(), vec!["acme.com", "zeta.io"]);
    }

    #[test]
    fn test_fetch_domain_downloads_logo() {
        let host = serve(vec![
            (
                "/",
                200,
                "text/html",
                br#"<html><img alt="Our logo" src="/static/brand.png?v=3"></html>"#.to_vec(),
            ),
            ("/static/brand.png", 200, "image/png", png_bytes()),
        ]);
        let temp_dir = TempDir::new().unwrap();

        let asset = service().fetch_domain(&host, temp_dir.path()).unwrap();
        assert_eq!(asset.domain, host);
        assert_eq!(asset.format, LogoFormat::Png);
        assert_eq!(asset.path, temp_dir.path().join(format!("{host}.png")));
        assert_eq!(asset.size_bytes, png_bytes().len() as u64);
        assert!(image::open(&asset.path).is_ok());
    }

    #[test]
    fn test_fetch_domain_sniffs_extensionless_logo() {
        let host = serve(vec![
            ("/", 200, "text/html", br#"<link rel="icon" href="/brand">"#.to_vec()),
            ("/brand", 200, "application/octet-stream", png_bytes()),
        ]);
        let temp_dir = TempDir::new().unwrap();

        let asset = service().fetch_domain(&host, temp_dir.path()).unwrap();
        assert_eq!(asset.format, LogoFormat::Png);
    }

    #[test]
    fn test_fetch_domain_failures() {
        let host = serve(vec![("/", 200, "text/html", b"<html>no images</html>".to_vec())]);
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            service().fetch_domain(&host, temp_dir.path()),
            Err(FetchError::NoLogo { .. })
        ));

        let missing = serve(vec![]);
        assert!(matches!(
            service().fetch_domain(&missing, temp_dir.path()),
            Err(FetchError::Status { status: 404, .. })
        ));
    }

    #[test]
    fn test_fetch_all_isolates_failures_and_reuses_files() {
        let good = serve(vec![
            ("/", 200, "text/html", br#"<img src="/logo.png">"#.to_vec()),
            ("/logo.png", 200, "image/png", png_bytes()),
        ]);
        let bad = serve(vec![]);
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("cached.org.png"), png_bytes()).unwrap();

        let domains = vec![
            bad.clone(),
            "cached.org".to_string(),
            good.clone(),
            good.clone(),
        ];
        let report = service().fetch_all(&domains, temp_dir.path(), false).unwrap();

        let fetched: Vec<_> = report.assets.iter().map(|a| a.domain.as_str()).collect();
        assert_eq!(fetched, vec!["cached.org", good.as_str()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, bad);
        assert_eq!(report.failures[0].stage, Stage::Fetch);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_fetch_all_prefix_prefilter_skips_known_brands() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("acme.com.png"), png_bytes()).unwrap();

        let domains = vec!["acme.com".to_string(), "acme-eu.com".to_string()];
        let report = service().fetch_all(&domains, temp_dir.path(), true).unwrap();

        assert_eq!(report.assets.len(), 1);
        assert_eq!(report.skipped, vec!["acme-eu.com"]);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_fetch_all_rejects_path_like_domains() {
        let temp_dir = TempDir::new().unwrap();
        let out_dir = temp_dir.path().join("logos/out");
        let domains = vec![
            "x/../../escaped".to_string(),
            "..".to_string(),
            "a\\b.com".to_string(),
            String::new(),
        ];

        let report = service().fetch_all(&domains, &out_dir, false).unwrap();

        assert!(report.assets.is_empty());
        assert_eq!(report.failures.len(), 4);
        assert!(report.failures.iter().all(|f| f.reason.starts_with("Invalid domain name")));
        assert!(!temp_dir.path().join("logos/escaped.png").exists());
        assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_check_domain_allows_hosts_with_ports() {
        assert!(check_domain("acme-shop.co.uk").is_ok());
        assert!(check_domain("127.0.0.1:8080").is_ok());
        assert!(matches!(check_domain("a/b"), Err(FetchError::InvalidDomain(d)) if d == "a/b"));
    }
}
