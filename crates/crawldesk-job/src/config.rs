use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;

use crate::JobKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobConfigError {
    #[error("No URL provided")]
    MissingStartingUrl,
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Invalid URL scheme, must be http or https")]
    InvalidScheme,
    #[error("Empty URL host")]
    EmptyHost,
    #[error("Invalid URL host, must start with www.")]
    HostMissingWww,
    #[error("Invalid Crawl URL")]
    InvalidCrawlUrl,
    #[error("invalid value for {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Configuration artifact handed to the external crawl worker (`-c <path>`).
///
/// Field names are the worker's JSON contract and must not change.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobConfig {
    pub starting_url: String,
    pub permitted_domains: Vec<String>,
    pub blacklist_domains: Vec<String>,
    pub rotate_user_agents: bool,
    pub respect_robots: bool,
    pub free_crawl: bool,
    pub max_urls_to_visit: u32,
    pub max_threads: u32,
    pub crawler_timeout: u64,
    pub crawler_request_timeout: u64,
    pub crawler_request_delay_ms: u64,
    pub collect_html: bool,
    pub collect_images: bool,
    pub debug: bool,
    pub live_logging: bool,
    pub sqlite_enabled: bool,
    pub sqlite_path: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            starting_url: String::new(),
            permitted_domains: Vec::new(),
            blacklist_domains: Vec::new(),
            rotate_user_agents: true,
            respect_robots: true,
            free_crawl: true,
            max_urls_to_visit: 5,
            max_threads: 10,
            crawler_timeout: 3600,
            crawler_request_timeout: 60,
            crawler_request_delay_ms: 1000,
            collect_html: false,
            collect_images: false,
            debug: false,
            live_logging: false,
            sqlite_enabled: true,
            sqlite_path: String::new(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, JobConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| JobConfigError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

fn checked(value: &str) -> bool {
    value == "on"
}

impl JobConfig {
    /// Builds a config from submitted dashboard form fields.
    ///
    /// Checkboxes are absent from the form when unchecked, so every toggle the
    /// form controls starts out false.
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self, JobConfigError> {
        let mut cfg = Self {
            rotate_user_agents: false,
            respect_robots: false,
            free_crawl: false,
            collect_html: false,
            ..Self::default()
        };

        for (key, value) in form {
            match key.as_str() {
                "StartingURL" => cfg.starting_url = JobKey::normalize(value).to_string(),
                "PermittedDomains" => cfg.permitted_domains = split_list(value),
                "BlacklistDomains" => cfg.blacklist_domains = split_list(value),
                "RotateUserAgents" => cfg.rotate_user_agents = checked(value),
                "RespectRobots" => cfg.respect_robots = checked(value),
                "FreeCrawl" => cfg.free_crawl = checked(value),
                "CollectHTML" => cfg.collect_html = checked(value),
                "CollectImages" => cfg.collect_images = checked(value),
                "MaxURLsToVisit" => cfg.max_urls_to_visit = parse_number("MaxURLsToVisit", value)?,
                "CrawlerTimeout" => cfg.crawler_timeout = parse_number("CrawlerTimeout", value)?,
                "CrawlerRequestTimeout" => {
                    cfg.crawler_request_timeout = parse_number("CrawlerRequestTimeout", value)?
                }
                "CrawlerRequestDelayMs" => {
                    cfg.crawler_request_delay_ms = parse_number("CrawlerRequestDelayMs", value)?
                }
                _ => {}
            }
        }

        if !cfg.free_crawl && !cfg.starting_url.is_empty() && cfg.permitted_domains.is_empty() {
            cfg.permitted_domains = vec![default_permitted_domain(&cfg.starting_url)];
        }

        Ok(cfg)
    }

    /// Validates the starting URL and returns the key the job is tracked under.
    pub fn job_key(&self) -> Result<JobKey, JobConfigError> {
        let key = JobKey::normalize(&self.starting_url);
        validate_starting_url(key.as_str())?;
        Ok(key)
    }
}

fn default_permitted_domain(starting_url: &str) -> String {
    let host = starting_url
        .strip_prefix("https://")
        .or_else(|| starting_url.strip_prefix("http://"))
        .unwrap_or(starting_url);
    if host.starts_with("www.") {
        host.to_string()
    } else {
        format!("www.{host}")
    }
}

fn crawl_url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://www\.[\w.-]+\.[A-Za-z]{2,}$").expect("static crawl url pattern")
    })
}

pub fn validate_starting_url(starting_url: &str) -> Result<(), JobConfigError> {
    if starting_url.trim().is_empty() {
        return Err(JobConfigError::MissingStartingUrl);
    }
    let parsed = url::Url::parse(starting_url).map_err(|_| JobConfigError::InvalidUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(JobConfigError::InvalidScheme);
    }
    let host = parsed.host_str().unwrap_or_default();
    if host.is_empty() {
        return Err(JobConfigError::EmptyHost);
    }
    if !host.starts_with("www.") {
        return Err(JobConfigError::HostMissingWww);
    }
    if !crawl_url_pattern().is_match(starting_url) {
        return Err(JobConfigError::InvalidCrawlUrl);
    }
    Ok(())
}
