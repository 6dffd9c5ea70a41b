//! Pure planning helpers
//!
//! Everything the phases decide without touching the system: list splitting,
//! answer interpretation, the service patch cross product, the clean-up
//! allow-list and the threaded host rewrite.

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::{DeployConfig, Settings};

/// First DNS label of a host name (`cmsweb-testbed.cern.ch` → `cmsweb-testbed`)
pub fn truncate_host(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

/// Split a space separated flag value, keeping order and dropping blanks
pub fn split_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(|s| s.to_string()).collect()
}

/// True when an answer to a proceed gate means "stop"
pub fn declines(answer: &str) -> bool {
    matches!(answer.trim().chars().next(), Some('n') | Some('N'))
}

/// True when an answer to an opt-in gate means "go ahead"
pub fn opts_in(answer: &str) -> bool {
    matches!(answer.trim().chars().next(), Some('y') | Some('Y'))
}

/// One download+apply operation against an installed service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePatch {
    pub service: String,
    pub patch: String,
}

/// Service × patch cross product, service as the outer loop
///
/// Empty unless both lists were supplied.
pub fn service_patch_plan(config: &DeployConfig) -> Vec<ServicePatch> {
    config
        .service_names
        .iter()
        .flat_map(|service| {
            config.service_patches.iter().map(move |patch| ServicePatch {
                service: service.clone(),
                patch: patch.clone(),
            })
        })
        .collect()
}

/// Work dir entries the clean step deletes
///
/// Hidden entries and `always_removed` go; entries starting with a preserved
/// prefix stay; everything else goes.
pub fn removable_entries<'a>(names: &'a [String], settings: &Settings) -> Vec<&'a str> {
    names
        .iter()
        .map(String::as_str)
        .filter(|name| !matches!(*name, "." | ".."))
        .filter(|name| {
            if name.starts_with('.') || settings.always_removed.iter().any(|r| r == name) {
                return true;
            }
            !settings
                .preserved_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
        })
        .collect()
}

/// Name an existing checkout is archived under
pub fn archive_name(now: DateTime<Utc>) -> String {
    format!("cfg.{}", now.timestamp())
}

/// Result of rewriting one config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadingRewrite {
    /// File content after the rewrite
    pub content: String,
    /// Lines holding the host condition after the rewrite
    pub matched_lines: Vec<String>,
    /// Whether anything changed
    pub changed: bool,
}

/// Extend `HOST.startswith("<anchor>")` conditions with `host`
///
/// Conditions already naming `host` are left alone, so running the phase
/// twice does not stack clauses.
pub fn enable_threading(text: &str, anchor: &str, host: &str) -> Result<ThreadingRewrite, regex::Error> {
    let condition = format!(r#"HOST\.startswith\(["']{}["']\)"#, regex::escape(anchor));
    let pattern = Regex::new(&condition)?;
    let host_clause = format!(r#"HOST.startswith("{}")"#, host);

    let mut changed = false;
    let mut lines = Vec::new();
    for line in text.split_inclusive('\n') {
        if pattern.is_match(line) && !line.contains(&host_clause) {
            let replaced = pattern.replace_all(line, |caps: &regex::Captures| {
                format!("{} or {}", &caps[0], host_clause)
            });
            lines.push(replaced.into_owned());
            changed = true;
        } else {
            lines.push(line.to_string());
        }
    }

    let content = lines.concat();
    let matched_lines = content
        .lines()
        .filter(|line| pattern.is_match(line))
        .map(|line| line.trim().to_string())
        .collect();

    Ok(ThreadingRewrite {
        content,
        matched_lines,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_host() {
        assert_eq!(truncate_host("foo.bar.baz"), "foo");
        assert_eq!(truncate_host("cmsweb-testbed.cern.ch"), "cmsweb-testbed");
        assert_eq!(truncate_host("localhost"), "localhost");
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("5906 5934"), vec!["5906", "5934"]);
        assert_eq!(split_list("  10003   10004 "), vec!["10003", "10004"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_answers() {
        assert!(declines("n"));
        assert!(declines("No\n"));
        assert!(!declines(""));
        assert!(!declines("y"));
        assert!(!declines("whatever"));

        assert!(opts_in("y"));
        assert!(opts_in("Yes"));
        assert!(!opts_in(""));
        assert!(!opts_in("n"));
    }

    #[test]
    fn test_service_patch_plan_is_service_major() {
        let config = DeployConfig::new("host", "HG1908a").with_service_patches(
            split_list("reqmgr2 reqmgr2ms"),
            split_list("10003 10004"),
        );
        let plan: Vec<_> = service_patch_plan(&config)
            .into_iter()
            .map(|p| format!("{}:{}", p.service, p.patch))
            .collect();
        assert_eq!(
            plan,
            vec![
                "reqmgr2:10003",
                "reqmgr2:10004",
                "reqmgr2ms:10003",
                "reqmgr2ms:10004"
            ]
        );
    }

    #[test]
    fn test_service_patch_plan_needs_both_lists() {
        let config = DeployConfig::new("host", "HG1908a")
            .with_service_patches(split_list("reqmgr2"), Vec::new());
        assert!(service_patch_plan(&config).is_empty());
    }

    #[test]
    fn test_removable_entries() {
        let settings = Settings::default();
        let names: Vec<String> = [
            "admin", "auth", "certs", "cfg", "current", "enabled", "srv", "tmp", ".bashrc",
            "user", "logs",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let removed = removable_entries(&names, &settings);
        assert_eq!(
            removed,
            vec!["current", "enabled", "srv", "tmp", ".bashrc", "logs"]
        );
    }

    #[test]
    fn test_archive_name() {
        let now = Utc.timestamp_opt(1_565_000_000, 0).unwrap();
        assert_eq!(archive_name(now), "cfg.1565000000");
    }

    #[test]
    fn test_enable_threading_adds_host() {
        let text = "if HOST.startswith(\"vocms0117\"):\n    config.threaded = True\n";
        let rewrite = enable_threading(text, "vocms0117", "cmsweb-testbed").unwrap();
        assert!(rewrite.changed);
        assert_eq!(
            rewrite.content,
            "if HOST.startswith(\"vocms0117\") or HOST.startswith(\"cmsweb-testbed\"):\n    config.threaded = True\n"
        );
        assert_eq!(rewrite.matched_lines.len(), 1);
    }

    #[test]
    fn test_enable_threading_is_stable() {
        let text = "if HOST.startswith(\"vocms0117\"):\n";
        let once = enable_threading(text, "vocms0117", "myvm").unwrap();
        let twice = enable_threading(&once.content, "vocms0117", "myvm").unwrap();
        assert!(!twice.changed);
        assert_eq!(once.content, twice.content);
    }

    #[test]
    fn test_enable_threading_without_anchor() {
        let rewrite = enable_threading("PORT = 8246\n", "vocms0117", "myvm").unwrap();
        assert!(!rewrite.changed);
        assert!(rewrite.matched_lines.is_empty());
    }
}
